// Fixture PDFs built with lopdf, plus configs tuned for them
#![allow(dead_code)]

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use rifugio_monitor::config::{ColorConfig, ColorReference, ExtractionConfig, GridCrop, MonitorConfig};
use rifugio_monitor::AvailabilityStatus;

pub const PAGE_HEIGHT: i64 = 792;
pub const FIRST_COLUMN_X: i64 = 40;
pub const COLUMN_PITCH: i64 = 18;
pub const WEEKDAYS: [&str; 7] = ["Mo", "Di", "Mi", "Do", "Fr", "Sa", "So"];

/// Left edge of the date text for `day`.
pub fn column_x(day: u32) -> i64 {
    FIRST_COLUMN_X + (day as i64 - 1) * COLUMN_PITCH
}

pub fn text(x: i64, y: i64, s: &str) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), 8.into()]),
        Operation::new("Td", vec![x.into(), y.into()]),
        Operation::new("Tj", vec![Object::string_literal(s)]),
        Operation::new("ET", vec![]),
    ]
}

/// Filled rectangle in integer 0..=255 RGB.
pub fn filled_rect(x: i64, y: i64, w: i64, h: i64, rgb: [u8; 3]) -> Vec<Operation> {
    let channel = |c: u8| Object::from(c as f32 / 255.0);
    vec![
        Operation::new("q", vec![]),
        Operation::new("rg", vec![channel(rgb[0]), channel(rgb[1]), channel(rgb[2])]),
        Operation::new("re", vec![x.into(), y.into(), w.into(), h.into()]),
        Operation::new("f", vec![]),
        Operation::new("Q", vec![]),
    ]
}

/// Fill covering the status cell under `day` in a [`september_table`] layout.
pub fn status_fill(day: u32, rgb: [u8; 3]) -> Vec<Operation> {
    filled_rect(column_x(day) - 5, 672, COLUMN_PITCH, 21, rgb)
}

/// Header, weekday row and date row of September, with optional status words.
pub fn september_table(statuses: &[(u32, &str)]) -> Vec<Operation> {
    let mut ops = text(FIRST_COLUMN_X, 760, "September / Settembre");
    for day in 1..=30u32 {
        ops.extend(text(column_x(day), 720, WEEKDAYS[(day as usize - 1) % 7]));
        ops.extend(text(column_x(day), 700, &day.to_string()));
    }
    for (day, status) in statuses {
        ops.extend(text(column_x(*day), 680, status));
    }
    ops
}

/// A US Letter single-page PDF with the given content and image XObjects.
pub fn pdf_with(operations: Vec<Operation>, images: Vec<(&str, Stream)>) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut xobjects = Dictionary::new();
    for (name, stream) in images {
        let id = doc.add_object(stream);
        xobjects.set(name, id);
    }

    let content = Content { operations };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => dictionary! {
            "Font" => dictionary! { "F1" => font_id },
            "XObject" => xobjects,
        },
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), PAGE_HEIGHT.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// The scanned-calendar case: no text layer, one image row of 31 day cells
/// drawn at x 40..598, y 600..620. Every cell is white except `painted`.
pub fn image_calendar_pdf(painted: &[(u32, [u8; 3])]) -> Vec<u8> {
    let mut pixels = vec![255u8; 31 * 3];
    for (day, rgb) in painted {
        let offset = (*day as usize - 1) * 3;
        pixels[offset..offset + 3].copy_from_slice(rgb);
    }
    let image = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 31,
            "Height" => 1,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        pixels,
    );
    let ops = vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![(31 * COLUMN_PITCH).into(), 0.into(), 0.into(), 20.into(), FIRST_COLUMN_X.into(), 600.into()],
        ),
        Operation::new("Do", vec!["Im1".into()]),
        Operation::new("Q", vec![]),
    ];
    pdf_with(ops, vec![("Im1", image)])
}

/// Crop matching [`image_calendar_pdf`], measured from the top-left corner.
pub fn image_calendar_grid() -> GridCrop {
    GridCrop {
        page: 0,
        x: FIRST_COLUMN_X as f32,
        y: (PAGE_HEIGHT - 620) as f32,
        cell_width: COLUMN_PITCH as f32,
        cell_height: 20.0,
        first_day: 1,
        columns: 31,
        row_pitch: None,
    }
}

/// Default extraction with OCR off, so tests never shell out.
pub fn offline_extraction() -> ExtractionConfig {
    let mut config = ExtractionConfig::default();
    config.ocr.enabled = false;
    config
}

/// Only one reference: darker green, accepted within 80.
pub fn green_only_colors() -> ColorConfig {
    ColorConfig {
        threshold: 80.0,
        references: vec![ColorReference::new(AvailabilityStatus::Available, [0, 200, 0])],
    }
}

pub fn offline_monitor_config(state_path: &std::path::Path) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.extraction = offline_extraction();
    config.state.path = state_path.to_path_buf();
    config
}
