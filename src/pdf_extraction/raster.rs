// CPU PDF renderer - fills, strokes and image XObjects via tiny-skia
//
// Only what calendar cells need is drawn: solid-color paths and embedded
// images. Text is not rasterized; glyph outlines would only add noise to the
// cell samples.
use image::{GrayImage, ImageBuffer, RgbImage};
use lopdf::content::Operation;
use lopdf::{Document, Object, ObjectId, Stream};
use tiny_skia::{
    Color, FillRule, FilterQuality, IntSize, Paint, Path, PathBuilder, Pixmap, PixmapPaint, Rect,
    Stroke, Transform,
};
use tracing::{debug, warn};

use super::color::PixelRect;
use super::lopdf_helper::{
    number, operand_numbers, page_box, page_resources, resolve, resource, Matrix, PageBox,
};
use crate::types::ExtractionError;

// Hostile MediaBoxes must not turn into gigapixel allocations
const MAX_DIMENSION: f32 = 8000.0;

/// A rendered page plus a mask of every pixel something was painted on.
#[derive(Debug, Clone)]
pub struct PageRaster {
    pub image: RgbImage,
    pub coverage: GrayImage,
    pub scale: f32,
    pub page_box: PageBox,
}

impl PageRaster {
    /// Pixel rectangle of a PDF-space box given as (left, bottom, right, top).
    pub fn pdf_rect(&self, rect: (f32, f32, f32, f32)) -> Option<PixelRect> {
        let (left, bottom, right, top) = rect;
        let to_x = |x: f32| (x - self.page_box.x0) * self.scale;
        let to_y = |y: f32| (self.page_box.y1 - y) * self.scale;
        PixelRect::clipped(
            to_x(left),
            to_y(top),
            to_x(right),
            to_y(bottom),
            self.image.width(),
            self.image.height(),
        )
    }

    /// Pixel rectangle of a box measured in points from the top-left corner.
    pub fn top_left_rect(&self, x: f32, y: f32, width: f32, height: f32) -> Option<PixelRect> {
        PixelRect::clipped(
            x * self.scale,
            y * self.scale,
            (x + width) * self.scale,
            (y + height) * self.scale,
            self.image.width(),
            self.image.height(),
        )
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Clone, Copy)]
struct GraphicsState {
    ctm: Matrix,
    fill: [u8; 3],
    stroke: [u8; 3],
    line_width: f32,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            ctm: Matrix::IDENTITY,
            fill: [0, 0, 0],
            stroke: [0, 0, 0],
            line_width: 1.0,
        }
    }
}

struct Renderer<'a> {
    document: &'a Document,
    page_id: ObjectId,
    pixmap: Pixmap,
    coverage: Pixmap,
    page_transform: Transform,
    state: GraphicsState,
    stack: Vec<GraphicsState>,
    path: PathBuilder,
    current: (f32, f32),
}

/// Render one page at `dpi`.
pub fn render_page(
    document: &Document,
    page_id: ObjectId,
    operations: &[Operation],
    dpi: f32,
) -> Result<PageRaster, ExtractionError> {
    let page_box = page_box(document, page_id);
    let mut scale = dpi / 72.0;
    let longest = page_box.width().max(page_box.height());
    if longest * scale > MAX_DIMENSION {
        scale = MAX_DIMENSION / longest;
        debug!(dpi, scale, "clamped render scale");
    }

    let width = (page_box.width() * scale).ceil().max(1.0) as u32;
    let height = (page_box.height() * scale).ceil().max(1.0) as u32;
    let too_large =
        || ExtractionError::CorruptInput(format!("cannot allocate a {}x{} page", width, height));
    let mut pixmap = Pixmap::new(width, height).ok_or_else(too_large)?;
    pixmap.fill(Color::WHITE);
    let coverage = Pixmap::new(width, height).ok_or_else(too_large)?;

    // PDF space (y up) -> pixel space (y down)
    let page_transform = Transform::from_row(
        scale,
        0.0,
        0.0,
        -scale,
        -page_box.x0 * scale,
        page_box.y1 * scale,
    );

    let mut renderer = Renderer {
        document,
        page_id,
        pixmap,
        coverage,
        page_transform,
        state: GraphicsState::default(),
        stack: Vec::new(),
        path: PathBuilder::new(),
        current: (0.0, 0.0),
    };
    for op in operations {
        renderer.apply(op);
    }

    Ok(PageRaster {
        image: to_rgb(&renderer.pixmap),
        coverage: to_mask(&renderer.coverage),
        scale,
        page_box,
    })
}

impl Renderer<'_> {
    fn apply(&mut self, op: &Operation) {
        let numbers = operand_numbers(&op.operands);
        match (op.operator.as_str(), numbers.as_deref()) {
            ("q", _) => self.stack.push(self.state),
            ("Q", _) => {
                if let Some(state) = self.stack.pop() {
                    self.state = state;
                }
            }
            ("cm", Some(values)) => {
                if let Some(m) = Matrix::from_operands(values) {
                    self.state.ctm = m.then(&self.state.ctm);
                }
            }
            ("w", Some([width])) => self.state.line_width = *width,

            ("rg", Some(values)) | ("sc", Some(values)) | ("scn", Some(values)) => {
                if let Some(rgb) = device_color(values) {
                    self.state.fill = rgb;
                }
            }
            ("g", Some(values)) | ("k", Some(values)) => {
                if let Some(rgb) = device_color(values) {
                    self.state.fill = rgb;
                }
            }
            ("RG", Some(values)) | ("SC", Some(values)) | ("SCN", Some(values)) => {
                if let Some(rgb) = device_color(values) {
                    self.state.stroke = rgb;
                }
            }
            ("G", Some(values)) | ("K", Some(values)) => {
                if let Some(rgb) = device_color(values) {
                    self.state.stroke = rgb;
                }
            }

            ("m", Some([x, y])) => {
                self.path.move_to(*x, *y);
                self.current = (*x, *y);
            }
            ("l", Some([x, y])) => {
                self.path.line_to(*x, *y);
                self.current = (*x, *y);
            }
            ("c", Some([x1, y1, x2, y2, x3, y3])) => {
                self.path.cubic_to(*x1, *y1, *x2, *y2, *x3, *y3);
                self.current = (*x3, *y3);
            }
            ("v", Some([x2, y2, x3, y3])) => {
                let (x1, y1) = self.current;
                self.path.cubic_to(x1, y1, *x2, *y2, *x3, *y3);
                self.current = (*x3, *y3);
            }
            ("y", Some([x1, y1, x3, y3])) => {
                self.path.cubic_to(*x1, *y1, *x3, *y3, *x3, *y3);
                self.current = (*x3, *y3);
            }
            ("h", _) => self.path.close(),
            ("re", Some([x, y, w, h])) => {
                // negative sizes are legal; normalize for tiny-skia
                let (left, width) = if *w < 0.0 { (x + w, -w) } else { (*x, *w) };
                let (bottom, height) = if *h < 0.0 { (y + h, -h) } else { (*y, *h) };
                if let Some(rect) = Rect::from_xywh(left, bottom, width, height) {
                    self.path.push_rect(rect);
                }
                self.current = (*x, *y);
            }

            ("f", _) | ("F", _) => self.paint(Some(FillRule::Winding), false, false),
            ("f*", _) => self.paint(Some(FillRule::EvenOdd), false, false),
            ("S", _) => self.paint(None, true, false),
            ("s", _) => self.paint(None, true, true),
            ("B", _) => self.paint(Some(FillRule::Winding), true, false),
            ("B*", _) => self.paint(Some(FillRule::EvenOdd), true, false),
            ("b", _) => self.paint(Some(FillRule::Winding), true, true),
            ("b*", _) => self.paint(Some(FillRule::EvenOdd), true, true),
            ("n", _) => self.path = PathBuilder::new(),

            ("Do", _) => {
                if let Some(Object::Name(name)) = op.operands.first() {
                    self.draw_xobject(name);
                }
            }
            _ => {}
        }
    }

    fn device_transform(&self) -> Transform {
        let m = self.state.ctm;
        self.page_transform
            .pre_concat(Transform::from_row(m.a, m.b, m.c, m.d, m.e, m.f))
    }

    fn paint(&mut self, fill: Option<FillRule>, stroke: bool, close: bool) {
        if close {
            self.path.close();
        }
        let builder = std::mem::replace(&mut self.path, PathBuilder::new());
        let Some(path) = builder.finish() else {
            return;
        };
        let transform = self.device_transform();

        if let Some(rule) = fill {
            let [r, g, b] = self.state.fill;
            self.fill_path(&path, r, g, b, rule, transform);
        }
        if stroke {
            let [r, g, b] = self.state.stroke;
            self.stroke_path(&path, r, g, b, transform);
        }
    }

    fn fill_path(&mut self, path: &Path, r: u8, g: u8, b: u8, rule: FillRule, transform: Transform) {
        let mut paint = Paint::default();
        paint.set_color_rgba8(r, g, b, 255);
        paint.anti_alias = true;
        self.pixmap.fill_path(path, &paint, rule, transform, None);
        self.coverage.fill_path(path, &coverage_paint(), rule, transform, None);
    }

    fn stroke_path(&mut self, path: &Path, r: u8, g: u8, b: u8, transform: Transform) {
        let mut paint = Paint::default();
        paint.set_color_rgba8(r, g, b, 255);
        paint.anti_alias = true;
        let stroke = Stroke {
            width: self.state.line_width.max(0.0),
            ..Stroke::default()
        };
        self.pixmap.stroke_path(path, &paint, &stroke, transform, None);
        self.coverage.stroke_path(path, &coverage_paint(), &stroke, transform, None);
    }

    fn draw_xobject(&mut self, name: &[u8]) {
        let Some(resources) = page_resources(self.document, self.page_id) else {
            return;
        };
        let Some(Object::Stream(stream)) = resource(self.document, resources, b"XObject", name) else {
            debug!(name = %String::from_utf8_lossy(name), "XObject not found");
            return;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .map(|subtype| subtype == b"Image")
            .unwrap_or(false);
        if !is_image {
            debug!(name = %String::from_utf8_lossy(name), "skipping non-image XObject");
            return;
        }

        match decode_image(self.document, stream) {
            Some(image) => self.draw_image(&image),
            None => warn!(name = %String::from_utf8_lossy(name), "could not decode embedded image"),
        }
    }

    fn draw_image(&mut self, image: &Pixmap) {
        let (w, h) = (image.width() as f32, image.height() as f32);
        // image space: unit square with the first row at the top
        let unit = Transform::from_row(1.0 / w, 0.0, 0.0, -1.0 / h, 0.0, 1.0);
        let transform = self.device_transform().pre_concat(unit);
        let paint = PixmapPaint {
            quality: FilterQuality::Nearest,
            ..PixmapPaint::default()
        };
        self.pixmap.draw_pixmap(0, 0, image.as_ref(), &paint, transform, None);

        if let Some(rect) = Rect::from_xywh(0.0, 0.0, w, h) {
            self.coverage.fill_rect(rect, &coverage_paint(), transform, None);
        }
    }
}

fn coverage_paint() -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(0, 0, 0, 255);
    paint.anti_alias = false;
    paint
}

/// Gray (1), RGB (3) or CMYK (4) components in 0..=1 as RGB bytes.
fn device_color(values: &[f32]) -> Option<[u8; 3]> {
    let byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    match *values {
        [gray] => Some([byte(gray); 3]),
        [r, g, b] => Some([byte(r), byte(g), byte(b)]),
        [c, m, y, k] => Some([
            byte((1.0 - c) * (1.0 - k)),
            byte((1.0 - m) * (1.0 - k)),
            byte((1.0 - y) * (1.0 - k)),
        ]),
        _ => None,
    }
}

fn filter_names(document: &Document, stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter").map(|f| resolve(document, f)) {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(names)) => names
            .iter()
            .filter_map(|n| n.as_name().ok().map(|n| n.to_vec()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Decode an image XObject into an opaque pixmap.
fn decode_image(document: &Document, stream: &Stream) -> Option<Pixmap> {
    let filters = filter_names(document, stream);

    let rgba: image::RgbaImage = if filters.iter().any(|f| f == b"DCTDecode" || f == b"JPXDecode") {
        image::load_from_memory(&stream.content).ok()?.to_rgba8()
    } else {
        let data = if filters.is_empty() {
            stream.content.clone()
        } else {
            stream.decompressed_content().ok()?
        };
        let dict = &stream.dict;
        let dimension = |key: &[u8]| {
            dict.get(key)
                .ok()
                .and_then(|v| number(resolve(document, v)))
                .map(|v| v as u32)
        };
        let width = dimension(b"Width")?;
        let height = dimension(b"Height")?;
        let bits = dimension(b"BitsPerComponent").unwrap_or(8);
        raw_to_rgba(&data, width, height, bits)?
    };

    let (width, height) = rgba.dimensions();
    let size = IntSize::from_wh(width, height)?;
    // opaque pixels are already premultiplied
    let opaque: Vec<u8> = rgba
        .into_raw()
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2], 255])
        .collect();
    Pixmap::from_vec(opaque, size)
}

/// Raw 8-bit samples; the component count is inferred from the data length.
fn raw_to_rgba(data: &[u8], width: u32, height: u32, bits: u32) -> Option<image::RgbaImage> {
    if bits != 8 || width == 0 || height == 0 {
        debug!(bits, width, height, "unsupported raw image layout");
        return None;
    }
    let pixels = (width as usize).checked_mul(height as usize)?;
    let components = data.len() / pixels;
    let rgba: Vec<u8> = match components {
        1 => data[..pixels].iter().flat_map(|&v| [v, v, v, 255]).collect(),
        3 => data[..pixels * 3]
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect(),
        4 => data[..pixels * 4]
            .chunks_exact(4)
            .flat_map(|px| {
                let k = 255 - px[3] as u32;
                let channel = |c: u8| ((255 - c as u32) * k / 255) as u8;
                [channel(px[0]), channel(px[1]), channel(px[2]), 255]
            })
            .collect(),
        _ => return None,
    };
    ImageBuffer::from_raw(width, height, rgba)
}

fn to_rgb(pixmap: &Pixmap) -> RgbImage {
    let rgb: Vec<u8> = pixmap
        .data()
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();
    // sizes always agree: both come from the same pixmap
    ImageBuffer::from_raw(pixmap.width(), pixmap.height(), rgb)
        .unwrap_or_else(|| RgbImage::new(pixmap.width(), pixmap.height()))
}

fn to_mask(pixmap: &Pixmap) -> GrayImage {
    let alpha: Vec<u8> = pixmap.data().chunks_exact(4).map(|px| px[3]).collect();
    ImageBuffer::from_raw(pixmap.width(), pixmap.height(), alpha)
        .unwrap_or_else(|| GrayImage::new(pixmap.width(), pixmap.height()))
}
