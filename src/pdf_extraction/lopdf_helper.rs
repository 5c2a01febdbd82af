// lopdf helper - Pure Rust PDF operations
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::types::ExtractionError;

// The PDF header may be preceded by junk, but only within the first KiB
const HEADER_WINDOW: usize = 1024;
// Depth limit when walking inherited page attributes
const MAX_PARENT_DEPTH: usize = 32;

/// Load a PDF document from untrusted bytes.
pub fn load_pdf(bytes: &[u8]) -> Result<Document, ExtractionError> {
    if bytes.is_empty() {
        return Err(ExtractionError::CorruptInput("empty input".to_string()));
    }
    let window = &bytes[..bytes.len().min(HEADER_WINDOW)];
    if !window.windows(5).any(|w| w == b"%PDF-") {
        return Err(ExtractionError::CorruptInput("missing %PDF header".to_string()));
    }

    let document = Document::load_mem(bytes)
        .map_err(|e| ExtractionError::CorruptInput(format!("unparsable PDF: {}", e)))?;
    if document.get_pages().is_empty() {
        return Err(ExtractionError::CorruptInput("PDF has no pages".to_string()));
    }
    Ok(document)
}

/// Page object ids in page order.
pub fn page_ids(document: &Document) -> Vec<ObjectId> {
    document.get_pages().into_values().collect()
}

/// Decoded content stream operations of a page.
pub fn page_operations(document: &Document, page_id: ObjectId) -> Result<Vec<Operation>, ExtractionError> {
    let data = document
        .get_page_content(page_id)
        .map_err(|e| ExtractionError::CorruptInput(format!("unreadable page content: {}", e)))?;
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let content = Content::decode(&data)
        .map_err(|e| ExtractionError::CorruptInput(format!("undecodable page content: {}", e)))?;
    Ok(content.operations)
}

/// Visible page area in PDF user space (y grows upwards).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl PageBox {
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
}

impl Default for PageBox {
    // US Letter
    fn default() -> Self {
        Self { x0: 0.0, y0: 0.0, x1: 612.0, y1: 792.0 }
    }
}

/// CropBox, else MediaBox, following inheritance through the page tree.
pub fn page_box(document: &Document, page_id: ObjectId) -> PageBox {
    for key in [b"CropBox".as_slice(), b"MediaBox".as_slice()] {
        if let Some(Object::Array(values)) = inherited(document, page_id, key) {
            let numbers: Vec<f32> = values
                .iter()
                .filter_map(|v| number(resolve(document, v)))
                .collect();
            if let [a, b, c, d] = numbers[..] {
                let page = PageBox {
                    x0: a.min(c),
                    y0: b.min(d),
                    x1: a.max(c),
                    y1: b.max(d),
                };
                if page.width() > 0.0 && page.height() > 0.0 {
                    return page;
                }
            }
        }
    }
    PageBox::default()
}

/// The page's resource dictionary, possibly inherited.
pub fn page_resources(document: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    inherited(document, page_id, b"Resources").and_then(|obj| obj.as_dict().ok())
}

/// Look up a named entry of a resource category (e.g. XObject, Font).
pub fn resource<'a>(
    document: &'a Document,
    resources: &'a Dictionary,
    category: &[u8],
    name: &[u8],
) -> Option<&'a Object> {
    let category = resolve(document, resources.get(category).ok()?).as_dict().ok()?;
    Some(resolve(document, category.get(name).ok()?))
}

fn inherited<'a>(document: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut dict = document.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_PARENT_DEPTH {
        if let Ok(value) = dict.get(key) {
            return Some(resolve(document, value));
        }
        let parent = dict.get(b"Parent").ok()?.as_reference().ok()?;
        dict = document.get_dictionary(parent).ok()?;
    }
    None
}

/// Follow a reference chain to the underlying object.
pub fn resolve<'a>(document: &'a Document, object: &'a Object) -> &'a Object {
    let mut current = object;
    for _ in 0..MAX_PARENT_DEPTH {
        match current {
            Object::Reference(id) => match document.get_object(*id) {
                Ok(target) => current = target,
                Err(_) => break,
            },
            _ => break,
        }
    }
    current
}

pub fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(f) => Some(*f as f32),
        _ => None,
    }
}

/// All operands as numbers, or None if any is not numeric.
pub fn operand_numbers(operands: &[Object]) -> Option<Vec<f32>> {
    operands.iter().map(number).collect()
}

/// Affine matrix in PDF order `[a b c d e f]`, row-vector convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix { a: 1.0, b: 0.0, c: 0.0, d: 1.0, e: 0.0, f: 0.0 };

    pub fn from_operands(values: &[f32]) -> Option<Matrix> {
        match *values {
            [a, b, c, d, e, f] => Some(Matrix { a, b, c, d, e, f }),
            _ => None,
        }
    }

    pub fn translate(tx: f32, ty: f32) -> Matrix {
        Matrix { e: tx, f: ty, ..Matrix::IDENTITY }
    }

    /// `self` applied first, then `other`.
    pub fn then(&self, other: &Matrix) -> Matrix {
        Matrix {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            e: self.e * other.a + self.f * other.c + other.e,
            f: self.e * other.b + self.f * other.d + other.f,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (self.a * x + self.c * y + self.e, self.b * x + self.d * y + self.f)
    }

    pub fn vertical_scale(&self) -> f32 {
        self.c.hypot(self.d)
    }
}
