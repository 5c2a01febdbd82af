// Positioned text runs from a page content stream
use lopdf::content::Operation;
use lopdf::Object;

use super::lopdf_helper::{number, operand_numbers, Matrix};

// Rough glyph advance as a fraction of the font size; we never load font
// metrics, so positions after the first glyph of a run are estimates.
const AVG_GLYPH_WIDTH: f32 = 0.5;
// TJ adjustments (thousandths of an em) wider than this read as a space
const TJ_SPACE_THRESHOLD: f32 = 200.0;

/// A string shown by one text operator, positioned in page user space.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    /// Baseline origin, y grows upwards.
    pub x: f32,
    pub y: f32,
    /// Effective font size after text and graphics scaling.
    pub font_size: f32,
}

/// A whitespace-separated word of a run with its estimated x.
#[derive(Debug, Clone, PartialEq)]
pub struct TextToken<'a> {
    pub text: &'a str,
    pub x: f32,
}

impl TextRun {
    pub fn tokens(&self) -> Vec<TextToken<'_>> {
        let advance = self.font_size * AVG_GLYPH_WIDTH;
        let mut tokens = Vec::new();
        let mut start: Option<(usize, usize)> = None;

        for (char_index, (byte_index, ch)) in self.text.char_indices().enumerate() {
            match (ch.is_whitespace(), start) {
                (false, None) => start = Some((byte_index, char_index)),
                (true, Some((begin, begin_char))) => {
                    tokens.push(TextToken {
                        text: &self.text[begin..byte_index],
                        x: self.x + begin_char as f32 * advance,
                    });
                    start = None;
                }
                _ => {}
            }
        }
        if let Some((begin, begin_char)) = start {
            tokens.push(TextToken {
                text: &self.text[begin..],
                x: self.x + begin_char as f32 * advance,
            });
        }
        tokens
    }

    /// Estimated horizontal center of the run.
    pub fn center_x(&self) -> f32 {
        self.x + self.text.chars().count() as f32 * self.font_size * AVG_GLYPH_WIDTH / 2.0
    }
}

struct TextState {
    ctm: Matrix,
    stack: Vec<Matrix>,
    text_matrix: Matrix,
    line_matrix: Matrix,
    font_size: f32,
    leading: f32,
}

impl TextState {
    fn new() -> Self {
        Self {
            ctm: Matrix::IDENTITY,
            stack: Vec::new(),
            text_matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
            font_size: 12.0,
            leading: 0.0,
        }
    }

    fn move_line(&mut self, tx: f32, ty: f32) {
        self.line_matrix = Matrix::translate(tx, ty).then(&self.line_matrix);
        self.text_matrix = self.line_matrix;
    }

    fn show(&mut self, text: String, runs: &mut Vec<TextRun>) {
        let rendering = self.text_matrix.then(&self.ctm);
        let (x, y) = rendering.apply(0.0, 0.0);
        let glyphs = text.chars().count() as f32;
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            runs.push(TextRun {
                text: trimmed.to_string(),
                x,
                y,
                font_size: (self.font_size * rendering.vertical_scale()).abs(),
            });
        }
        let advance = glyphs * self.font_size * AVG_GLYPH_WIDTH;
        self.text_matrix = Matrix::translate(advance, 0.0).then(&self.text_matrix);
    }
}

/// Collect every shown string of a page in content order.
pub fn collect_text_runs(operations: &[Operation]) -> Vec<TextRun> {
    let mut state = TextState::new();
    let mut runs = Vec::new();

    for op in operations {
        let numbers = operand_numbers(&op.operands);
        match (op.operator.as_str(), numbers.as_deref()) {
            ("q", _) => state.stack.push(state.ctm),
            ("Q", _) => {
                if let Some(ctm) = state.stack.pop() {
                    state.ctm = ctm;
                }
            }
            ("cm", Some(values)) => {
                if let Some(m) = Matrix::from_operands(values) {
                    state.ctm = m.then(&state.ctm);
                }
            }
            ("BT", _) => {
                state.text_matrix = Matrix::IDENTITY;
                state.line_matrix = Matrix::IDENTITY;
            }
            ("Tf", _) => {
                if let Some(size) = op.operands.get(1).and_then(number) {
                    state.font_size = size;
                }
            }
            ("TL", Some([leading])) => state.leading = *leading,
            ("Td", Some([tx, ty])) => state.move_line(*tx, *ty),
            ("TD", Some([tx, ty])) => {
                state.leading = -*ty;
                state.move_line(*tx, *ty);
            }
            ("Tm", Some(values)) => {
                if let Some(m) = Matrix::from_operands(values) {
                    state.text_matrix = m;
                    state.line_matrix = m;
                }
            }
            ("T*", _) => {
                let leading = state.leading;
                state.move_line(0.0, -leading);
            }
            ("Tj", _) => {
                if let Some(text) = op.operands.first().and_then(decode_string) {
                    state.show(text, &mut runs);
                }
            }
            ("'", _) => {
                let leading = state.leading;
                state.move_line(0.0, -leading);
                if let Some(text) = op.operands.first().and_then(decode_string) {
                    state.show(text, &mut runs);
                }
            }
            ("\"", _) => {
                let leading = state.leading;
                state.move_line(0.0, -leading);
                if let Some(text) = op.operands.get(2).and_then(decode_string) {
                    state.show(text, &mut runs);
                }
            }
            ("TJ", _) => {
                if let Some(Object::Array(parts)) = op.operands.first() {
                    state.show(join_tj_array(parts), &mut runs);
                }
            }
            _ => {}
        }
    }

    runs
}

fn join_tj_array(parts: &[Object]) -> String {
    let mut text = String::new();
    for part in parts {
        if let Some(s) = decode_string(part) {
            text.push_str(&s);
        } else if let Some(adjust) = number(part) {
            if adjust < -TJ_SPACE_THRESHOLD {
                text.push(' ');
            }
        }
    }
    text
}

/// Decode a string operand: UTF-16BE when it carries a BOM, Latin-1 otherwise.
fn decode_string(object: &Object) -> Option<String> {
    let Object::String(bytes, _) = object else {
        return None;
    };
    let text = if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    };
    Some(text.chars().filter(|c| !c.is_control() || *c == ' ').collect())
}
