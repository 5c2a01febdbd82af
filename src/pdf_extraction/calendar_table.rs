// Calendar table detection over positioned text
//
// The watched calendars print one table per month:
//   month header ("September / Settembre")
//   weekday row  (Mo Di Mi ...)
//   date row     (1 2 3 ... 30)
//   status row   (one cell per date; text, a symbol, or only a fill color)
// Rows are found by clustering runs on their baseline.
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

use super::text_layer::TextRun;
use crate::config::KeywordConfig;
use crate::types::{month_in_text, AvailabilityStatus, TargetMonth, MAX_DAY};

// A date row needs at least this many day numbers to count as one
const MIN_DATE_COLUMNS: usize = 3;
// Status text further below the dates than this many font sizes belongs elsewhere
const MAX_STATUS_ROW_GAP: f32 = 4.0;

#[derive(Debug, Clone)]
struct Row<'a> {
    y: f32,
    font_size: f32,
    runs: Vec<&'a TextRun>,
}

impl Row<'_> {
    fn text(&self) -> String {
        self.runs
            .iter()
            .map(|run| run.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Day numbers of this row as (day, x), ordered left to right.
    fn day_tokens(&self) -> Vec<(u32, f32)> {
        let mut days: Vec<(u32, f32)> = self
            .runs
            .iter()
            .flat_map(|run| run.tokens().into_iter().map(|t| (t.text.to_string(), t.x)).collect::<Vec<_>>())
            .filter_map(|(text, x)| {
                text.parse::<u32>()
                    .ok()
                    .filter(|day| (1..=MAX_DAY).contains(day))
                    .map(|day| (day, x))
            })
            .collect();
        days.sort_by(|a, b| a.1.total_cmp(&b.1));
        days
    }

    fn is_date_row(&self) -> bool {
        let days = self.day_tokens();
        days.len() >= MIN_DATE_COLUMNS && days.windows(2).all(|w| w[0].0 < w[1].0)
    }
}

/// Group runs into rows, top of the page first.
fn cluster_rows(runs: &[TextRun]) -> Vec<Row<'_>> {
    let mut sorted: Vec<&TextRun> = runs.iter().collect();
    sorted.sort_by(|a, b| b.y.total_cmp(&a.y).then(a.x.total_cmp(&b.x)));

    let mut rows: Vec<Row<'_>> = Vec::new();
    for run in sorted {
        let tolerance = (run.font_size * 0.4).max(2.0);
        match rows.last_mut() {
            Some(row) if (row.y - run.y).abs() <= tolerance => {
                row.runs.push(run);
                row.font_size = row.font_size.max(run.font_size);
            }
            _ => rows.push(Row { y: run.y, font_size: run.font_size, runs: vec![run] }),
        }
    }
    for row in &mut rows {
        row.runs.sort_by(|a, b| a.x.total_cmp(&b.x));
    }
    rows
}

/// One date column of the located table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableColumn {
    pub day: u32,
    /// Horizontal center of the cell, PDF points.
    pub x: f32,
    pub width: f32,
    pub weekday: Option<String>,
    pub status_text: Option<String>,
}

/// The target month's table, in PDF user space (y grows upwards).
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarTable {
    pub page: usize,
    pub header: String,
    pub columns: BTreeMap<u32, TableColumn>,
    pub date_row_y: f32,
    /// Baseline of the status row, measured or extrapolated.
    pub status_row_y: f32,
    pub row_pitch: f32,
    pub font_size: f32,
}

impl CalendarTable {
    /// Status cell of `day` as (left, bottom, right, top) in PDF points.
    pub fn status_cell(&self, day: u32) -> Option<(f32, f32, f32, f32)> {
        let column = self.columns.get(&day)?;
        // cells are centered a little above the text baseline
        let center_y = self.status_row_y + self.font_size * 0.3;
        let half_height = self.row_pitch / 2.0;
        let half_width = column.width / 2.0;
        Some((
            column.x - half_width,
            center_y - half_height,
            column.x + half_width,
            center_y + half_height,
        ))
    }
}

/// Find the target month's table on one page.
pub fn locate_table(runs: &[TextRun], month: &TargetMonth, page: usize) -> Option<CalendarTable> {
    let rows = cluster_rows(runs);

    for (header_index, header) in rows.iter().enumerate() {
        let header_text = header.text();
        if !month.matches_text(&header_text) {
            continue;
        }

        // The date row is the first qualifying row under the header, unless
        // another month's header comes first
        let mut date_index = None;
        for (index, row) in rows.iter().enumerate().skip(header_index + 1) {
            if row.is_date_row() {
                date_index = Some(index);
                break;
            }
            if month_in_text(&row.text()).is_some_and(|m| m != month.month()) {
                break;
            }
        }
        let Some(date_index) = date_index else {
            debug!(page, header = %header_text, "month header without a date row");
            continue;
        };

        return Some(build_table(&rows, header_index, date_index, page, header_text));
    }
    None
}

fn build_table(
    rows: &[Row<'_>],
    header_index: usize,
    date_index: usize,
    page: usize,
    header: String,
) -> CalendarTable {
    let date_row = &rows[date_index];
    let days = date_row.day_tokens();
    let font_size = date_row.font_size;

    // Glyph positions are estimates, so center the column on the number
    let digit_half = font_size * 0.25;
    let pitch = column_pitch(&days).unwrap_or(font_size * 3.0);

    let weekday_row = (date_index > header_index + 1).then(|| &rows[date_index - 1]);
    let status_row = rows.get(date_index + 1).filter(|row| {
        // a status row may hold only numbers, so it is not tested as a date row
        date_row.y - row.y <= font_size * MAX_STATUS_ROW_GAP && month_in_text(&row.text()).is_none()
    });

    let row_pitch = match (weekday_row, status_row) {
        (Some(weekday), _) => weekday.y - date_row.y,
        (None, Some(status)) => date_row.y - status.y,
        (None, None) => font_size * 2.0,
    };
    let status_row_y = status_row.map(|row| row.y).unwrap_or(date_row.y - row_pitch);

    let mut columns = BTreeMap::new();
    for (day, x) in days {
        let digits = day.to_string().len() as f32;
        let center = x + digit_half * digits;
        columns.insert(
            day,
            TableColumn {
                day,
                x: center,
                width: pitch,
                weekday: weekday_row.and_then(|row| text_near(row, center, pitch)),
                status_text: status_row.and_then(|row| text_near(row, center, pitch)),
            },
        );
    }

    CalendarTable {
        page,
        header,
        columns,
        date_row_y: date_row.y,
        status_row_y,
        row_pitch,
        font_size,
    }
}

/// Median spacing of one day between neighbouring columns.
fn column_pitch(days: &[(u32, f32)]) -> Option<f32> {
    let mut gaps: Vec<f32> = days
        .windows(2)
        .map(|w| (w[1].1 - w[0].1) / (w[1].0 - w[0].0) as f32)
        .filter(|gap| *gap > 0.0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_by(f32::total_cmp);
    Some(gaps[gaps.len() / 2])
}

/// Text of the runs in `row` whose center falls inside the column.
fn text_near(row: &Row<'_>, center: f32, width: f32) -> Option<String> {
    let words: Vec<&str> = row
        .runs
        .iter()
        .filter(|run| (run.center_x() - center).abs() <= width / 2.0)
        .map(|run| run.text.as_str())
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

/// Status words and symbols compiled per status, plus the numeric cell rule.
pub struct KeywordMatcher {
    patterns: Vec<(AvailabilityStatus, Regex)>,
    symbols: Vec<(AvailabilityStatus, String)>,
    numbers_available: bool,
    unavailable_numbers: Vec<String>,
}

impl KeywordMatcher {
    pub fn new(keywords: &KeywordConfig) -> Self {
        let mut patterns = Vec::new();
        let mut symbols = Vec::new();

        for status in AvailabilityStatus::RESOLVED {
            let (words, marks): (Vec<&String>, Vec<&String>) = keywords
                .for_status(status)
                .iter()
                .filter(|k| !k.trim().is_empty())
                .partition(|k| k.chars().any(char::is_alphanumeric));

            if !words.is_empty() {
                let alternatives: Vec<String> = words.iter().map(|w| regex::escape(w.trim())).collect();
                let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
                // escaped literals always form a valid pattern
                if let Ok(regex) = Regex::new(&pattern) {
                    patterns.push((status, regex));
                }
            }
            symbols.extend(marks.into_iter().map(|m| (status, m.trim().to_string())));
        }

        Self {
            patterns,
            symbols,
            numbers_available: keywords.numbers_available,
            unavailable_numbers: keywords
                .unavailable_numbers
                .iter()
                .map(|n| n.trim().to_string())
                .collect(),
        }
    }

    /// The status named by a cell's text; None when nothing matches.
    pub fn classify(&self, text: &str) -> Option<AvailabilityStatus> {
        let trimmed = text.trim();
        if self.numbers_available && !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Some(if self.unavailable_numbers.iter().any(|n| n == trimmed) {
                AvailabilityStatus::FullyBooked
            } else {
                AvailabilityStatus::Available
            });
        }

        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(text))
            .map(|(status, _)| *status)
            .or_else(|| {
                self.symbols
                    .iter()
                    .find(|(_, symbol)| text.contains(symbol.as_str()))
                    .map(|(status, _)| *status)
            })
    }
}
