// OCR engine - Tesseract subprocess plus date-grid recovery from its words
use image::{ImageFormat, RgbImage};
use std::collections::BTreeMap;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::OcrConfig;
use crate::types::{TargetMonth, MAX_DAY};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One recognized word, in pixels of the image that was recognized.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
    pub block: u32,
    pub paragraph: u32,
    pub line: u32,
}

impl OcrWord {
    fn center_x(&self) -> f32 {
        self.left as f32 + self.width as f32 / 2.0
    }

    fn center_y(&self) -> f32 {
        self.top as f32 + self.height as f32 / 2.0
    }

    fn line_key(&self) -> (u32, u32, u32) {
        (self.block, self.paragraph, self.line)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),

    #[error("OCR failed: {0}")]
    Failed(String),
}

/// Anything that turns an image into positioned words.
pub trait TextRecognizer {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<OcrWord>, OcrError>;
}

/// Runs the `tesseract` CLI, PNG in on stdin, TSV out on stdout.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    command: String,
    language: String,
    timeout: Duration,
}

impl TesseractRecognizer {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            command: config.command.clone(),
            language: config.language.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<OcrWord>, OcrError> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| OcrError::Failed(format!("could not encode page image: {}", e)))?;

        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout", "-l", &self.language, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => OcrError::Unavailable(format!("'{}' is not installed", self.command)),
                _ => OcrError::Unavailable(format!("failed to start '{}': {}", self.command, e)),
            })?;

        // Pipes are drained on their own threads so a stalled engine can
        // never block us past the deadline
        let writer = child.stdin.take().map(|mut stdin| thread::spawn(move || stdin.write_all(&png)));
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match wait_until(&mut child, Instant::now() + self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                kill_and_reap(&mut child);
                return Err(OcrError::Failed(format!(
                    "'{}' did not finish within {}s",
                    self.command,
                    self.timeout.as_secs()
                )));
            }
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(OcrError::Failed(format!("lost track of '{}': {}", self.command, e)));
            }
        };

        let piped = writer.map(|w| w.join().unwrap_or(Ok(()))).unwrap_or(Ok(()));
        let stdout = stdout.and_then(|r| r.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|r| r.join().ok()).unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(OcrError::Failed(format!("tesseract exited with {}: {}", status, stderr.trim())));
        }
        piped.map_err(|e| OcrError::Failed(format!("could not pipe image: {}", e)))?;

        let words = parse_tsv(&String::from_utf8_lossy(&stdout));
        debug!(words = words.len(), "tesseract recognized words");
        Ok(words)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        // a read error leaves whatever arrived so far
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

/// Poll the child until it exits or the deadline passes (`Ok(None)`).
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("could not kill OCR engine: {}", e);
    }
    let _ = child.wait();
}

/// Word rows (level 5) of Tesseract's TSV output.
pub fn parse_tsv(tsv: &str) -> Vec<OcrWord> {
    tsv.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 12 || fields[0] != "5" {
                return None;
            }
            let int = |i: usize| fields[i].trim().parse::<u32>().ok();
            let confidence: f32 = fields[10].trim().parse().ok()?;
            let text = fields[11].trim();
            if confidence < 0.0 || text.is_empty() {
                return None;
            }
            Some(OcrWord {
                text: text.to_string(),
                left: int(6)?,
                top: int(7)?,
                width: int(8)?,
                height: int(9)?,
                confidence,
                block: int(2)?,
                paragraph: int(3)?,
                line: int(4)?,
            })
        })
        .collect()
}

/// Status cell per day as (left, top, right, bottom) pixels, derived from the
/// recognized date row: cells sit `status_row_offset` row pitches below it.
pub fn locate_status_cells(
    words: &[OcrWord],
    month: &TargetMonth,
    status_row_offset: f32,
) -> BTreeMap<u32, (f32, f32, f32, f32)> {
    let mut cells = BTreeMap::new();

    let Some(header) = words.iter().find(|w| month.matches_text(&w.text)) else {
        debug!(month = month.name(), "month header not recognized");
        return cells;
    };
    let header_bottom = header.center_y();

    let mut lines: BTreeMap<(u32, u32, u32), Vec<&OcrWord>> = BTreeMap::new();
    for word in words.iter().filter(|w| w.center_y() > header_bottom) {
        lines.entry(word.line_key()).or_default().push(word);
    }
    let mut lines: Vec<Vec<&OcrWord>> = lines.into_values().collect();
    lines.sort_by(|a, b| line_center(a).total_cmp(&line_center(b)));

    let Some(date_index) = lines.iter().position(|line| day_numbers(line).is_some()) else {
        debug!("no date row recognized below the month header");
        return cells;
    };
    let Some(days) = day_numbers(&lines[date_index]) else {
        return cells;
    };
    let date_y = line_center(&lines[date_index]);

    // the weekday row above gives the row pitch; otherwise estimate from glyph height
    let pitch = date_index
        .checked_sub(1)
        .map(|above| date_y - line_center(&lines[above]))
        .filter(|pitch| *pitch > 0.0)
        .unwrap_or_else(|| 2.0 * median(days.iter().map(|(_, w)| w.height as f32).collect()));

    let spacing = median(
        days.windows(2)
            .map(|pair| (pair[1].1.center_x() - pair[0].1.center_x()) / (pair[1].0 - pair[0].0) as f32)
            .collect(),
    );
    if pitch <= 0.0 || spacing <= 0.0 {
        return cells;
    }

    let cell_y = date_y + status_row_offset * pitch;
    for (day, word) in days {
        let x = word.center_x();
        cells.insert(
            day,
            (x - spacing / 2.0, cell_y - pitch / 2.0, x + spacing / 2.0, cell_y + pitch / 2.0),
        );
    }
    debug!(cells = cells.len(), pitch, spacing, "recovered status cells from OCR");
    cells
}

fn line_center(line: &[&OcrWord]) -> f32 {
    median(line.iter().map(|w| w.center_y()).collect())
}

/// Day numbers of a line, left to right, when they form an increasing run.
fn day_numbers<'a>(line: &[&'a OcrWord]) -> Option<Vec<(u32, &'a OcrWord)>> {
    let mut days: Vec<(u32, &OcrWord)> = line
        .iter()
        .filter_map(|w| {
            w.text
                .trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u32>()
                .ok()
                .filter(|day| (1..=MAX_DAY).contains(day))
                .map(|day| (day, *w))
        })
        .collect();
    days.sort_by(|a, b| a.1.left.cmp(&b.1.left));
    let increasing = days.windows(2).all(|pair| pair[0].0 < pair[1].0);
    (days.len() >= 3 && increasing).then_some(days)
}

fn median(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, left: u32, top: u32, line: u32) -> OcrWord {
        OcrWord {
            text: text.to_string(),
            left,
            top,
            width: 20,
            height: 20,
            confidence: 90.0,
            block: 1,
            paragraph: 1,
            line,
        }
    }

    #[test]
    fn test_parse_tsv_keeps_words_only() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t\n\
                   4\t1\t1\t1\t1\t0\t10\t10\t300\t30\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t10\t12\t120\t28\t95.5\tSeptember\n\
                   5\t1\t1\t1\t1\t2\t140\t12\t20\t28\t-1\t \n\
                   5\t1\t1\t1\t2\t1\t10\t60\t20\t20\t88\t12\n";
        let words = parse_tsv(tsv);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "September");
        assert_eq!((words[0].left, words[0].top), (10, 12));
        assert_eq!(words[0].confidence, 95.5);
        assert_eq!(words[1].line, 2);
    }

    #[test]
    fn test_cells_below_date_row() {
        let september: TargetMonth = "September".parse().unwrap();
        let mut words = vec![word("September", 100, 0, 1)];
        for (i, weekday) in ["Mo", "Di", "Mi", "Do"].iter().enumerate() {
            words.push(word(weekday, 100 + i as u32 * 40, 100, 2));
        }
        for day in 1..=4u32 {
            words.push(word(&day.to_string(), 100 + (day - 1) * 40, 150, 3));
        }

        let cells = locate_status_cells(&words, &september, 1.0);
        assert_eq!(cells.len(), 4);
        // day 2 center x = 150, date row center y = 160, pitch 50
        assert_eq!(cells[&2], (130.0, 185.0, 170.0, 235.0));
    }

    #[test]
    fn test_no_header_means_no_cells() {
        let october: TargetMonth = "October".parse().unwrap();
        let words = vec![
            word("September", 100, 0, 1),
            word("1", 100, 50, 2),
            word("2", 140, 50, 2),
            word("3", 180, 50, 2),
        ];
        assert!(locate_status_cells(&words, &october, 1.0).is_empty());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let recognizer = TesseractRecognizer {
            command: "definitely-not-tesseract-binary".to_string(),
            language: "eng".to_string(),
            timeout: Duration::from_secs(5),
        };
        let image = RgbImage::new(4, 4);
        assert!(matches!(recognizer.recognize(&image), Err(OcrError::Unavailable(_))));
    }

    #[cfg(unix)]
    fn engine_script(dir: &std::path::Path, body: &str) -> OcrConfig {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-tesseract");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        OcrConfig {
            command: path.display().to_string(),
            timeout_secs: 1,
            ..OcrConfig::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_engine_is_killed_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = TesseractRecognizer::new(&engine_script(dir.path(), "exec sleep 30"));

        let started = Instant::now();
        let result = recognizer.recognize(&RgbImage::new(64, 64));
        assert!(matches!(result, Err(OcrError::Failed(ref m)) if m.contains("did not finish")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_exiting_early_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = engine_script(dir.path(), "echo 'missing traineddata' >&2\nexit 1");
        // large enough to overflow the pipe once the engine is gone
        let image = RgbImage::from_fn(512, 512, |x, y| image::Rgb([(x % 251) as u8, (y % 241) as u8, 7]));

        let result = TesseractRecognizer::new(&config).recognize(&image);
        assert!(matches!(result, Err(OcrError::Failed(ref m)) if m.contains("missing traineddata")));
    }
}
