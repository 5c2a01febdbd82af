// Configuration for the availability monitor
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::pdf_extraction::color::Rgb;
use crate::types::{AvailabilityStatus, DateRange, ExtractionError, TargetMonth};

pub const DEFAULT_SOURCE_URL: &str =
    "https://www.rifugiopiandicengia.it/CustomerData/764/Files/Documents/verfuegbarkeiten.pdf";
pub const DEFAULT_BOOKING_URL: &str = "https://www.rifugiopiandicengia.it/";
pub const DEFAULT_CONFIG_FILE: &str = "rifugio-monitor.toml";
pub const DEFAULT_STATE_FILE: &str = "data/last_availability.json";

// Environment overrides
pub const CONFIG_PATH_ENV: &str = "RIFUGIO_MONITOR_CONFIG";
pub const SOURCE_URL_ENV: &str = "RIFUGIO_SOURCE_URL";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const GITHUB_REPOSITORY_ENV: &str = "GITHUB_REPOSITORY";
pub const EMAIL_FROM_ENV: &str = "EMAIL_FROM";
pub const EMAIL_TO_ENV: &str = "EMAIL_TO";
pub const EMAIL_PASSWORD_ENV: &str = "EMAIL_PASSWORD";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Wall-clock budget for download, extraction and notification together.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            timeout_secs: default_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

fn default_source_url() -> String { DEFAULT_SOURCE_URL.to_string() }
fn default_timeout_secs() -> u64 { 30 }
fn default_run_timeout_secs() -> u64 { 120 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    #[serde(default = "default_month")]
    pub month: String,
    #[serde(default = "default_start_day")]
    pub start_day: u32,
    #[serde(default = "default_end_day")]
    pub end_day: u32,
    #[serde(default)]
    pub year: Option<i32>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            month: default_month(),
            start_day: default_start_day(),
            end_day: default_end_day(),
            year: None,
        }
    }
}

fn default_month() -> String { "September".to_string() }
fn default_start_day() -> u32 { 9 }
fn default_end_day() -> u32 { 21 }

impl TargetConfig {
    pub fn range(&self) -> Result<DateRange, ExtractionError> {
        DateRange::new(self.start_day, self.end_day)
    }

    pub fn target_month(&self) -> Result<TargetMonth, ExtractionError> {
        self.month.parse()
    }
}

/// Tuning for the extractor. Layout heuristics live here because the
/// published calendar's layout is the least stable part of the contract.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_render_dpi")]
    pub render_dpi: f32,
    /// Fraction of the cell trimmed from each side before sampling.
    #[serde(default = "default_sample_inset")]
    pub sample_inset: f32,
    /// Minimum painted fraction of a sample block for it to count as evidence.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f32,
    #[serde(default)]
    pub colors: ColorConfig,
    #[serde(default)]
    pub keywords: KeywordConfig,
    #[serde(default)]
    pub grid: Option<GridCrop>,
    #[serde(default)]
    pub ocr: OcrConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            render_dpi: default_render_dpi(),
            sample_inset: default_sample_inset(),
            min_coverage: default_min_coverage(),
            colors: ColorConfig::default(),
            keywords: KeywordConfig::default(),
            grid: None,
            ocr: OcrConfig::default(),
        }
    }
}

fn default_render_dpi() -> f32 { 144.0 }
fn default_sample_inset() -> f32 { 0.25 }
fn default_min_coverage() -> f32 { 0.5 }

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ColorReference {
    pub status: AvailabilityStatus,
    pub rgb: Rgb,
}

impl ColorReference {
    pub fn new(status: AvailabilityStatus, rgb: [u8; 3]) -> Self {
        Self { status, rgb: Rgb::from(rgb) }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColorConfig {
    /// Maximum RGB distance for a sample to match a reference.
    #[serde(default = "default_color_threshold")]
    pub threshold: f32,
    #[serde(default = "default_color_references")]
    pub references: Vec<ColorReference>,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            threshold: default_color_threshold(),
            references: default_color_references(),
        }
    }
}

fn default_color_threshold() -> f32 { 50.0 }

fn default_color_references() -> Vec<ColorReference> {
    use AvailabilityStatus::*;
    vec![
        ColorReference::new(Available, [0, 255, 0]),
        ColorReference::new(Available, [50, 255, 50]),
        ColorReference::new(FullyBooked, [255, 0, 0]),
        ColorReference::new(FullyBooked, [255, 50, 50]),
        ColorReference::new(DayUseOnly, [255, 255, 0]),
        ColorReference::new(DayUseOnly, [255, 255, 100]),
        ColorReference::new(Closed, [255, 255, 255]),
        ColorReference::new(Closed, [240, 240, 240]),
    ]
}

/// Words and symbols that mark a status in the calendar's text layer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeywordConfig {
    #[serde(default = "default_available_keywords")]
    pub available: Vec<String>,
    #[serde(default = "default_fully_booked_keywords")]
    pub fully_booked: Vec<String>,
    #[serde(default = "default_day_use_keywords")]
    pub day_use_only: Vec<String>,
    #[serde(default = "default_closed_keywords")]
    pub closed: Vec<String>,
    /// A cell holding only a number (free beds) counts as available,
    /// except for the values in `unavailable_numbers`, which count as booked.
    #[serde(default = "default_true")]
    pub numbers_available: bool,
    #[serde(default = "default_unavailable_numbers")]
    pub unavailable_numbers: Vec<String>,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            available: default_available_keywords(),
            fully_booked: default_fully_booked_keywords(),
            day_use_only: default_day_use_keywords(),
            closed: default_closed_keywords(),
            numbers_available: true,
            unavailable_numbers: default_unavailable_numbers(),
        }
    }
}

impl KeywordConfig {
    pub fn for_status(&self, status: AvailabilityStatus) -> &[String] {
        match status {
            AvailabilityStatus::Available => &self.available,
            AvailabilityStatus::FullyBooked => &self.fully_booked,
            AvailabilityStatus::DayUseOnly => &self.day_use_only,
            AvailabilityStatus::Closed => &self.closed,
            AvailabilityStatus::Unknown => &[],
        }
    }
}

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn default_available_keywords() -> Vec<String> {
    strings(&["available", "free", "green", "frei", "verfügbar", "grün", "libero", "disponibile", "verde", "✓", "✔"])
}

fn default_fully_booked_keywords() -> Vec<String> {
    strings(&["booked", "full", "red", "ausgebucht", "belegt", "voll", "rot", "occupato", "completo", "rosso", "✗", "✘"])
}

fn default_day_use_keywords() -> Vec<String> {
    strings(&["day use", "day-use", "yellow", "tagesgast", "tagesgäste", "gelb", "solo giorno", "giornaliero", "giallo"])
}

fn default_closed_keywords() -> Vec<String> {
    strings(&["closed", "white", "geschlossen", "ruhetag", "weiß", "chiuso", "bianco"])
}

fn default_unavailable_numbers() -> Vec<String> {
    strings(&["1"])
}

/// Fixed crop coordinates of the status cells, in PDF points measured from
/// the top-left corner of the page.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GridCrop {
    #[serde(default)]
    pub page: usize,
    pub x: f32,
    pub y: f32,
    pub cell_width: f32,
    pub cell_height: f32,
    #[serde(default = "default_first_day")]
    pub first_day: u32,
    #[serde(default = "default_columns")]
    pub columns: u32,
    /// Vertical distance between week rows; defaults to `cell_height`.
    #[serde(default)]
    pub row_pitch: Option<f32>,
}

fn default_first_day() -> u32 { 1 }
fn default_columns() -> u32 { 31 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ocr_command")]
    pub command: String,
    #[serde(default = "default_ocr_language")]
    pub language: String,
    #[serde(default = "default_ocr_dpi")]
    pub dpi: f32,
    /// Status cell position below the recognized day numbers, in row pitches.
    #[serde(default = "default_status_row_offset")]
    pub status_row_offset: f32,
    /// The engine is killed when one page takes longer than this.
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_ocr_command(),
            language: default_ocr_language(),
            dpi: default_ocr_dpi(),
            status_row_offset: default_status_row_offset(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_true() -> bool { true }
fn default_ocr_command() -> String { "tesseract".to_string() }
fn default_ocr_language() -> String { "eng".to_string() }
fn default_ocr_dpi() -> f32 { 300.0 }
fn default_status_row_offset() -> f32 { 1.0 }
fn default_ocr_timeout_secs() -> u64 { 60 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { path: default_state_path() }
    }
}

fn default_state_path() -> PathBuf { PathBuf::from(DEFAULT_STATE_FILE) }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// Also notify when the PDF changed but no new date opened up.
    #[serde(default)]
    pub notify_on_pdf_change: bool,
    #[serde(default = "default_true")]
    pub notify_errors: bool,
    #[serde(default = "default_booking_url")]
    pub booking_url: Option<String>,
    #[serde(default)]
    pub github: Option<GithubConfig>,
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            notify_on_pdf_change: false,
            notify_errors: true,
            booking_url: default_booking_url(),
            github: None,
            email: None,
        }
    }
}

fn default_booking_url() -> Option<String> { Some(DEFAULT_BOOKING_URL.to_string()) }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GithubConfig {
    pub repository: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default = "default_github_api")]
    pub api_url: String,
}

/// SMTP delivery with STARTTLS; the password normally comes from `EMAIL_PASSWORD`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Login name; the sender address when unset.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl EmailConfig {
    pub fn new(from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            from: from.into(),
            to,
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: None,
            password: None,
        }
    }
}

fn default_smtp_host() -> String { "smtp.gmail.com".to_string() }
fn default_smtp_port() -> u16 { 587 }

fn split_addresses(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_labels() -> Vec<String> { vec!["availability-alert".to_string()] }
fn default_github_api() -> String { "https://api.github.com".to_string() }

impl MonitorConfig {
    /// Load from an explicit path, the `RIFUGIO_MONITOR_CONFIG` path, or the
    /// default file when present; fall back to built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var(SOURCE_URL_ENV) {
            self.source.url = url;
        }

        let token = env::var(GITHUB_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        let repository = env::var(GITHUB_REPOSITORY_ENV).ok().filter(|r| !r.is_empty());
        if let Some(github) = self.notify.github.as_mut() {
            if let Some(repository) = repository {
                github.repository = repository;
            }
            if github.token.is_none() {
                github.token = token;
            }
        } else if let (Some(repository), Some(token)) = (repository, token) {
            // Inside a CI job the token and repository alone enable issues
            self.notify.github = Some(GithubConfig {
                repository,
                token: Some(token),
                labels: default_labels(),
                assignees: Vec::new(),
                api_url: default_github_api(),
            });
        }

        let password = env::var(EMAIL_PASSWORD_ENV).ok().filter(|p| !p.is_empty());
        let from = env::var(EMAIL_FROM_ENV).ok().filter(|f| !f.is_empty());
        let to = env::var(EMAIL_TO_ENV).ok().map(|t| split_addresses(&t)).filter(|t| !t.is_empty());
        if let Some(email) = self.notify.email.as_mut() {
            if email.password.is_none() {
                email.password = password;
            }
        } else if let (Some(from), Some(to), Some(password)) = (from, to, password) {
            self.notify.email = Some(EmailConfig {
                password: Some(password),
                ..EmailConfig::new(from, to)
            });
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.target.range()?;
        self.target.target_month()?;

        let extraction = &self.extraction;
        if !(extraction.render_dpi > 0.0) || !(extraction.ocr.dpi > 0.0) {
            bail!("render dpi must be positive");
        }
        if !(0.0..0.5).contains(&extraction.sample_inset) {
            bail!("sample_inset must be in [0, 0.5), got {}", extraction.sample_inset);
        }
        if !(0.0..=1.0).contains(&extraction.min_coverage) {
            bail!("min_coverage must be in [0, 1], got {}", extraction.min_coverage);
        }
        if !(extraction.colors.threshold >= 0.0) {
            bail!("color threshold must be non-negative");
        }
        if extraction
            .colors
            .references
            .iter()
            .any(|reference| !reference.status.is_resolved())
        {
            bail!("color references cannot map to the unknown status");
        }
        if let Some(grid) = &extraction.grid {
            if grid.cell_width <= 0.0 || grid.cell_height <= 0.0 || grid.columns == 0 {
                bail!("grid cells must have positive size and at least one column");
            }
        }
        if let Some(email) = &self.notify.email {
            if email.to.is_empty() {
                bail!("[notify.email] needs at least one recipient");
            }
        }
        if self.source.timeout_secs == 0 || self.source.run_timeout_secs == 0 || extraction.ocr.timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_watched_calendar() {
        let config = MonitorConfig::default();
        assert_eq!(config.source.url, DEFAULT_SOURCE_URL);
        assert_eq!(config.target.range().unwrap(), DateRange::new(9, 21).unwrap());
        assert_eq!(config.target.target_month().unwrap().number(), 9);
        assert_eq!(config.extraction.colors.threshold, 50.0);
        assert_eq!(config.extraction.colors.references.len(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MonitorConfig::from_toml(
            r#"
            [target]
            month = "Settembre"
            start_day = 12
            end_day = 14

            [extraction.colors]
            threshold = 80.0
            references = [{ status = "available", rgb = [0, 200, 0] }]

            [extraction.grid]
            x = 40.0
            y = 100.0
            cell_width = 18.0
            cell_height = 20.0
            "#,
        )
        .unwrap();

        assert_eq!(config.target.start_day, 12);
        assert_eq!(config.target.target_month().unwrap().number(), 9);
        assert_eq!(config.extraction.colors.references.len(), 1);
        assert_eq!(config.extraction.colors.references[0].rgb, Rgb::new(0, 200, 0));
        let grid = config.extraction.grid.as_ref().unwrap();
        assert_eq!(grid.columns, 31);
        assert_eq!(grid.first_day, 1);
        assert_eq!(config.extraction.render_dpi, 144.0);
        assert_eq!(config.state.path, PathBuf::from(DEFAULT_STATE_FILE));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MonitorConfig::default();
        config.target.start_day = 25;
        config.target.end_day = 3;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config
            .extraction
            .colors
            .references
            .push(ColorReference::new(AvailabilityStatus::Unknown, [1, 2, 3]));
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.extraction.sample_inset = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_email_section() {
        let config = MonitorConfig::from_toml(
            r#"
            [notify.email]
            from = "monitor@example.org"
            to = ["hiker@example.org"]
            "#,
        )
        .unwrap();
        let email = config.notify.email.as_ref().unwrap();
        assert_eq!(email.smtp_host, "smtp.gmail.com");
        assert_eq!(email.smtp_port, 587);
        assert!(email.password.is_none());
        assert!(config.validate().is_ok());

        let mut config = config;
        if let Some(email) = config.notify.email.as_mut() {
            email.to.clear();
        }
        assert!(config.validate().is_err());
        assert_eq!(split_addresses(" a@x.org, ,b@x.org"), vec!["a@x.org", "b@x.org"]);
    }

    #[test]
    fn test_keywords_by_status() {
        let keywords = KeywordConfig::default();
        assert!(keywords
            .for_status(AvailabilityStatus::Available)
            .contains(&"green".to_string()));
        assert!(keywords.for_status(AvailabilityStatus::Unknown).is_empty());
    }
}
