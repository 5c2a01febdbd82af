// Core types for calendar availability extraction
use chrono::{Datelike, Month, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest day number a calendar cell can carry.
pub const MAX_DAY: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    Available,
    FullyBooked,
    DayUseOnly,
    Closed,
    Unknown,
}

impl AvailabilityStatus {
    /// Every status a method can resolve a date to.
    pub const RESOLVED: [AvailabilityStatus; 4] = [
        AvailabilityStatus::Available,
        AvailabilityStatus::FullyBooked,
        AvailabilityStatus::DayUseOnly,
        AvailabilityStatus::Closed,
    ];

    pub fn is_resolved(self) -> bool {
        self != AvailabilityStatus::Unknown
    }

    pub fn label(self) -> &'static str {
        match self {
            AvailabilityStatus::Available => "Available",
            AvailabilityStatus::FullyBooked => "Fully booked",
            AvailabilityStatus::DayUseOnly => "Day use only",
            AvailabilityStatus::Closed => "Closed",
            AvailabilityStatus::Unknown => "Unknown",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            AvailabilityStatus::Available => "🟢",
            AvailabilityStatus::FullyBooked => "🔴",
            AvailabilityStatus::DayUseOnly => "🟡",
            AvailabilityStatus::Closed => "⚪",
            AvailabilityStatus::Unknown => "❓",
        }
    }
}

impl fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which stage of the fallback chain produced a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Text,
    Color,
    Ocr,
}

impl ExtractionMethod {
    pub fn confidence(self) -> Confidence {
        match self {
            ExtractionMethod::Text => Confidence::High,
            ExtractionMethod::Color => Confidence::Medium,
            ExtractionMethod::Ocr => Confidence::Low,
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractionMethod::Text => "text",
            ExtractionMethod::Color => "color",
            ExtractionMethod::Ocr => "ocr",
        })
    }
}

// Ordered weakest first so `min` picks the weakest link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Unknown,
    Low,
    Medium,
    High,
}

/// A single day of the target month together with its derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub month: u32,
    pub day: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<String>,
    pub status: AvailabilityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<ExtractionMethod>,
}

impl CalendarDate {
    pub fn unresolved(year: Option<i32>, month: u32, day: u32) -> Self {
        Self {
            year,
            month,
            day,
            weekday: weekday_label(year, month, day),
            status: AvailabilityStatus::Unknown,
            method: None,
        }
    }

    /// Identity used when diffing runs; status and labels are ignored.
    pub fn key(&self) -> (Option<i32>, u32, u32) {
        (self.year, self.month, self.day)
    }

    pub fn confidence(&self) -> Confidence {
        self.method
            .map(ExtractionMethod::confidence)
            .unwrap_or(Confidence::Unknown)
    }

    /// Human label in the style "Fri 12 September".
    pub fn describe(&self) -> String {
        let month = month_from_number(self.month)
            .map(|m| m.name().to_string())
            .unwrap_or_else(|| self.month.to_string());
        match &self.weekday {
            Some(weekday) => format!("{} {} {}", weekday, self.day, month),
            None => format!("{} {}", self.day, month),
        }
    }
}

/// Derive a short weekday label when the year is known.
pub fn weekday_label(year: Option<i32>, month: u32, day: u32) -> Option<String> {
    let date = NaiveDate::from_ymd_opt(year?, month, day)?;
    Some(date.weekday().to_string())
}

fn month_from_number(number: u32) -> Option<Month> {
    u8::try_from(number).ok().and_then(|n| Month::try_from(n).ok())
}

/// Inclusive day-of-month window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: u32,
    pub end: u32,
}

impl DateRange {
    pub fn new(start: u32, end: u32) -> Result<Self, ExtractionError> {
        if start == 0 || end > MAX_DAY || start > end {
            return Err(ExtractionError::InvalidRequest(format!(
                "date range {}-{} must satisfy 1 <= start <= end <= {}",
                start, end, MAX_DAY
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, day: u32) -> bool {
        (self.start..=self.end).contains(&day)
    }

    pub fn days(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for DateRange {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ExtractionError::InvalidRequest(format!("invalid date range '{}'", s));
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse().map_err(|_| invalid())?;
        let end = end.trim().parse().map_err(|_| invalid())?;
        DateRange::new(start, end)
    }
}

// Month names as printed on the calendars we watch (en/de/it)
const MONTH_NAMES: [[&str; 4]; 12] = [
    ["january", "januar", "jänner", "gennaio"],
    ["february", "februar", "feber", "febbraio"],
    ["march", "märz", "maerz", "marzo"],
    ["april", "april", "april", "aprile"],
    ["may", "mai", "mai", "maggio"],
    ["june", "juni", "juni", "giugno"],
    ["july", "juli", "juli", "luglio"],
    ["august", "august", "august", "agosto"],
    ["september", "september", "september", "settembre"],
    ["october", "oktober", "oktober", "ottobre"],
    ["november", "november", "november", "novembre"],
    ["december", "dezember", "dezember", "dicembre"],
];

/// The month whose calendar table we filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetMonth(Month);

impl TargetMonth {
    pub fn new(month: Month) -> Self {
        Self(month)
    }

    pub fn month(&self) -> Month {
        self.0
    }

    pub fn number(&self) -> u32 {
        self.0.number_from_month()
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// True when any word of `text` names this month.
    pub fn matches_text(&self, text: &str) -> bool {
        month_in_text(text) == Some(self.0)
    }
}

/// First month named in `text`, if any.
pub fn month_in_text(text: &str) -> Option<Month> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphabetic())
        .filter(|word| word.len() >= 3)
        .find_map(|word| {
            MONTH_NAMES
                .iter()
                .position(|names| names.contains(&word))
                .and_then(|index| month_from_number(index as u32 + 1))
        })
}

impl fmt::Display for TargetMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TargetMonth {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(number) = trimmed.parse::<u32>() {
            return month_from_number(number)
                .map(TargetMonth)
                .ok_or_else(|| ExtractionError::InvalidRequest(format!("invalid month number {}", number)));
        }
        if let Ok(month) = trimmed.parse::<Month>() {
            return Ok(TargetMonth(month));
        }
        month_in_text(trimmed)
            .map(TargetMonth)
            .ok_or_else(|| ExtractionError::InvalidRequest(format!("unknown month '{}'", s)))
    }
}

/// A method that was skipped because it could not run here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMethod {
    pub method: ExtractionMethod,
    pub reason: String,
}

/// Every date of the requested range for one PDF snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub month: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub range: DateRange,
    pub dates: Vec<CalendarDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedMethod>,
}

impl ExtractionResult {
    pub fn get(&self, day: u32) -> Option<&CalendarDate> {
        self.dates.iter().find(|date| date.day == day)
    }

    pub fn status(&self, day: u32) -> AvailabilityStatus {
        self.get(day)
            .map(|date| date.status)
            .unwrap_or(AvailabilityStatus::Unknown)
    }

    pub fn available_dates(&self) -> Vec<CalendarDate> {
        self.with_status(AvailabilityStatus::Available)
    }

    pub fn unknown_dates(&self) -> Vec<CalendarDate> {
        self.with_status(AvailabilityStatus::Unknown)
    }

    fn with_status(&self, status: AvailabilityStatus) -> Vec<CalendarDate> {
        self.dates
            .iter()
            .filter(|date| date.status == status)
            .cloned()
            .collect()
    }

    /// Some dates stayed `Unknown` after the whole chain.
    pub fn is_partial(&self) -> bool {
        self.dates.iter().any(|date| !date.status.is_resolved())
    }

    /// Weakest confidence among resolved dates; `Unknown` when nothing resolved.
    pub fn confidence(&self) -> Confidence {
        self.dates
            .iter()
            .filter(|date| date.status.is_resolved())
            .map(CalendarDate::confidence)
            .min()
            .unwrap_or(Confidence::Unknown)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_range_validation() {
        assert!(DateRange::new(9, 21).is_ok());
        assert!(DateRange::new(0, 5).is_err());
        assert!(DateRange::new(12, 3).is_err());
        assert!(DateRange::new(1, 32).is_err());

        let range: DateRange = "9-21".parse().unwrap();
        assert_eq!(range.days().count(), 13);
        assert!(range.contains(21));
        assert!(!range.contains(22));
        assert!("nine-21".parse::<DateRange>().is_err());
    }

    #[test]
    fn test_target_month_parsing() {
        assert_eq!("September".parse::<TargetMonth>().unwrap().number(), 9);
        assert_eq!("9".parse::<TargetMonth>().unwrap().number(), 9);
        assert_eq!("settembre".parse::<TargetMonth>().unwrap().number(), 9);
        assert_eq!("Oktober".parse::<TargetMonth>().unwrap().number(), 10);
        assert!("13".parse::<TargetMonth>().is_err());
        assert!("Brumaire".parse::<TargetMonth>().is_err());
    }

    #[test]
    fn test_month_header_matching() {
        let september: TargetMonth = "September".parse().unwrap();
        assert!(september.matches_text("September / Settembre 2025"));
        assert!(september.matches_text("SETTEMBRE"));
        assert!(!september.matches_text("Oktober / Ottobre"));
        assert!(!september.matches_text("12"));
    }

    #[test]
    fn test_confidence_is_weakest_resolved() {
        let mut result = ExtractionResult {
            month: 9,
            year: None,
            range: DateRange::new(1, 3).unwrap(),
            dates: (1..=3).map(|day| CalendarDate::unresolved(None, 9, day)).collect(),
            skipped: Vec::new(),
        };
        assert_eq!(result.confidence(), Confidence::Unknown);
        assert!(result.is_partial());

        result.dates[0].status = AvailabilityStatus::Available;
        result.dates[0].method = Some(ExtractionMethod::Text);
        result.dates[1].status = AvailabilityStatus::Closed;
        result.dates[1].method = Some(ExtractionMethod::Color);
        assert_eq!(result.confidence(), Confidence::Medium);
        assert_eq!(result.available_dates().len(), 1);
        assert_eq!(result.unknown_dates().len(), 1);
    }

    #[test]
    fn test_weekday_label_from_year() {
        assert_eq!(weekday_label(Some(2025), 9, 12).as_deref(), Some("Fri"));
        assert_eq!(weekday_label(None, 9, 12), None);
        assert_eq!(weekday_label(Some(2025), 9, 31), None);

        let date = CalendarDate::unresolved(Some(2025), 9, 12);
        assert_eq!(date.describe(), "Fri 12 September");
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&AvailabilityStatus::DayUseOnly).unwrap();
        assert_eq!(json, "\"day_use_only\"");
        let method = serde_json::to_string(&ExtractionMethod::Ocr).unwrap();
        assert_eq!(method, "\"ocr\"");
    }
}
