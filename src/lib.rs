//! Watches a rifugio's published availability PDF and reports nights that
//! newly became bookable.
//!
//! [`pdf_extraction`] turns PDF bytes into per-date statuses through a
//! text, color, then OCR fallback chain. [`monitor`] wraps it into a
//! download/diff/notify run driven by [`config::MonitorConfig`].
pub mod config;
pub mod logging;
pub mod monitor;
pub mod notifier;
pub mod pdf_extraction;
pub mod state;
pub mod types;

pub use config::MonitorConfig;
pub use monitor::{content_hash, HttpSource, Monitor, PdfSource, RunReport};
pub use notifier::{
    AnyNotifier, AvailabilityNotice, Channel, ConsoleNotifier, EmailNotifier, GithubIssueNotifier, Notifier,
};
pub use pdf_extraction::{extract, AvailabilityExtractor, ExtractionRequest};
pub use state::{PriorState, StateStore};
pub use types::{
    AvailabilityStatus, CalendarDate, Confidence, DateRange, ExtractionError, ExtractionMethod,
    ExtractionResult, TargetMonth,
};
