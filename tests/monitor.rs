// Scheduled-run behaviour with a fake download and a recording notifier
mod common;

use anyhow::{bail, Result};
use rifugio_monitor::{
    content_hash, AvailabilityNotice, Monitor, Notifier, PdfSource, PriorState, StateStore,
};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::*;

struct FakeSource {
    bytes: Vec<u8>,
}

impl PdfSource for FakeSource {
    fn url(&self) -> &str {
        "https://example.org/availability.pdf"
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    notices: Arc<Mutex<Vec<AvailabilityNotice>>>,
    errors: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &AvailabilityNotice) -> Result<()> {
        if self.fail {
            bail!("issue tracker is down");
        }
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        self.errors.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

fn calendar(statuses: &[(u32, &str)]) -> Vec<u8> {
    pdf_with(september_table(statuses), vec![])
}

async fn run_once(
    state_path: &std::path::Path,
    bytes: Vec<u8>,
    notifier: &RecordingNotifier,
    configure: impl FnOnce(&mut rifugio_monitor::MonitorConfig),
) -> Result<rifugio_monitor::RunReport> {
    let mut config = offline_monitor_config(state_path);
    configure(&mut config);
    let monitor = Monitor::new(&config, FakeSource { bytes }, notifier.clone())?;
    monitor.run().await
}

#[tokio::test]
async fn test_first_run_notifies_and_saves_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let notifier = RecordingNotifier::default();
    let bytes = calendar(&[(12, "green"), (21, "red")]);

    let report = run_once(&state_path, bytes.clone(), &notifier, |_| {}).await.unwrap();
    assert!(report.notified);
    assert_eq!(report.new_dates.len(), 1);
    assert_eq!(report.new_dates[0].day, 12);

    let notices = notifier.notices.lock().unwrap().clone();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].all_available.len(), 1);
    // everything except 12 and 21 is unreadable and must be reported
    assert_eq!(notices[0].unknown.len(), 11);
    assert_eq!(notices[0].source_url, "https://example.org/availability.pdf");

    let state = StateStore::new(&state_path).load();
    assert_eq!(state.pdf_hash, Some(content_hash(&bytes)));
    assert_eq!(state.available.len(), 1);
    assert!(state.checked_at.is_some());
}

#[tokio::test]
async fn test_unchanged_calendar_stays_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let notifier = RecordingNotifier::default();
    let bytes = calendar(&[(12, "green")]);

    run_once(&state_path, bytes.clone(), &notifier, |_| {}).await.unwrap();
    let report = run_once(&state_path, bytes, &notifier, |_| {}).await.unwrap();
    assert!(!report.notified);
    assert!(!report.pdf_changed);
    assert_eq!(notifier.notices.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_only_newly_opened_nights_are_new() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let notifier = RecordingNotifier::default();

    run_once(&state_path, calendar(&[(12, "green")]), &notifier, |_| {}).await.unwrap();
    let report = run_once(&state_path, calendar(&[(12, "green"), (14, "green")]), &notifier, |_| {})
        .await
        .unwrap();

    assert!(report.pdf_changed);
    let days: Vec<u32> = report.new_dates.iter().map(|d| d.day).collect();
    assert_eq!(days, vec![14]);
    let notices = notifier.notices.lock().unwrap();
    assert_eq!(notices[1].all_available.len(), 2);
    assert!(notices[1].pdf_changed);
}

#[tokio::test]
async fn test_pdf_change_notice_is_opt_in_and_skips_first_run() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let notifier = RecordingNotifier::default();
    let on_change = |config: &mut rifugio_monitor::MonitorConfig| config.notify.notify_on_pdf_change = true;

    // nothing available and no prior hash: no notice
    let first = run_once(&state_path, calendar(&[(12, "red")]), &notifier, on_change).await.unwrap();
    assert!(!first.notified);

    let second = run_once(&state_path, calendar(&[(12, "red"), (13, "red")]), &notifier, on_change)
        .await
        .unwrap();
    assert!(second.notified);
    assert!(second.new_dates.is_empty());
    assert_eq!(notifier.notices.lock().unwrap()[0].title(), "🏔️ Rifugio availability calendar updated");
}

#[tokio::test]
async fn test_corrupt_download_keeps_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let notifier = RecordingNotifier::default();

    run_once(&state_path, calendar(&[(12, "green")]), &notifier, |_| {}).await.unwrap();
    let before = fs::read_to_string(&state_path).unwrap();

    let result = run_once(&state_path, b"<html>503</html>".to_vec(), &notifier, |_| {}).await;
    assert!(result.is_err());
    assert_eq!(fs::read_to_string(&state_path).unwrap(), before);
    assert_eq!(notifier.notices.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_delivery_is_retried_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let failing = RecordingNotifier { fail: true, ..RecordingNotifier::default() };

    let result = run_once(&state_path, calendar(&[(12, "green")]), &failing, |_| {}).await;
    assert!(result.is_err());
    assert!(!state_path.exists());

    let working = RecordingNotifier::default();
    let report = run_once(&state_path, calendar(&[(12, "green")]), &working, |_| {}).await.unwrap();
    assert_eq!(report.new_dates.len(), 1);
}

#[tokio::test]
async fn test_dry_run_does_not_touch_state_or_notifier() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let notifier = RecordingNotifier::default();

    let config = offline_monitor_config(&state_path);
    let monitor = Monitor::new(&config, FakeSource { bytes: calendar(&[(12, "green")]) }, notifier.clone())
        .unwrap()
        .dry_run(true);
    let report = monitor.run().await.unwrap();

    assert!(report.notified);
    assert!(notifier.notices.lock().unwrap().is_empty());
    assert!(!state_path.exists());
    assert_eq!(StateStore::new(&state_path).load(), PriorState::default());
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_timeout_covers_a_stalled_ocr_engine() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let engine = dir.path().join("stalled-tesseract");
    fs::write(&engine, "#!/bin/sh\nexec sleep 4\n").unwrap();
    fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = offline_monitor_config(&state_path);
    config.extraction.ocr.enabled = true;
    config.extraction.ocr.command = engine.display().to_string();
    config.extraction.ocr.timeout_secs = 2;
    let source = FakeSource { bytes: image_calendar_pdf(&[(14, [0, 255, 0])]) };
    let monitor = Monitor::new(&config, source, RecordingNotifier::default()).unwrap();

    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_millis(500), monitor.run()).await;
    assert!(outcome.is_err(), "run should have hit its wall clock budget");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!state_path.exists());
}
