// One scheduled check: download, hash, extract, diff, notify, persist
use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::notifier::{AvailabilityNotice, ConsoleNotifier, Notifier};
use crate::pdf_extraction::{AvailabilityExtractor, ExtractionRequest};
use crate::state::{PriorState, StateStore};
use crate::types::{CalendarDate, ExtractionResult};

/// SHA-256 of the downloaded bytes, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Where the calendar PDF comes from.
#[allow(async_fn_in_trait)]
pub trait PdfSource {
    fn url(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// Plain HTTP(S) download.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rifugio-monitor/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, url: url.into() })
    }
}

impl PdfSource for HttpSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        info!(url = %self.url, "downloading availability PDF");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("HTTP request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, self.url);
        }

        let bytes = response.bytes().await.context("Failed to read response body")?;
        info!(bytes = bytes.len(), "downloaded availability PDF");
        Ok(bytes.to_vec())
    }
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub pdf_hash: String,
    pub pdf_changed: bool,
    pub result: ExtractionResult,
    pub new_dates: Vec<CalendarDate>,
    pub notified: bool,
}

pub struct Monitor<S, N> {
    source: S,
    notifier: N,
    extractor: Arc<AvailabilityExtractor>,
    request: ExtractionRequest,
    store: StateStore,
    notify_on_pdf_change: bool,
    booking_url: Option<String>,
    dry_run: bool,
}

impl<S: PdfSource, N: Notifier> Monitor<S, N> {
    pub fn new(config: &MonitorConfig, source: S, notifier: N) -> Result<Self> {
        let request = ExtractionRequest::new(config.target.range()?, config.target.target_month()?)
            .with_year(config.target.year);
        Ok(Self {
            source,
            notifier,
            extractor: Arc::new(AvailabilityExtractor::new(&config.extraction)),
            request,
            store: StateStore::new(config.state.path.clone()),
            notify_on_pdf_change: config.notify.notify_on_pdf_change,
            booking_url: config.notify.booking_url.clone(),
            dry_run: false,
        })
    }

    pub fn with_extractor(mut self, extractor: AvailabilityExtractor) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    /// Print the notice instead of delivering it, and keep the state as is.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// A failed run returns before touching the stored state.
    pub async fn run(&self) -> Result<RunReport> {
        let bytes = self.source.fetch().await?;
        let pdf_hash = content_hash(&bytes);
        let prior = self.store.load();
        let pdf_changed = prior.pdf_changed(&pdf_hash);
        info!(hash = %pdf_hash, changed = pdf_changed, "hashed availability PDF");

        // Extraction blocks (rendering, the OCR engine), so keep it off the
        // runtime thread where it would stall the caller's run timeout
        let extractor = Arc::clone(&self.extractor);
        let request = self.request.clone();
        let result = tokio::task::spawn_blocking(move || extractor.extract(&bytes, &request))
            .await
            .context("extraction task failed")?
            .context("failed to extract availability")?;
        let unknown = result.unknown_dates();
        if !unknown.is_empty() {
            let days: Vec<u32> = unknown.iter().map(|d| d.day).collect();
            warn!(?days, "some dates could not be read");
        }

        let available = result.available_dates();
        let new_dates = prior.new_available_dates(&available);
        let first_run = prior.pdf_hash.is_none();
        let should_notify =
            !new_dates.is_empty() || (self.notify_on_pdf_change && pdf_changed && !first_run);

        if should_notify {
            let notice = AvailabilityNotice {
                new_dates: new_dates.clone(),
                all_available: available.clone(),
                unknown,
                source_url: self.source.url().to_string(),
                booking_url: self.booking_url.clone(),
                pdf_changed,
            };
            if self.dry_run {
                ConsoleNotifier.notify(&notice).await?;
            } else {
                self.notifier.notify(&notice).await.context("failed to deliver notification")?;
            }
            info!(new = new_dates.len(), "sent availability notice");
        } else {
            info!(available = available.len(), "no new availability");
        }

        if self.dry_run {
            info!("dry run, state not saved");
        } else {
            self.store.save(&PriorState {
                pdf_hash: Some(pdf_hash.clone()),
                available,
                checked_at: Some(Utc::now()),
            })?;
        }

        Ok(RunReport {
            pdf_hash,
            pdf_changed,
            result,
            new_dates,
            notified: should_notify,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_hash(b"calendar"), content_hash(b"calendar"));
        assert_ne!(content_hash(b"calendar"), content_hash(b"calendar v2"));
    }
}
