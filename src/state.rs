// Prior-run state persisted between scheduled checks
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::CalendarDate;

/// What the last successful run saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorState {
    #[serde(default)]
    pub pdf_hash: Option<String>,
    #[serde(default)]
    pub available: Vec<CalendarDate>,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
}

impl PriorState {
    /// Currently available dates whose key was not available last time.
    pub fn new_available_dates(&self, current: &[CalendarDate]) -> Vec<CalendarDate> {
        let known: BTreeSet<_> = self.available.iter().map(CalendarDate::key).collect();
        current
            .iter()
            .filter(|date| !known.contains(&date.key()))
            .cloned()
            .collect()
    }

    pub fn pdf_changed(&self, hash: &str) -> bool {
        self.pdf_hash.as_deref() != Some(hash)
    }
}

/// JSON file holding the [`PriorState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state counts as a first run.
    pub fn load(&self) -> PriorState {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no prior state");
            return PriorState::default();
        }

        let parsed = fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str::<PriorState>(&content).map_err(anyhow::Error::from));
        match parsed {
            Ok(state) => {
                debug!(
                    path = %self.path.display(),
                    available = state.available.len(),
                    "loaded prior state"
                );
                state
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable prior state");
                PriorState::default()
            }
        }
    }

    /// Write through a temp file so a crash never leaves half a state file.
    pub fn save(&self, state: &PriorState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state).context("failed to serialize state")?;
        fs::write(&temp_path, content)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), "saved state");
        Ok(())
    }
}
