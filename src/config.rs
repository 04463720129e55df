//! Service settings.
//!
//! Settings come from an optional JSON file (`COVER_READER_CONFIG`) and are
//! then overridden by individual environment variables. Capability
//! endpoints and API keys are read by each adapter's own `from_env`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// How the confidences of a page's left and right halves are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceMode {
    /// Plain average of the two halves.
    Mean,
    /// Average weighted by the amount of text each half produced.
    LengthWeighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root holding one directory per book id.
    pub cache_root: PathBuf,
    pub bind_addr: String,
    /// How long `POST /books` waits for the pipeline before answering.
    pub request_deadline_secs: u64,
    /// Shortest page text accepted as real content.
    pub min_page_chars: usize,
    /// Strings that mark a cleanup result as an error rather than content.
    pub sentinel_errors: Vec<String>,
    /// Upper bound on the `PT<n>` slot search.
    pub max_duplicate_slots: u32,
    pub confidence_mode: ConfidenceMode,
    /// Pages below this combined confidence are left out of the cleanup input.
    pub min_page_confidence: f64,
    /// Period of the background janitor; 0 disables it.
    pub janitor_interval_secs: u64,
    /// Sweep a book right after its analysis completes.
    pub sweep_on_complete: bool,
    /// Minimum gap between analysis attempts made by `reconcile` for one book.
    pub reconcile_backoff_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("cache/book-images"),
            bind_addr: "0.0.0.0:3000".to_string(),
            request_deadline_secs: 45,
            min_page_chars: 50,
            sentinel_errors: vec![
                "Error processing content".to_string(),
                "Unable to extract".to_string(),
                "No content available".to_string(),
            ],
            max_duplicate_slots: 1000,
            confidence_mode: ConfidenceMode::Mean,
            min_page_confidence: 0.0,
            janitor_interval_secs: 3600,
            sweep_on_complete: true,
            reconcile_backoff_secs: 60,
        }
    }
}

impl Settings {
    /// Load settings from the environment, starting from the JSON file in
    /// `COVER_READER_CONFIG` when that variable is set.
    pub fn from_env() -> Result<Self> {
        let mut settings = match std::env::var("COVER_READER_CONFIG") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(root) = std::env::var("CACHE_ROOT") {
            settings.cache_root = PathBuf::from(root);
        }
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            settings.bind_addr = addr;
        }
        if let Some(secs) = env_parse("REQUEST_DEADLINE_SECS")? {
            settings.request_deadline_secs = secs;
        }
        if let Some(chars) = env_parse("MIN_PAGE_CHARS")? {
            settings.min_page_chars = chars;
        }
        if let Some(secs) = env_parse("JANITOR_INTERVAL_SECS")? {
            settings.janitor_interval_secs = secs;
        }
        if let Some(secs) = env_parse("RECONCILE_BACKOFF_SECS")? {
            settings.reconcile_backoff_secs = secs;
        }

        Ok(settings)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {:?}", path))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings: {:?}", path))?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    pub fn reconcile_backoff(&self) -> Duration {
        Duration::from_secs(self.reconcile_backoff_secs)
    }

    pub fn janitor_interval(&self) -> Option<Duration> {
        (self.janitor_interval_secs > 0).then(|| Duration::from_secs(self.janitor_interval_secs))
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(None),
    }
}
