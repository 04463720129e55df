//! External collaborator interfaces.
//!
//! Each capability is an async trait so the pipeline can be driven by real
//! HTTP adapters in production and scripted fakes in tests.

use crate::schema::OcrRecord;
use serde::{Deserialize, Serialize};

/// Metadata read off a cover photo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverClassification {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub is_non_fiction: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub genre: Option<String>,
}

/// Where the book's preview lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMatch {
    pub source_id: String,
    /// Source-reported viewability, e.g. `PARTIAL`, `ALL_PAGES`, `NO_PAGES`.
    pub viewability: String,
    #[serde(default)]
    pub viewable_pages: Option<u32>,
    pub preview_handle: String,
}

impl SourceMatch {
    pub fn has_preview(&self) -> bool {
        !self.viewability.eq_ignore_ascii_case("NO_PAGES") && self.viewable_pages != Some(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrText {
    pub text: String,
    pub confidence: f64,
}

/// Hints passed to the cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct KnownMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub is_non_fiction: Option<bool>,
}

/// Result of the cleanup/classification pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanedPages {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub is_non_fiction: bool,
    #[serde(default)]
    pub first_page: String,
    #[serde(default)]
    pub second_page: String,
}

#[async_trait::async_trait]
pub trait CoverClassifier: Send + Sync {
    async fn classify_cover(&self, image: &[u8]) -> anyhow::Result<CoverClassification>;
}

#[async_trait::async_trait]
pub trait SourceSearch: Send + Sync {
    /// `Ok(None)` when nothing matches.
    async fn search_source(&self, title: &str, author: &str) -> anyhow::Result<Option<SourceMatch>>;
}

#[async_trait::async_trait]
pub trait PreviewCapture: Send + Sync {
    /// Page screenshots in reading order.
    async fn capture_preview_pages(&self, preview_handle: &str) -> anyhow::Result<Vec<Vec<u8>>>;
}

#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;
    async fn run_ocr(&self, image: &[u8]) -> anyhow::Result<OcrText>;
}

#[async_trait::async_trait]
pub trait TextCleanup: Send + Sync {
    async fn cleanup_and_classify(
        &self,
        records: &[OcrRecord],
        known: &KnownMetadata,
    ) -> anyhow::Result<CleanedPages>;

    /// Simpler fallback: pick the first two content pages without cleanup.
    async fn direct_extract(&self, records: &[OcrRecord]) -> anyhow::Result<CleanedPages>;
}
