//! Persisted artifact types.
//!
//! Every type here is stored as one JSON file inside a book directory; the
//! file names live on [`crate::content_store::Artifact`]. Keys are camelCase
//! on disk.

use crate::error::ErrorReport;
use crate::page_key::{PageAssetRef, PageKey, Side};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate ISO8601 timestamp for current time.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let (hours, minutes, seconds) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);

    let mut year = 1970i32;
    let mut remaining_days = days_since_epoch as i32;
    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let feb = if is_leap_year(year) { 29 } else { 28 };
    let days_in_months = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 1;
    for days in days_in_months {
        if remaining_days < days {
            break;
        }
        remaining_days -= days;
        month += 1;
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        remaining_days + 1,
        hours,
        minutes,
        seconds
    )
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

/// Book metadata as known at some stage (classification, search, cleanup).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub is_non_fiction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewability: Option<String>,
    /// Pages the source lets us see, when the search reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewable_pages: Option<u32>,
}

impl BookMetadata {
    /// Whether the source-availability fields say nothing can be previewed.
    pub fn reports_no_pages(&self) -> bool {
        self.viewable_pages == Some(0)
            || self
                .viewability
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case("NO_PAGES"))
    }
}

/// Link between an upload id and the canonical source id it resolved to.
///
/// An upload directory holds the record for its own link. The canonical
/// directory holds one record for all of its links: `upload_id` is the first
/// upload and `linked_uploads` lists the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    pub upload_id: String,
    pub canonical_source_id: String,
    #[serde(default)]
    pub snapshot_metadata: BookMetadata,
    #[serde(default)]
    pub linked_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_uploads: Vec<String>,
}

impl MappingRecord {
    pub fn new(upload_id: &str, canonical_source_id: &str, snapshot: BookMetadata) -> Self {
        Self {
            upload_id: upload_id.to_string(),
            canonical_source_id: canonical_source_id.to_string(),
            snapshot_metadata: snapshot,
            linked_at: now_iso8601(),
            linked_uploads: Vec::new(),
        }
    }

    /// Every upload id the record links, first upload first.
    pub fn upload_ids(&self) -> Vec<String> {
        let mut ids = vec![self.upload_id.clone()];
        for id in &self.linked_uploads {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub fn mentions(&self, book_id: &str) -> bool {
        self.canonical_source_id == book_id || self.upload_ids().iter().any(|id| id == book_id)
    }

    /// Ids on the other end of the links, seen from `book_id`.
    pub fn partners(&self, book_id: &str) -> Vec<String> {
        if self.canonical_source_id == book_id {
            self.upload_ids()
                .into_iter()
                .filter(|id| id != book_id)
                .collect()
        } else if self.mentions(book_id) {
            vec![self.canonical_source_id.clone()]
        } else {
            Vec::new()
        }
    }

    /// The record as stored in `upload_id`'s own directory.
    pub fn for_upload(&self, upload_id: &str) -> Self {
        Self {
            upload_id: upload_id.to_string(),
            linked_uploads: Vec::new(),
            ..self.clone()
        }
    }

    /// Fold the uploads already listed by `existing` into this record, keeping
    /// the original link time. Records for another canonical id are ignored.
    pub fn merge_uploads(&mut self, existing: &MappingRecord) {
        if existing.canonical_source_id != self.canonical_source_id {
            return;
        }
        let mut uploads = existing.upload_ids();
        for id in self.upload_ids() {
            if !uploads.contains(&id) {
                uploads.push(id);
            }
        }
        self.upload_id = uploads.remove(0);
        self.linked_uploads = uploads;
        if !existing.linked_at.is_empty() {
            self.linked_at = existing.linked_at.clone();
        }
    }
}

/// Written once a capture batch has been stored in full. OCR only starts
/// over a complete batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureBatch {
    pub asset_count: usize,
    pub completed_at: String,
}

/// OCR output for one page asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrRecord {
    pub page_key: PageKey,
    pub side: Side,
    pub text: String,
    pub confidence: f64,
}

impl OcrRecord {
    pub fn asset(&self) -> PageAssetRef {
        PageAssetRef::new(self.page_key, self.side)
    }
}

/// The whole OCR collection of a book, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrCollection {
    pub records: Vec<OcrRecord>,
    /// Number of assets the run covered.
    pub asset_count: usize,
    #[serde(default)]
    pub completed_at: String,
}

impl OcrCollection {
    /// True when the collection has exactly one record per asset, in the
    /// given order.
    pub fn covers(&self, assets: &[PageAssetRef]) -> bool {
        self.asset_count == assets.len()
            && self.records.len() == assets.len()
            && self.records.iter().zip(assets).all(|(r, a)| r.asset() == *a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    Cleanup,
    Direct,
}

/// The authoritative display text for a book plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentAnalysis {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<AnalysisMethod>,
    #[serde(default)]
    pub analyzed_at: String,
}

impl ContentAnalysis {
    pub fn is_empty(&self) -> bool {
        self.first_page.trim().is_empty() && self.second_page.trim().is_empty()
    }

    /// Overwrite metadata fields only; the page text is left untouched.
    /// Empty incoming fields do not erase known values.
    pub fn apply_metadata(&mut self, metadata: &BookMetadata) -> bool {
        let before = (self.title.clone(), self.author.clone(), self.is_non_fiction);
        if !metadata.title.trim().is_empty() {
            self.title = metadata.title.clone();
        }
        if !metadata.author.trim().is_empty() {
            self.author = metadata.author.clone();
        }
        self.is_non_fiction = metadata.is_non_fiction;
        before != (self.title.clone(), self.author.clone(), self.is_non_fiction)
    }
}

/// Status reported by an explicit `status.json` marker. Unknown strings are
/// kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StatusKind {
    Processing,
    Complete,
    Error,
    Unknown,
    Other(String),
}

impl From<String> for StatusKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "processing" => Self::Processing,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "unknown" => Self::Unknown,
            _ => Self::Other(raw),
        }
    }
}

impl From<StatusKind> for String {
    fn from(kind: StatusKind) -> Self {
        match kind {
            StatusKind::Processing => "processing".to_string(),
            StatusKind::Complete => "complete".to_string(),
            StatusKind::Error => "error".to_string(),
            StatusKind::Unknown => "unknown".to_string(),
            StatusKind::Other(raw) => raw,
        }
    }
}

impl StatusKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Contents of `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMarker {
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

/// Contents of `error.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMarker {
    #[serde(flatten)]
    pub report: ErrorReport,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub recorded_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_kind_keeps_unknown_strings() {
        let marker: StatusMarker =
            serde_json::from_str(r#"{"status": "capturing_pages"}"#).unwrap();
        assert_eq!(marker.status, StatusKind::Other("capturing_pages".to_string()));
        let out = serde_json::to_value(&marker).unwrap();
        assert_eq!(out["status"], "capturing_pages");
    }

    #[test]
    fn test_apply_metadata_keeps_pages() {
        let mut analysis = ContentAnalysis {
            title: "Old".to_string(),
            author: "Someone".to_string(),
            is_non_fiction: false,
            first_page: "first".to_string(),
            second_page: "second".to_string(),
            method: Some(AnalysisMethod::Cleanup),
            analyzed_at: String::new(),
        };
        let changed = analysis.apply_metadata(&BookMetadata {
            title: "New".to_string(),
            author: String::new(),
            is_non_fiction: true,
            ..BookMetadata::default()
        });
        assert!(changed);
        assert_eq!(analysis.title, "New");
        assert_eq!(analysis.author, "Someone");
        assert!(analysis.is_non_fiction);
        assert_eq!(analysis.first_page, "first");
    }

    #[test]
    fn test_error_marker_flattens_report() {
        let json = r#"{"message": "no preview", "code": "NO_PAGES_AVAILABLE"}"#;
        let marker: ErrorMarker = serde_json::from_str(json).unwrap();
        assert_eq!(marker.report.code, "NO_PAGES_AVAILABLE");
        assert!(!marker.retryable);
    }

    #[test]
    fn test_canonical_record_collects_uploads() {
        let mut first = MappingRecord::new("upA", "vol", BookMetadata::default());
        first.linked_at = "2026-01-01T00:00:00Z".to_string();
        let mut second = MappingRecord::new("upB", "vol", BookMetadata::default());
        second.merge_uploads(&first);

        assert_eq!(second.upload_ids(), vec!["upA", "upB"]);
        assert_eq!(second.linked_at, "2026-01-01T00:00:00Z");
        assert_eq!(second.partners("vol"), vec!["upA", "upB"]);
        assert_eq!(second.partners("upB"), vec!["vol"]);
        assert!(second.partners("upC").is_empty());
        assert_eq!(second.for_upload("upB").upload_ids(), vec!["upB"]);

        let unrelated = MappingRecord::new("upC", "other", BookMetadata::default());
        second.merge_uploads(&unrelated);
        assert_eq!(second.upload_ids(), vec!["upA", "upB"]);
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = now_iso8601();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
    }
}
