//! Processing status, derived from a book directory's marker artifacts.
//!
//! [`resolve_status`] is a pure function over a [`StatusMarkers`] snapshot;
//! [`StatusResolver`] loads snapshots from the store and combines linked ids.

use crate::content_store::{Artifact, ContentStore};
use crate::error::{ErrorCode, Result};
use crate::identity::IdentityReconciler;
use crate::schema::{BookMetadata, ContentAnalysis, ErrorMarker, MappingRecord, StatusKind, StatusMarker};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookStatus {
    pub status: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<StatusDetail>,
}

impl BookStatus {
    fn plain(status: StatusKind) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Error,
            detail: Some(StatusDetail {
                message: message.into(),
                code: Some(code.into()),
            }),
        }
    }
}

/// Everything status resolution looks at, read once from one directory.
#[derive(Debug, Clone, Default)]
pub struct StatusMarkers {
    pub error: Option<ErrorMarker>,
    pub status: Option<StatusMarker>,
    pub analysis: Option<ContentAnalysis>,
    pub metadata: Option<BookMetadata>,
    pub mapping: Option<MappingRecord>,
    pub log: Option<String>,
    /// The directory exists and holds at least one entry.
    pub has_artifacts: bool,
}

impl StatusMarkers {
    fn source_reports_no_pages(&self) -> bool {
        self.metadata.as_ref().is_some_and(BookMetadata::reports_no_pages)
            || self
                .mapping
                .as_ref()
                .is_some_and(|m| m.snapshot_metadata.reports_no_pages())
    }
}

/// Activity-log patterns consulted when no marker decides the status.
#[derive(Debug, Clone)]
pub struct LogSignatures {
    not_available: Regex,
    failure: Regex,
}

impl Default for LogSignatures {
    fn default() -> Self {
        Self {
            not_available: Regex::new(
                r"(?i)no preview available|not available for preview|no_pages_available|zero viewable pages|viewability[:=]\s*no_pages",
            )
            .expect("valid regex"),
            failure: Regex::new(r"(?i)\b(error|failed|failure|exception|traceback|panicked)\b")
                .expect("valid regex"),
        }
    }
}

pub const NO_PREVIEW_MESSAGE: &str = "No preview available for this book";

/// Resolve one directory's status. First match wins:
/// error marker, status marker, content analysis, activity log, anything
/// else present, nothing.
pub fn resolve_status(markers: &StatusMarkers, signatures: &LogSignatures) -> BookStatus {
    if let Some(err) = &markers.error {
        return BookStatus::error(err.report.message.clone(), err.report.code.clone());
    }

    if let Some(marker) = &markers.status {
        return BookStatus {
            status: marker.status.clone(),
            detail: marker.message.clone().map(|message| StatusDetail {
                message,
                code: None,
            }),
        };
    }

    if let Some(analysis) = markers.analysis.as_ref().filter(|a| !a.is_empty()) {
        if markers.source_reports_no_pages() {
            return BookStatus::error(NO_PREVIEW_MESSAGE, ErrorCode::NoPagesAvailable.as_str());
        }
        debug!("Status: complete via content analysis '{}'", analysis.title);
        return BookStatus::plain(StatusKind::Complete);
    }

    if let Some(log) = &markers.log {
        if signatures.not_available.is_match(log) {
            return BookStatus::error(NO_PREVIEW_MESSAGE, ErrorCode::NoPagesAvailable.as_str());
        }
        if signatures.failure.is_match(log) {
            return BookStatus::error(
                "Processing failed, see activity log",
                ErrorCode::ProcessingFailed.as_str(),
            );
        }
        return BookStatus::plain(StatusKind::Processing);
    }

    if markers.has_artifacts {
        return BookStatus::plain(StatusKind::Processing);
    }

    BookStatus::plain(StatusKind::Unknown)
}

#[derive(Debug, Clone)]
pub struct StatusResolver {
    store: ContentStore,
    identity: IdentityReconciler,
    signatures: LogSignatures,
}

impl StatusResolver {
    pub fn new(store: ContentStore, identity: IdentityReconciler) -> Self {
        Self {
            store,
            identity,
            signatures: LogSignatures::default(),
        }
    }

    pub async fn load_markers(&self, book_id: &str) -> Result<StatusMarkers> {
        let has_artifacts = match tokio::fs::read_dir(self.store.book_path(book_id)?).await {
            Ok(mut entries) => entries.next_entry().await?.is_some(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !has_artifacts {
            return Ok(StatusMarkers::default());
        }

        Ok(StatusMarkers {
            error: self.store.read_lenient(book_id, Artifact::Error).await,
            status: self.store.read_lenient(book_id, Artifact::Status).await,
            analysis: self.store.read_lenient(book_id, Artifact::ContentAnalysis).await,
            metadata: self.store.read_lenient(book_id, Artifact::Metadata).await,
            mapping: self.store.read_lenient(book_id, Artifact::Mapping).await,
            log: self.store.read_log(book_id).await?,
            has_artifacts,
        })
    }

    /// Status of a single directory, ignoring linked ids.
    pub async fn status_of(&self, book_id: &str) -> Result<BookStatus> {
        let markers = self.load_markers(book_id).await?;
        Ok(resolve_status(&markers, &self.signatures))
    }

    /// Status of a book under either of its ids. The requested id is
    /// checked first; a terminal status on any linked id wins over a
    /// non-terminal one.
    pub async fn get_status(&self, book_id: &str) -> Result<BookStatus> {
        let mut best: Option<BookStatus> = None;
        for id in self.identity.linked_ids(book_id).await? {
            let status = self.status_of(&id).await?;
            if status.status.is_terminal() {
                return Ok(status);
            }
            best = match best {
                Some(prev) if prev.status != StatusKind::Unknown => Some(prev),
                _ => Some(status),
            };
        }
        Ok(best.unwrap_or_else(|| BookStatus::plain(StatusKind::Unknown)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorReport;

    fn analysis() -> ContentAnalysis {
        ContentAnalysis {
            title: "Dune".to_string(),
            author: "Frank Herbert".to_string(),
            is_non_fiction: false,
            first_page: "A beginning is the time for taking the most delicate care.".to_string(),
            second_page: "To begin your study of the life of Muad'Dib, then...".to_string(),
            method: None,
            analyzed_at: String::new(),
        }
    }

    fn error_marker(code: &str) -> ErrorMarker {
        ErrorMarker {
            report: ErrorReport {
                message: "boom".to_string(),
                code: code.to_string(),
            },
            retryable: false,
            recorded_at: String::new(),
        }
    }

    fn resolve(markers: &StatusMarkers) -> BookStatus {
        resolve_status(markers, &LogSignatures::default())
    }

    #[test]
    fn test_error_marker_beats_complete_analysis() {
        let markers = StatusMarkers {
            error: Some(error_marker("CAPABILITY_UNAVAILABLE")),
            status: Some(StatusMarker {
                status: StatusKind::Complete,
                message: None,
                updated_at: String::new(),
            }),
            analysis: Some(analysis()),
            has_artifacts: true,
            ..StatusMarkers::default()
        };
        let status = resolve(&markers);
        assert_eq!(status.status, StatusKind::Error);
        assert_eq!(status.detail.unwrap().code.as_deref(), Some("CAPABILITY_UNAVAILABLE"));
    }

    #[test]
    fn test_status_marker_is_verbatim() {
        let markers = StatusMarkers {
            status: Some(StatusMarker {
                status: StatusKind::Other("ocr_running".to_string()),
                message: Some("3 of 8 pages".to_string()),
                updated_at: String::new(),
            }),
            analysis: Some(analysis()),
            has_artifacts: true,
            ..StatusMarkers::default()
        };
        let status = resolve(&markers);
        assert_eq!(status.status, StatusKind::Other("ocr_running".to_string()));
        assert_eq!(status.detail.unwrap().message, "3 of 8 pages");
    }

    #[test]
    fn test_only_analysis_is_complete() {
        let markers = StatusMarkers {
            analysis: Some(analysis()),
            has_artifacts: true,
            ..StatusMarkers::default()
        };
        assert_eq!(resolve(&markers).status, StatusKind::Complete);
    }

    #[test]
    fn test_empty_analysis_does_not_complete() {
        let mut empty = analysis();
        empty.first_page.clear();
        empty.second_page = "   ".to_string();
        let markers = StatusMarkers {
            analysis: Some(empty),
            has_artifacts: true,
            ..StatusMarkers::default()
        };
        assert_eq!(resolve(&markers).status, StatusKind::Processing);
    }

    #[test]
    fn test_zero_viewable_pages_downgrades_analysis() {
        let markers = StatusMarkers {
            analysis: Some(analysis()),
            metadata: Some(BookMetadata {
                viewable_pages: Some(0),
                ..BookMetadata::default()
            }),
            has_artifacts: true,
            ..StatusMarkers::default()
        };
        let status = resolve(&markers);
        assert_eq!(status.status, StatusKind::Error);
        assert_eq!(status.detail.unwrap().code.as_deref(), Some("NO_PAGES_AVAILABLE"));
    }

    #[test]
    fn test_log_signatures() {
        let with_log = |log: &str| StatusMarkers {
            log: Some(log.to_string()),
            has_artifacts: true,
            ..StatusMarkers::default()
        };
        let status = resolve(&with_log("[t] search done\n[t] No preview available for vol1\n"));
        assert_eq!(status.detail.unwrap().code.as_deref(), Some("NO_PAGES_AVAILABLE"));

        let status = resolve(&with_log("[t] capture failed: timeout\n"));
        assert_eq!(status.status, StatusKind::Error);
        assert_eq!(status.detail.unwrap().code.as_deref(), Some("PROCESSING_FAILED"));

        assert_eq!(
            resolve(&with_log("[t] captured 4 pages\n")).status,
            StatusKind::Processing
        );
    }

    #[test]
    fn test_nothing_is_unknown_partial_is_processing() {
        assert_eq!(resolve(&StatusMarkers::default()).status, StatusKind::Unknown);
        let partial = StatusMarkers {
            metadata: Some(BookMetadata::default()),
            has_artifacts: true,
            ..StatusMarkers::default()
        };
        assert_eq!(resolve(&partial).status, StatusKind::Processing);
    }

    #[tokio::test]
    async fn test_linked_terminal_status_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path(), 10);
        let identity = IdentityReconciler::new(store.clone());
        let resolver = StatusResolver::new(store.clone(), identity.clone());

        assert_eq!(resolver.get_status("up").await.unwrap().status, StatusKind::Unknown);

        identity
            .link_ids("up", "vol", &BookMetadata::default())
            .await
            .unwrap();
        {
            let up = store.lock("up").await.unwrap();
            up.append_log("classified cover").await.unwrap();
            let vol = store.lock("vol").await.unwrap();
            vol.write(Artifact::ContentAnalysis, &analysis()).await.unwrap();
        }

        assert_eq!(resolver.status_of("up").await.unwrap().status, StatusKind::Processing);
        assert_eq!(resolver.get_status("up").await.unwrap().status, StatusKind::Complete);
    }
}
