//! Error taxonomy for the acquisition cache.
//!
//! Background work has no caller waiting on it, so most of these end up
//! persisted as a book's `error.json` marker instead of being returned to
//! anyone. [`ErrorReport`] is the `{message, code}` shape that marker (and
//! every HTTP error body) uses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = BookError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BookError {
    /// Image bytes could not be decoded or have unusable dimensions.
    #[error("corrupt image for page '{page_key}': {detail}")]
    CorruptImage { page_key: String, detail: String },

    /// The resolved source exposes zero viewable pages. Terminal.
    #[error("no preview available for '{book_id}'")]
    NoPreviewAvailable { book_id: String },

    /// An external capability failed; a later poll or re-run retries it.
    #[error("{capability} unavailable: {detail}")]
    CapabilityUnavailable {
        capability: &'static str,
        detail: String,
    },

    /// An artifact exists but failed validation.
    #[error("incomplete artifact {artifact} for '{book_id}': {detail}")]
    IncompleteArtifact {
        book_id: String,
        artifact: &'static str,
        detail: String,
    },

    #[error("no free duplicate slot for '{page_key}' after {limit} attempts")]
    DuplicateSlotsExhausted { page_key: String, limit: u32 },

    /// An upload id is already linked to a different canonical source id.
    #[error("'{upload_id}' is already linked to '{existing}', refusing '{requested}'")]
    IdentityConflict {
        upload_id: String,
        existing: String,
        requested: String,
    },

    #[error("invalid book id '{0}'")]
    InvalidBookId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Stable machine-readable codes surfaced through the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    CorruptImage,
    NoPagesAvailable,
    CapabilityUnavailable,
    IncompleteArtifact,
    DuplicateSlotsExhausted,
    IdentityConflict,
    InvalidBookId,
    NotFound,
    ProcessingFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CorruptImage => "CORRUPT_IMAGE",
            Self::NoPagesAvailable => "NO_PAGES_AVAILABLE",
            Self::CapabilityUnavailable => "CAPABILITY_UNAVAILABLE",
            Self::IncompleteArtifact => "INCOMPLETE_ARTIFACT",
            Self::DuplicateSlotsExhausted => "DUPLICATE_SLOTS_EXHAUSTED",
            Self::IdentityConflict => "IDENTITY_CONFLICT",
            Self::InvalidBookId => "INVALID_BOOK_ID",
            Self::NotFound => "NOT_FOUND",
            Self::ProcessingFailed => "PROCESSING_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BookError {
    pub fn capability(capability: &'static str, err: impl std::fmt::Display) -> Self {
        Self::CapabilityUnavailable {
            capability,
            detail: err.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CorruptImage { .. } => ErrorCode::CorruptImage,
            Self::NoPreviewAvailable { .. } => ErrorCode::NoPagesAvailable,
            Self::CapabilityUnavailable { .. } => ErrorCode::CapabilityUnavailable,
            Self::IncompleteArtifact { .. } => ErrorCode::IncompleteArtifact,
            Self::DuplicateSlotsExhausted { .. } => ErrorCode::DuplicateSlotsExhausted,
            Self::IdentityConflict { .. } => ErrorCode::IdentityConflict,
            Self::InvalidBookId(_) => ErrorCode::InvalidBookId,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Io(_) | Self::Json(_) => ErrorCode::Internal,
        }
    }

    /// Whether a later poll may succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapabilityUnavailable { .. } | Self::IncompleteArtifact { .. } | Self::Io(_)
        )
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.to_string(), self.code())
    }
}

/// User-visible failure: always a message plus a code, never a raw error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    pub code: String,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            message: message.into(),
            code: code.as_str().to_string(),
        }
    }
}
