//! StampError - unified error type for the metadata pipeline
//!
//! One taxonomy for everything the pipeline can fail on, from manifest
//! structure down to individual tag-tool invocations. The propagation
//! policy differs per category: structural errors abort a batch before
//! any write, record errors are isolated to one manifest row, and
//! maintenance errors are logged and swallowed by the janitor.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StampError>;

/// How an error propagates through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Aborts the whole batch before any write occurs.
    Structural,
    /// Isolated to one record; other records keep processing.
    Record,
    /// Best-effort background work; logged, never fatal.
    Maintenance,
    /// Auxiliary operation (AI assist, stats helper); surfaced to its caller only.
    Auxiliary,
}

#[derive(Debug, Error)]
pub enum StampError {
    #[error("Missing required headers: {}", missing.join(", "))]
    HeaderMismatch { missing: Vec<String> },

    #[error("Row {row}: {}", reasons.join("; "))]
    RowInvalid { row: usize, reasons: Vec<String> },

    #[error("Image file not found: {filename}. Available files: {}", available.join(", "))]
    ImageNotFound {
        filename: String,
        available: Vec<String>,
    },

    #[error("Source image missing: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Tag write failed for {}: {detail}", path.display())]
    TagWriteFailed {
        path: PathBuf,
        detail: String,
        exit_code: Option<i32>,
    },

    #[error("Tag write timed out after {seconds}s: {}", path.display())]
    TagWriteTimeout { path: PathBuf, seconds: u64 },

    #[error("exiftool not found in PATH")]
    TagToolMissing,

    #[error("Archive creation failed: {detail}")]
    ArchiveCreationFailed { detail: String },

    #[error("Directory does not exist: {}", path.display())]
    DirectoryNotFound { path: PathBuf },

    #[error("Permission denied: {}", path.display())]
    DirectoryAccessDenied { path: PathBuf },

    #[error("Invalid API key format")]
    InvalidCredential,

    #[error("Rate limit exceeded, please try again later")]
    RateLimited,

    #[error("Tag suggestion failed: {0}")]
    AssistFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StampError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StampError::HeaderMismatch { .. }
            | StampError::TagToolMissing
            | StampError::DirectoryNotFound { .. }
            | StampError::DirectoryAccessDenied { .. }
            | StampError::Csv(_) => ErrorCategory::Structural,

            StampError::RowInvalid { .. }
            | StampError::ImageNotFound { .. }
            | StampError::SourceNotFound { .. }
            | StampError::TagWriteFailed { .. }
            | StampError::TagWriteTimeout { .. }
            | StampError::ArchiveCreationFailed { .. } => ErrorCategory::Record,

            StampError::InvalidCredential
            | StampError::RateLimited
            | StampError::AssistFailed(_) => ErrorCategory::Auxiliary,

            StampError::Io(_) | StampError::Json(_) => ErrorCategory::Structural,
        }
    }

    /// Whether the orchestrator converts this into a per-record failed
    /// outcome instead of aborting the batch.
    pub fn is_record_level(&self) -> bool {
        self.category() == ErrorCategory::Record
    }

    pub fn user_message(&self) -> String {
        match self {
            StampError::HeaderMismatch { missing } => {
                format!(
                    "❌ CSV headers incomplete: missing {}\n💡 Expected columns: FileName, Title, Description, Keywords",
                    missing.join(", ")
                )
            }
            StampError::RowInvalid { row, reasons } => {
                format!("❌ Row {} rejected: {}", row, reasons.join("; "))
            }
            StampError::ImageNotFound { filename, available } => {
                let mut msg = format!("❌ Image file not found: {}", filename);
                if !available.is_empty() {
                    msg.push_str(&format!("\n   Uploaded files: {}", available.join(", ")));
                }
                msg
            }
            StampError::SourceNotFound { path } => {
                format!("❌ Source image missing: {}", path.display())
            }
            StampError::TagWriteFailed {
                path,
                detail,
                exit_code,
            } => {
                let code_str = exit_code
                    .map(|c| format!(" (exit code: {})", c))
                    .unwrap_or_default();
                format!(
                    "❌ Tag write failed{}: {}\n   File: {}",
                    code_str,
                    detail,
                    path.display()
                )
            }
            StampError::TagWriteTimeout { path, seconds } => {
                format!(
                    "❌ Tag tool did not finish within {}s: {}",
                    seconds,
                    path.display()
                )
            }
            StampError::TagToolMissing => {
                "❌ exiftool not found\n💡 Please ensure exiftool is installed and in PATH"
                    .to_string()
            }
            StampError::ArchiveCreationFailed { detail } => {
                format!("❌ Failed to create archive: {}", detail)
            }
            StampError::DirectoryNotFound { path } => {
                format!("❌ Directory does not exist: {}", path.display())
            }
            StampError::DirectoryAccessDenied { path } => {
                format!("❌ Permission denied: {}", path.display())
            }
            StampError::InvalidCredential => {
                "❌ Invalid API key format\n💡 OpenAI keys start with \"sk-\"".to_string()
            }
            StampError::RateLimited => {
                "⚠️ Rate limit exceeded, please try again later".to_string()
            }
            StampError::AssistFailed(detail) => {
                format!("❌ Tag suggestion failed: {}", detail)
            }
            StampError::Io(e) => format!("❌ IO error: {}", e),
            StampError::Csv(e) => format!("❌ Failed to parse CSV: {}", e),
            StampError::Json(e) => format!("❌ JSON error: {}", e),
        }
    }
}
