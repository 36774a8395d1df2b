//! Error types for the doccache library.
//!
//! Errors are split by the component that raises them so each layer can be
//! tested on its own terms:
//!
//! * [`StoreError`], [`ToolError`], [`NotifierError`] — raised by the three
//!   collaborator seams (persistent store, external converter, notifier).
//!
//! * [`ConversionError`] — **Fatal for one request**: returned by
//!   [`crate::coordinator::ConversionCoordinator`]. Every variant that wraps a
//!   collaborator failure records the [`Stage`] it happened in.
//!
//! * [`DeliveryError`] — returned by [`crate::delivery::DeliveryDispatcher`].
//!   Never invalidates a cache record already written.
//!
//! * [`PipelineError`] — the service-level union of the two above, keeping
//!   the successful [`ConversionOutcome`] when only delivery failed.
//!
//! No variant is ever turned into a process exit by the library.

use crate::format::{Format, FormatPair};
use crate::output::ConversionOutcome;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Where in the per-request state machine something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fingerprinting,
    CacheCheck,
    CacheHit,
    Converting,
    Caching,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Fingerprinting => "fingerprinting",
            Stage::CacheCheck => "cache check",
            Stage::CacheHit => "cache hit",
            Stage::Converting => "converting",
            Stage::Caching => "caching",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Collaborator errors ──────────────────────────────────────────────────

/// Failure of the persistent conversion store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Storage unreachable, I/O failure, lock contention, or timeout.
    /// Fatal to the current request only.
    #[error("conversion store unavailable: {0}")]
    Unavailable(String),

    /// A stored record does not satisfy the hash invariant.
    #[error("conversion record {id} is corrupt: {detail}")]
    Corrupt { id: i64, detail: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Failure reported by a [`crate::converter::Converter`].
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool ran and reported failure.
    #[error("{tool} failed: {detail}")]
    Failed { tool: String, detail: String },

    /// The tool did not finish within its time budget.
    #[error("{tool} timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },

    /// The tool cannot perform this particular conversion.
    #[error("{tool} cannot convert {source_format} to {target}")]
    Unsupported {
        tool: String,
        source_format: Format,
        target: Format,
    },

    /// Local I/O around the tool invocation failed (temp files, spawn).
    #[error("I/O error around {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure reported by a [`crate::notifier::Notifier`].
#[derive(Debug, Error)]
pub enum NotifierError {
    /// The remote service answered but refused the message.
    #[error("notifier rejected message (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// The remote service could not be reached.
    #[error("notifier transport error: {0}")]
    Transport(String),

    /// Local write failure (outbox notifier).
    #[error("notifier I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Coordinator errors ───────────────────────────────────────────────────

/// All fatal per-request errors returned by the conversion coordinator.
#[derive(Debug, Error)]
pub enum ConversionError {
    // ── Client errors ─────────────────────────────────────────────────────
    /// The request carried no bytes.
    #[error("Input is empty\nUpload a non-empty file.")]
    EmptyInput,

    /// The request exceeds the configured upload limit.
    #[error("Input is {size} bytes, limit is {limit} bytes\nRaise --max-input-bytes or split the document.")]
    InputTooLarge { size: usize, limit: usize },

    /// Source or target format is not one side of the tracked pair.
    #[error("Cannot convert {source_format} to {target}: this cache only tracks {pair}")]
    UnsupportedFormat {
        source_format: Format,
        target: Format,
        pair: FormatPair,
    },

    /// No source format was declared and the file name does not tell.
    #[error("Cannot infer the source format of '{name}'\nPass --from or use a recognised file extension.")]
    UnknownSourceFormat { name: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Local input path does not exist.
    #[error("File not found: '{path}'\nCheck the path and try again.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP download of a URL input failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded its timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// The external converter failed or timed out. Safe for the caller to
    /// retry with backoff; never retried inside the coordinator.
    #[error("External converter failed during {stage}: {detail}")]
    ExternalToolFailed { stage: Stage, detail: String },

    /// The store could not be reached. When raised during [`Stage::Caching`]
    /// the converted bytes are kept in `output` and remain deliverable.
    #[error("Conversion store unavailable during {stage}: {source}")]
    StoreUnavailable {
        stage: Stage,
        #[source]
        source: StoreError,
        output: Option<Box<ConversionOutcome>>,
    },

    /// A stored record failed its integrity check. The record is not used.
    #[error("Conversion store returned a corrupt record during {stage}: {source}")]
    StoreCorrupt {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConversionError {
    /// Wrap a store failure with the stage it happened in.
    pub(crate) fn from_store(stage: Stage, source: StoreError) -> Self {
        match source {
            StoreError::Corrupt { .. } => ConversionError::StoreCorrupt { stage, source },
            StoreError::Unavailable(_) => ConversionError::StoreUnavailable {
                stage,
                source,
                output: None,
            },
        }
    }

    /// Stage at which the request failed, if it got past validation.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ConversionError::ExternalToolFailed { stage, .. }
            | ConversionError::StoreUnavailable { stage, .. }
            | ConversionError::StoreCorrupt { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// `true` for errors caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ConversionError::EmptyInput
                | ConversionError::InputTooLarge { .. }
                | ConversionError::UnsupportedFormat { .. }
                | ConversionError::UnknownSourceFormat { .. }
                | ConversionError::FileNotFound { .. }
                | ConversionError::PermissionDenied { .. }
        )
    }

    /// `true` when the same request may succeed if the caller retries later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConversionError::ExternalToolFailed { .. }
                | ConversionError::StoreUnavailable { .. }
                | ConversionError::DownloadFailed { .. }
                | ConversionError::DownloadTimeout { .. }
        )
    }

    /// The converted result that survived a failed cache write, if any.
    pub fn salvaged_output(&self) -> Option<&ConversionOutcome> {
        match self {
            ConversionError::StoreUnavailable {
                output: Some(out), ..
            } => Some(out),
            _ => None,
        }
    }
}

// ── Delivery errors ──────────────────────────────────────────────────────

/// Failure to hand a result to its destination.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The notifier failed or timed out. Not retried.
    #[error("Notifier unavailable: {detail}")]
    NotifierUnavailable { detail: String },

    /// The destination string is not acceptable to the notifier.
    #[error("Invalid destination '{0}'\nExpected an email address such as user@example.com.")]
    InvalidDestination(String),
}

// ── Service errors ───────────────────────────────────────────────────────

/// Error from the end-to-end pipeline (coordinator, then dispatcher).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The conversion itself failed; nothing was delivered.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The conversion succeeded (and was cached) but delivery failed.
    #[error("Delivery failed after a successful conversion: {error}")]
    Delivery {
        #[source]
        error: DeliveryError,
        outcome: Box<ConversionOutcome>,
    },
}

impl PipelineError {
    /// Result bytes that were produced before the pipeline failed.
    pub fn output_bytes(&self) -> Option<Bytes> {
        match self {
            PipelineError::Conversion(e) => e.salvaged_output().map(|o| o.bytes.clone()),
            PipelineError::Delivery { outcome, .. } => Some(outcome.bytes.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_display() {
        let e = ConversionError::UnsupportedFormat {
            source_format: Format::Mp3,
            target: Format::Pdf,
            pair: FormatPair::default(),
        };
        let msg = e.to_string();
        assert!(msg.contains("mp3"), "got: {msg}");
        assert!(msg.contains("docx ⇄ pdf"), "got: {msg}");
        assert!(e.is_client_error());
        assert!(!e.is_retryable());
    }

    #[test]
    fn store_error_wrapping_keeps_stage() {
        let e = ConversionError::from_store(
            Stage::CacheCheck,
            StoreError::Unavailable("disk gone".into()),
        );
        assert_eq!(e.stage(), Some(Stage::CacheCheck));
        assert!(e.is_retryable());
        assert!(e.to_string().contains("cache check"));
        assert!(e.salvaged_output().is_none());
    }

    #[test]
    fn corrupt_record_is_not_retryable() {
        let e = ConversionError::from_store(
            Stage::CacheCheck,
            StoreError::Corrupt {
                id: 7,
                detail: "format_b_blob hash mismatch".into(),
            },
        );
        assert!(matches!(e, ConversionError::StoreCorrupt { .. }));
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("record 7"));
    }

    #[test]
    fn tool_timeout_display() {
        let e = ToolError::TimedOut {
            tool: "soffice".into(),
            secs: 120,
        };
        assert!(e.to_string().contains("120s"));
    }

    #[test]
    fn input_too_large_display() {
        let e = ConversionError::InputTooLarge {
            size: 9_000_000,
            limit: 8_388_608,
        };
        assert!(e.to_string().contains("8388608"));
    }
}
