//! The external converter capability.
//!
//! The cache never transcodes anything itself. A [`Converter`] receives the
//! input bytes, the declared source format and the target format, and returns
//! the converted bytes or a [`ToolError`] carrying the tool's diagnostic.
//!
//! Two adapters ship with the crate:
//!
//! - [`CommandConverter`] runs a local executable (LibreOffice by default,
//!   or anything that reads a file and writes one, e.g. ffmpeg).
//! - [`HttpConverter`] posts the bytes to a remote conversion API and, if the
//!   API answers with an asynchronous job, polls it until done.
//!
//! Implementations must honour `timeout` and must be cancel-safe: dropping
//! the returned future abandons the conversion (the command adapter kills its
//! child process).

pub mod command;
pub mod http;

pub use command::CommandConverter;
pub use http::HttpConverter;

use crate::error::ToolError;
use crate::format::Format;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Opaque document transcoder.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Convert `input` from `source` to `target` within `timeout`.
    async fn convert(
        &self,
        input: Bytes,
        source: Format,
        target: Format,
        timeout: Duration,
    ) -> Result<Bytes, ToolError>;
}

/// Keep at most the last `max` chars of a tool diagnostic.
pub(crate) fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max {
        return trimmed.to_string();
    }
    let skipped: String = trimmed.chars().skip(count - max).collect();
    format!("\u{2026}{skipped}")
}
