//! # doccache
//!
//! A content-addressed cache in front of an external document converter.
//!
//! Converting office documents to PDF (and back) is slow: a cold LibreOffice
//! start alone takes seconds. Users upload the same files again and again, so
//! this crate fingerprints every input with BLAKE3 and keeps each converted
//! pair in SQLite. A pair answers in both directions: once `report.docx` has
//! been turned into `report.pdf`, uploading either one returns the other
//! without running the converter.
//!
//! ## Pipeline Overview
//!
//! ```text
//! input bytes
//!  │
//!  ├─ 1. Validate     size limit, source/target must cross the format pair
//!  ├─ 2. Fingerprint  BLAKE3 digest of the exact bytes
//!  ├─ 3. Lookup       store hit? → return the other side, done
//!  ├─ 4. Convert      external tool (LibreOffice, HTTP API, …) with timeout
//!  ├─ 5. Cache        insert both sides in one transaction (idempotent)
//!  └─ 6. Deliver      optional: hand the result to a notifier (mail, outbox)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doccache::{CacheConfig, CommandConverter, ConversionRequest, ConversionService, Format};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::builder().build()?;
//!     let service = ConversionService::open(
//!         config,
//!         Arc::new(CommandConverter::libreoffice()),
//!         None,
//!     )
//!     .await?;
//!
//!     let bytes = std::fs::read("report.docx")?;
//!     let request = ConversionRequest::from_named(bytes, "report.docx", Format::Pdf)?;
//!     let report = service.process(request).await?;
//!     eprintln!("{:?}: {} bytes", report.outcome.origin, report.outcome.size());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doccache` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! doccache = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod converter;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod notifier;
pub mod output;
pub mod progress;
pub mod request;
pub mod service;
pub mod singleflight;
pub mod store;

#[cfg(test)]
mod stub_http;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{CacheConfig, CacheConfigBuilder};
pub use converter::{CommandConverter, Converter, HttpConverter};
pub use coordinator::ConversionCoordinator;
pub use delivery::{DeliveryDispatcher, Destination};
pub use error::{
    ConversionError, DeliveryError, NotifierError, PipelineError, Stage, StoreError, ToolError,
};
pub use fingerprint::{digest, Digest};
pub use format::{Format, FormatPair, Side};
pub use notifier::{HttpNotifier, Notifier, OutboxNotifier};
pub use output::{
    CacheWrite, ConversionOutcome, DeliveryStatus, Origin, ProcessReport, StageTimings,
};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use request::ConversionRequest;
pub use service::{BatchItem, ConversionService, ReportStream};
pub use store::{ConversionStore, SqliteStore};
