//! Progress-callback trait for per-request pipeline events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::CacheConfigBuilder::progress_callback`] to receive events
//! as requests move through the pipeline. The CLI uses it to drive a progress
//! bar; a server could forward events to metrics or a job table.
//!
//! # Example
//!
//! ```rust
//! use doccache::{CacheConfig, ConversionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct HitCounter(AtomicUsize);
//!
//! impl ConversionProgressCallback for HitCounter {
//!     fn on_cache_hit(&self, _label: &str, _bytes: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = CacheConfig::builder()
//!     .progress_callback(Arc::new(HitCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::CacheWrite;
use std::sync::Arc;

/// Called by the pipeline as it processes each request.
///
/// Implementations must be `Send + Sync`: batch entry points run several
/// requests concurrently and events for different requests interleave. All
/// methods default to no-ops. `label` identifies the request (usually its
/// file name).
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once before a batch starts.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when a request enters the pipeline.
    fn on_request_start(&self, label: &str) {
        let _ = label;
    }

    /// The store already held the counterpart.
    fn on_cache_hit(&self, label: &str, bytes: usize) {
        let _ = (label, bytes);
    }

    /// Cache miss; the external converter is being invoked.
    fn on_convert_start(&self, label: &str) {
        let _ = label;
    }

    /// The converter returned `bytes` of output after `duration_ms`.
    fn on_convert_complete(&self, label: &str, bytes: usize, duration_ms: u64) {
        let _ = (label, bytes, duration_ms);
    }

    /// The cache write after a conversion finished (or was skipped).
    fn on_cache_write(&self, label: &str, write: CacheWrite) {
        let _ = (label, write);
    }

    /// The result was handed to the notifier.
    fn on_delivered(&self, label: &str, destination: &str) {
        let _ = (label, destination);
    }

    /// The request failed. `error` is human-readable.
    fn on_failed(&self, label: &str, error: &str) {
        let _ = (label, error);
    }

    /// A batch entry finished, successfully or not. Fired exactly once per
    /// `index`, even when several entries share a label.
    fn on_request_complete(&self, index: usize, label: &str, ok: bool) {
        let _ = (index, label, ok);
    }

    /// Called once after every request of a batch has finished.
    fn on_batch_complete(&self, total: usize, succeeded: usize) {
        let _ = (total, succeeded);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::CacheConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
