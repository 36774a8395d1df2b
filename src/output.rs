//! Result types produced by the coordinator and the service pipeline.
//!
//! Everything except the raw bytes is `Serialize` so the CLI can emit a JSON
//! report per input with `--json`.

use crate::fingerprint::Digest;
use crate::format::Format;
use bytes::Bytes;
use serde::Serialize;

/// Where the result bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Served from the store; the converter was not invoked.
    CacheHit,
    /// Produced by the external converter during this request.
    Converted,
}

/// What happened to the cache after a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheWrite {
    /// A new record was committed.
    Stored,
    /// A record for this input already existed (concurrent duplicate upload).
    AlreadyPresent,
    /// Not cached: the output bytes already belong to a record for a
    /// different input. Later requests for this input convert again.
    CounterpartOwned,
    /// Nothing was written: a cache hit, or an output identical to its input.
    NotAttempted,
}

/// Wall-clock time spent in each stage, in milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub fingerprint_ms: u64,
    pub lookup_ms: u64,
    pub convert_ms: u64,
    pub insert_ms: u64,
    pub total_ms: u64,
}

/// The resolved answer to one conversion request.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutcome {
    /// Result bytes in `format`.
    #[serde(skip)]
    pub bytes: Bytes,
    /// Format of `bytes`.
    pub format: Format,
    /// Fingerprint of the request input.
    pub input_digest: Digest,
    /// Fingerprint of `bytes`.
    pub output_digest: Digest,
    pub origin: Origin,
    pub cache_write: CacheWrite,
    pub timings: StageTimings,
}

impl ConversionOutcome {
    pub fn is_cache_hit(&self) -> bool {
        self.origin == Origin::CacheHit
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Outcome of handing a result to the notifier.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// No destination was given; the caller keeps the bytes.
    Skipped,
    Delivered { destination: String, attachment: String },
}

/// Full report for one request that made it through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    /// Caller-supplied label (usually the input file name).
    pub label: String,
    pub outcome: ConversionOutcome,
    pub delivery: DeliveryStatus,
}
