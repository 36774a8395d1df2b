//! The per-request cache-or-convert state machine.
//!
//! ```text
//! validate ─► Fingerprinting ─► CacheCheck ─┬─► CacheHit ─────────────► Done
//!                                           └─► Converting ─► Caching ─► Done
//!                      (any step) ─► Failed
//! ```
//!
//! The digest used for the lookup is computed from the same immutable
//! `Bytes` that is later inserted, so a record always pairs the exact input
//! with the exact output. With single-flight enabled the per-digest guard is
//! held from the lookup until the insert has finished; a concurrent request
//! for the same bytes waits, then hits.
//!
//! Nothing here retries. Converter failures and store outages are reported
//! with the [`Stage`] they happened in and the caller decides.

use crate::config::CacheConfig;
use crate::converter::Converter;
use crate::error::{ConversionError, Stage, StoreError};
use crate::fingerprint::{digest, Digest};
use crate::format::Side;
use crate::output::{CacheWrite, ConversionOutcome, Origin, StageTimings};
use crate::progress::ConversionProgressCallback;
use crate::request::ConversionRequest;
use crate::singleflight::KeyedLock;
use crate::store::{BlobEntry, ConversionStore, Counterpart, InsertOutcome};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Resolves conversion requests against the store, invoking the converter
/// only on a miss.
pub struct ConversionCoordinator {
    store: Arc<dyn ConversionStore>,
    converter: Arc<dyn Converter>,
    config: CacheConfig,
    flights: KeyedLock,
}

impl ConversionCoordinator {
    pub fn new(
        store: Arc<dyn ConversionStore>,
        converter: Arc<dyn Converter>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            converter,
            config,
            flights: KeyedLock::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConversionStore> {
        &self.store
    }

    fn progress(&self) -> Option<&dyn ConversionProgressCallback> {
        self.config.progress_callback.as_deref()
    }

    /// Check size limits and that `source → target` crosses the configured
    /// pair. Returns the side the source sits on.
    pub fn validate(&self, request: &ConversionRequest) -> Result<Side, ConversionError> {
        if request.input.is_empty() {
            return Err(ConversionError::EmptyInput);
        }
        if request.input.len() > self.config.max_input_bytes {
            return Err(ConversionError::InputTooLarge {
                size: request.input.len(),
                limit: self.config.max_input_bytes,
            });
        }
        self.config
            .formats
            .classify(request.source, request.target)
            .ok_or(ConversionError::UnsupportedFormat {
                source_format: request.source,
                target: request.target,
                pair: self.config.formats,
            })
    }

    /// Serve `request` from the cache, converting and caching on a miss.
    pub async fn resolve(
        &self,
        request: &ConversionRequest,
    ) -> Result<ConversionOutcome, ConversionError> {
        let label = request.label();
        if let Some(cb) = self.progress() {
            cb.on_request_start(label);
        }

        let result = self.run(request).await;

        if let Err(ref e) = result {
            warn!("{}: failed at {}: {}", label, e.stage().unwrap_or(Stage::Failed), e);
            if let Some(cb) = self.progress() {
                cb.on_failed(label, &e.to_string());
            }
        }
        result
    }

    /// Report whether `request` would be served from the cache, without
    /// converting or writing anything.
    pub async fn lookup_only(
        &self,
        request: &ConversionRequest,
    ) -> Result<Option<ConversionOutcome>, ConversionError> {
        let source_side = self.validate(request)?;
        let total_start = Instant::now();
        let input_digest = digest(&request.input);
        let hit = self
            .store
            .lookup(&input_digest)
            .await
            .map_err(|e| ConversionError::from_store(Stage::CacheCheck, e))?;

        let timings = StageTimings {
            total_ms: elapsed_ms(total_start),
            ..Default::default()
        };
        Ok(hit
            .filter(|cp| cp.side == source_side.other())
            .map(|cp| self.hit_outcome(request, input_digest, cp, timings)))
    }

    async fn run(&self, request: &ConversionRequest) -> Result<ConversionOutcome, ConversionError> {
        let total_start = Instant::now();
        let label = request.label();
        let mut timings = StageTimings::default();

        let source_side = self.validate(request)?;
        if !request.source.matches_magic(&request.input) {
            warn!(
                "{}: content does not look like {}; using the declared format",
                label, request.source
            );
        }

        // ── Fingerprinting ───────────────────────────────────────────────
        let stage_start = Instant::now();
        let input_digest = digest(&request.input);
        timings.fingerprint_ms = elapsed_ms(stage_start);
        debug!(
            "{}: {} {} bytes → {}",
            label,
            Stage::Fingerprinting,
            request.input.len(),
            input_digest.short()
        );

        let _flight = if self.config.single_flight {
            Some(self.flights.lock(input_digest).await)
        } else {
            None
        };

        // ── CacheCheck ───────────────────────────────────────────────────
        let stage_start = Instant::now();
        let hit = self
            .store
            .lookup(&input_digest)
            .await
            .map_err(|e| ConversionError::from_store(Stage::CacheCheck, e))?;
        timings.lookup_ms = elapsed_ms(stage_start);

        match hit {
            Some(cp) if cp.side == source_side.other() => {
                timings.total_ms = elapsed_ms(total_start);
                info!(
                    "{}: {} ({} → {}, record {})",
                    label,
                    Stage::CacheHit,
                    request.source,
                    request.target,
                    cp.record_id
                );
                if let Some(cb) = self.progress() {
                    cb.on_cache_hit(label, cp.bytes.len());
                }
                return Ok(self.hit_outcome(request, input_digest, cp, timings));
            }
            Some(cp) => {
                // The store filed these bytes under the target format, so
                // the declared source is wrong. Convert as asked; the insert
                // will find the digest and leave the record alone.
                warn!(
                    "{}: record {} files these bytes as {}, not {}; converting anyway",
                    label,
                    cp.record_id,
                    request.target,
                    request.source
                );
            }
            None => debug!("{}: miss", label),
        }

        // ── Converting ───────────────────────────────────────────────────
        if let Some(cb) = self.progress() {
            cb.on_convert_start(label);
        }
        let stage_start = Instant::now();
        let timeout = self.config.converter_timeout();
        info!(
            "{}: {} {} → {} with {}",
            label,
            Stage::Converting,
            request.source,
            request.target,
            self.converter.name()
        );

        let call = self
            .converter
            .convert(request.input.clone(), request.source, request.target, timeout);
        let output = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                return Err(ConversionError::ExternalToolFailed {
                    stage: Stage::Converting,
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ConversionError::ExternalToolFailed {
                    stage: Stage::Converting,
                    detail: format!(
                        "{} timed out after {}s",
                        self.converter.name(),
                        timeout.as_secs()
                    ),
                })
            }
        };
        if output.is_empty() {
            return Err(ConversionError::ExternalToolFailed {
                stage: Stage::Converting,
                detail: format!("{} returned an empty document", self.converter.name()),
            });
        }
        timings.convert_ms = elapsed_ms(stage_start);
        if let Some(cb) = self.progress() {
            cb.on_convert_complete(label, output.len(), timings.convert_ms);
        }

        let output_digest = digest(&output);
        debug!("{}: output {} bytes → {}", label, output.len(), output_digest.short());

        let mut outcome = ConversionOutcome {
            bytes: output,
            format: request.target,
            input_digest,
            output_digest,
            origin: Origin::Converted,
            cache_write: CacheWrite::NotAttempted,
            timings,
        };

        // ── Caching ──────────────────────────────────────────────────────
        if output_digest == input_digest {
            warn!("{}: converter output is identical to its input; not caching", label);
        } else {
            let stage_start = Instant::now();
            let inserted = self
                .store
                .insert(
                    BlobEntry::new(input_digest, request.input.clone()),
                    BlobEntry::new(output_digest, outcome.bytes.clone()),
                    source_side == Side::A,
                )
                .await;
            outcome.timings.insert_ms = elapsed_ms(stage_start);

            match inserted {
                Ok(InsertOutcome::Inserted) => outcome.cache_write = CacheWrite::Stored,
                Ok(InsertOutcome::AlreadyPresent) => {
                    debug!("{}: record already present", label);
                    outcome.cache_write = CacheWrite::AlreadyPresent;
                }
                Ok(InsertOutcome::CounterpartOwned) => {
                    warn!(
                        "{}: output {} already belongs to another record; \
                         this input stays uncached",
                        label,
                        output_digest.short()
                    );
                    outcome.cache_write = CacheWrite::CounterpartOwned;
                }
                Err(e) => {
                    outcome.timings.total_ms = elapsed_ms(total_start);
                    return Err(self.cache_write_failed(label, e, outcome));
                }
            }
        }

        if let Some(cb) = self.progress() {
            cb.on_cache_write(label, outcome.cache_write);
        }

        outcome.timings.total_ms = elapsed_ms(total_start);
        info!(
            "{}: {} ({} bytes, {}ms total)",
            label,
            Stage::Done,
            outcome.size(),
            outcome.timings.total_ms
        );
        Ok(outcome)
    }

    fn hit_outcome(
        &self,
        request: &ConversionRequest,
        input_digest: Digest,
        cp: Counterpart,
        timings: StageTimings,
    ) -> ConversionOutcome {
        ConversionOutcome {
            bytes: cp.bytes,
            format: request.target,
            input_digest,
            output_digest: cp.digest,
            origin: Origin::CacheHit,
            cache_write: CacheWrite::NotAttempted,
            timings,
        }
    }

    /// The converted bytes outlive a failed insert: they ride along in the
    /// error so the caller can still deliver them.
    fn cache_write_failed(
        &self,
        label: &str,
        e: StoreError,
        outcome: ConversionOutcome,
    ) -> ConversionError {
        warn!("{}: converted but could not cache the result: {}", label, e);
        match e {
            StoreError::Unavailable(_) => ConversionError::StoreUnavailable {
                stage: Stage::Caching,
                source: e,
                output: Some(Box::new(outcome)),
            },
            StoreError::Corrupt { .. } => ConversionError::from_store(Stage::Caching, e),
        }
    }
}

impl std::fmt::Debug for ConversionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionCoordinator")
            .field("converter", &self.converter.name())
            .field("config", &self.config)
            .finish()
    }
}
