//! End-to-end pipeline: resolve through the cache, then deliver.
//!
//! [`ConversionService::process`] handles one request. [`process_all`] and
//! [`process_stream`] run many at once (bounded by `config.concurrency`);
//! the first returns every result in input order, the second yields each
//! result as soon as it is ready.
//!
//! A request that converted but could not be cached still gets delivered:
//! the bytes travel inside the error and are handed to the notifier before
//! the error is returned.
//!
//! [`process_all`]: ConversionService::process_all
//! [`process_stream`]: ConversionService::process_stream

use crate::config::CacheConfig;
use crate::converter::Converter;
use crate::coordinator::ConversionCoordinator;
use crate::delivery::{DeliveryDispatcher, Destination};
use crate::error::{ConversionError, DeliveryError, PipelineError, Stage};
use crate::notifier::Notifier;
use crate::output::{ConversionOutcome, DeliveryStatus, ProcessReport};
use crate::request::ConversionRequest;
use crate::store::{ConversionStore, SqliteStore};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::{info, warn};

/// Result of one request within a batch.
#[derive(Debug)]
pub struct BatchItem {
    /// Position of the request in the submitted batch.
    pub index: usize,
    pub label: String,
    pub result: Result<ProcessReport, PipelineError>,
}

/// A boxed stream of batch results, in completion order.
pub type ReportStream = Pin<Box<dyn Stream<Item = BatchItem> + Send>>;

/// Coordinator plus optional delivery.
#[derive(Debug, Clone)]
pub struct ConversionService {
    coordinator: Arc<ConversionCoordinator>,
    dispatcher: Option<DeliveryDispatcher>,
}

impl ConversionService {
    pub fn new(
        store: Arc<dyn ConversionStore>,
        converter: Arc<dyn Converter>,
        notifier: Option<Arc<dyn Notifier>>,
        config: CacheConfig,
    ) -> Self {
        let dispatcher = notifier.map(|n| DeliveryDispatcher::new(n, config.notifier_timeout()));
        Self {
            coordinator: Arc::new(ConversionCoordinator::new(store, converter, config)),
            dispatcher,
        }
    }

    /// Open the SQLite store named by `config` and wire everything up.
    pub async fn open(
        config: CacheConfig,
        converter: Arc<dyn Converter>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self, ConversionError> {
        let store = SqliteStore::from_config(&config)
            .await
            .map_err(|e| ConversionError::from_store(Stage::CacheCheck, e))?;
        Ok(Self::new(Arc::new(store), converter, notifier, config))
    }

    pub fn coordinator(&self) -> &ConversionCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &CacheConfig {
        self.coordinator.config()
    }

    /// Validate `raw` for the configured notifier.
    pub fn destination(&self, raw: &str) -> Result<Destination, DeliveryError> {
        match &self.dispatcher {
            Some(d) => d.destination(raw),
            None => Err(DeliveryError::NotifierUnavailable {
                detail: "no notifier configured".into(),
            }),
        }
    }

    /// Number of records in the store.
    pub async fn record_count(&self) -> Result<u64, ConversionError> {
        self.coordinator
            .store()
            .len()
            .await
            .map_err(|e| ConversionError::from_store(Stage::CacheCheck, e))
    }

    /// Resolve one request and deliver it if it names a destination.
    pub async fn process(
        &self,
        request: ConversionRequest,
    ) -> Result<ProcessReport, PipelineError> {
        let outcome = match self.coordinator.resolve(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let (Some(salvaged), Some(dest)) = (e.salvaged_output(), &request.destination) {
                    warn!("{}: delivering a result that could not be cached", request.label());
                    if let Err(de) = self.deliver(&request, dest, salvaged).await {
                        warn!("{}: salvage delivery failed too: {}", request.label(), de);
                    }
                }
                return Err(e.into());
            }
        };

        let delivery = match &request.destination {
            None => DeliveryStatus::Skipped,
            Some(dest) => match self.deliver(&request, dest, &outcome).await {
                Ok(attachment) => DeliveryStatus::Delivered {
                    destination: dest.to_string(),
                    attachment,
                },
                Err(error) => {
                    if let Some(cb) = &self.config().progress_callback {
                        cb.on_failed(request.label(), &error.to_string());
                    }
                    return Err(PipelineError::Delivery {
                        error,
                        outcome: Box::new(outcome),
                    });
                }
            },
        };

        Ok(ProcessReport {
            label: request.label().to_string(),
            outcome,
            delivery,
        })
    }

    async fn deliver(
        &self,
        request: &ConversionRequest,
        dest: &Destination,
        outcome: &ConversionOutcome,
    ) -> Result<String, DeliveryError> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| DeliveryError::NotifierUnavailable {
                detail: "no notifier configured".into(),
            })?;
        let attachment = dispatcher
            .deliver(dest, outcome.bytes.clone(), outcome.format, request.file_name.as_deref())
            .await?;
        if let Some(cb) = &self.config().progress_callback {
            cb.on_delivered(request.label(), dest.as_str());
        }
        Ok(attachment)
    }

    /// Process a batch concurrently; results come back in input order.
    pub async fn process_all(&self, requests: Vec<ConversionRequest>) -> Vec<BatchItem> {
        let total = requests.len();
        if let Some(cb) = &self.config().progress_callback {
            cb.on_batch_start(total);
        }

        let mut items: Vec<BatchItem> = self.process_stream(requests).collect().await;
        items.sort_by_key(|item| item.index);

        let succeeded = items.iter().filter(|i| i.result.is_ok()).count();
        info!("Batch complete: {}/{} succeeded", succeeded, total);
        if let Some(cb) = &self.config().progress_callback {
            cb.on_batch_complete(total, succeeded);
        }
        items
    }

    /// Process a batch concurrently, yielding results as they complete.
    pub fn process_stream(&self, requests: Vec<ConversionRequest>) -> ReportStream {
        let concurrency = self.config().concurrency;
        let service = self.clone();

        let s = stream::iter(requests.into_iter().enumerate().map(move |(index, request)| {
            let service = service.clone();
            async move {
                let label = request.label().to_string();
                let result = service.process(request).await;
                if let Some(cb) = &service.config().progress_callback {
                    cb.on_request_complete(index, &label, result.is_ok());
                }
                BatchItem { index, label, result }
            }
        }))
        .buffer_unordered(concurrency);

        Box::pin(s)
    }
}
