//! The delivery capability.
//!
//! A [`Notifier`] hands one finished document to one destination. The crate
//! ships an HTTP mail-API client ([`HttpNotifier`]) and a filesystem outbox
//! ([`OutboxNotifier`]) that the CLI falls back to when no mail service is
//! configured.

pub mod http;
pub mod outbox;

pub use http::HttpNotifier;
pub use outbox::OutboxNotifier;

use crate::error::NotifierError;
use async_trait::async_trait;
use bytes::Bytes;

/// Opaque result delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether destinations must be email addresses. Notifiers that route by
    /// free-form label (the outbox) return `false`.
    fn requires_email(&self) -> bool {
        true
    }

    async fn send(
        &self,
        destination: &str,
        attachment: Bytes,
        attachment_name: &str,
        mime_type: &str,
    ) -> Result<(), NotifierError>;
}
