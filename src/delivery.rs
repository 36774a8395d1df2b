//! Hands a resolved result to the notifier.
//!
//! Delivery happens strictly after the coordinator is done, so a notifier
//! failure can never undo or block a cache write. Failed deliveries are not
//! retried and never trigger a second conversion.

use crate::error::DeliveryError;
use crate::format::Format;
use crate::notifier::Notifier;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s/\\]+@[^@\s/\\]+\.[^@\s/\\.]{2,}$").unwrap());

/// Stem used when the request carried no file name.
pub const DEFAULT_STEM: &str = "converted";

/// Where a result goes: an email address, or a plain label for notifiers
/// that route by name (the outbox).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination(String);

impl Destination {
    /// Parse an email address.
    pub fn email(raw: &str) -> Result<Self, DeliveryError> {
        let raw = raw.trim();
        if RE_EMAIL.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(DeliveryError::InvalidDestination(raw.to_string()))
        }
    }

    /// Parse a free-form label. It becomes a directory name, so path
    /// separators and `.`/`..` are refused.
    pub fn label(raw: &str) -> Result<Self, DeliveryError> {
        let raw = raw.trim();
        let bad = raw.is_empty()
            || raw == "."
            || raw == ".."
            || raw.contains(['/', '\\', '\0']);
        if bad {
            Err(DeliveryError::InvalidDestination(raw.to_string()))
        } else {
            Ok(Self(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attachment name for a result: the request's file stem plus the result
/// format's extension, e.g. `report.docx` → `report.pdf`.
pub fn attachment_name(file_name: Option<&str>, format: Format) -> String {
    let stem = file_name
        .and_then(|n| Path::new(n).file_stem())
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_STEM);
    format!("{stem}.{}", format.extension())
}

/// Sends finished documents through a [`Notifier`] with a time bound.
#[derive(Clone)]
pub struct DeliveryDispatcher {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl DeliveryDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }

    /// Validate a raw destination for this dispatcher's notifier.
    pub fn destination(&self, raw: &str) -> Result<Destination, DeliveryError> {
        if self.notifier.requires_email() {
            Destination::email(raw)
        } else {
            Destination::label(raw)
        }
    }

    /// Deliver `result` to `destination`. Returns the attachment name used.
    pub async fn deliver(
        &self,
        destination: &Destination,
        result: Bytes,
        format: Format,
        file_name: Option<&str>,
    ) -> Result<String, DeliveryError> {
        let name = attachment_name(file_name, format);
        let size = result.len();

        let send = self
            .notifier
            .send(destination.as_str(), result, &name, format.mime_type());

        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(())) => {
                info!(
                    "Delivered {} ({} bytes) to {} via {}",
                    name,
                    size,
                    destination,
                    self.notifier.name()
                );
                Ok(name)
            }
            Ok(Err(e)) => {
                warn!("Delivery of {} to {} failed: {}", name, destination, e);
                Err(DeliveryError::NotifierUnavailable {
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                warn!("Delivery of {} to {} timed out", name, destination);
                Err(DeliveryError::NotifierUnavailable {
                    detail: format!(
                        "{} did not answer within {}s",
                        self.notifier.name(),
                        self.timeout.as_secs()
                    ),
                })
            }
        }
    }
}

impl fmt::Debug for DeliveryDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryDispatcher")
            .field("notifier", &self.notifier.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifierError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(
            &self,
            destination: &str,
            _attachment: Bytes,
            attachment_name: &str,
            mime_type: &str,
        ) -> Result<(), NotifierError> {
            self.sent.lock().unwrap().push((
                destination.to_string(),
                attachment_name.to_string(),
                mime_type.to_string(),
            ));
            Ok(())
        }
    }

    struct Stalled;

    #[async_trait]
    impl Notifier for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn send(&self, _: &str, _: Bytes, _: &str, _: &str) -> Result<(), NotifierError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[test]
    fn email_validation() {
        assert!(Destination::email("user@example.com").is_ok());
        assert!(Destination::email(" first.last+tag@sub.example.org ").is_ok());
        assert!(Destination::email("not-an-email").is_err());
        assert!(Destination::email("a@b").is_err());
        assert!(Destination::email("../etc@x.com").is_err());
        assert!(Destination::email("").is_err());
    }

    #[test]
    fn label_validation() {
        assert!(Destination::label("team-inbox").is_ok());
        assert!(Destination::label("..").is_err());
        assert!(Destination::label("a/b").is_err());
        assert!(Destination::label("   ").is_err());
    }

    #[test]
    fn attachment_name_uses_request_stem() {
        assert_eq!(attachment_name(Some("report.docx"), Format::Pdf), "report.pdf");
        assert_eq!(attachment_name(Some("/tmp/deck.v2.pptx"), Format::Pdf), "deck.v2.pdf");
        assert_eq!(attachment_name(None, Format::Docx), "converted.docx");
    }

    #[tokio::test]
    async fn deliver_passes_name_and_mime() {
        let rec = Arc::new(Recording::default());
        let d = DeliveryDispatcher::new(rec.clone(), Duration::from_secs(5));
        let dest = d.destination("user@example.com").unwrap();
        let name = d
            .deliver(&dest, Bytes::from_static(b"HELLO-PDF"), Format::Pdf, Some("hello.docx"))
            .await
            .unwrap();

        assert_eq!(name, "hello.pdf");
        let sent = rec.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            ("user@example.com".into(), "hello.pdf".into(), "application/pdf".into())
        );
    }

    #[tokio::test]
    async fn stalled_notifier_times_out() {
        let d = DeliveryDispatcher::new(Arc::new(Stalled), Duration::from_millis(50));
        let dest = d.destination("user@example.com").unwrap();
        let err = d
            .deliver(&dest, Bytes::from_static(b"x"), Format::Pdf, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::NotifierUnavailable { .. }));
    }
}
