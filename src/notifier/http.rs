//! JSON mail-API notifier.
//!
//! Sends one `POST` per delivery:
//!
//! ```json
//! {
//!   "from": "converter@example.com",
//!   "to": "user@example.com",
//!   "subject": "Your converted document: report.pdf",
//!   "text": "...",
//!   "attachments": [
//!     { "filename": "report.pdf", "content_type": "application/pdf", "content": "<base64>" }
//!   ]
//! }
//! ```
//!
//! Any 2xx status is success.

use super::Notifier;
use crate::error::NotifierError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Serialize)]
struct MailAttachment<'a> {
    filename: &'a str,
    content_type: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct MailMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    text: String,
    attachments: Vec<MailAttachment<'a>>,
}

/// Notifier that posts to a transactional-mail HTTP API.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
    token: Option<String>,
    sender: String,
}

impl HttpNotifier {
    pub fn new(
        endpoint: impl Into<String>,
        sender: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            token,
            sender: sender.into(),
        }
    }

    fn message<'a>(
        &'a self,
        destination: &'a str,
        attachment: &[u8],
        attachment_name: &'a str,
        mime_type: &'a str,
    ) -> MailMessage<'a> {
        MailMessage {
            from: &self.sender,
            to: destination,
            subject: format!("Your converted document: {attachment_name}"),
            text: format!("The converted file {attachment_name} is attached."),
            attachments: vec![MailAttachment {
                filename: attachment_name,
                content_type: mime_type,
                content: STANDARD.encode(attachment),
            }],
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    fn name(&self) -> &str {
        "mail-api"
    }

    async fn send(
        &self,
        destination: &str,
        attachment: Bytes,
        attachment_name: &str,
        mime_type: &str,
    ) -> Result<(), NotifierError> {
        let body = self.message(destination, &attachment, attachment_name, mime_type);
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| NotifierError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(NotifierError::Rejected {
                status: status.as_u16(),
                detail: crate::converter::tail(&detail, 300),
            });
        }

        debug!("Mail API accepted {} for {}", attachment_name, destination);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub_http::{Reply, StubServer};

    #[test]
    fn message_carries_base64_attachment() {
        let n = HttpNotifier::new("https://mail.example.com/send", "noreply@example.com", None);
        let msg = n.message("user@example.com", b"HELLO-PDF", "report.pdf", "application/pdf");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["to"], "user@example.com");
        assert_eq!(json["from"], "noreply@example.com");
        assert_eq!(json["attachments"][0]["filename"], "report.pdf");
        assert_eq!(json["attachments"][0]["content"], STANDARD.encode(b"HELLO-PDF"));
        assert!(json["subject"].as_str().unwrap().contains("report.pdf"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let n = HttpNotifier::new("http://127.0.0.1:9/send", "noreply@example.com", None);
        let err = n
            .send("user@example.com", Bytes::from_static(b"x"), "x.pdf", "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifierError::Transport(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn posts_json_message_with_token() {
        let server = StubServer::start(vec![Reply::new(202, "")]).await;
        let n = HttpNotifier::new(
            format!("{}/send", server.url),
            "noreply@example.com",
            Some("mail-key".into()),
        );
        n.send(
            "user@example.com",
            Bytes::from_static(b"HELLO-PDF"),
            "report.pdf",
            "application/pdf",
        )
        .await
        .unwrap();

        let seen = server.requests();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].request_line.starts_with("POST /send "));
        assert_eq!(seen[0].header("authorization"), Some("Bearer mail-key"));
        assert_eq!(seen[0].header("content-type"), Some("application/json"));
        let json: serde_json::Value = serde_json::from_slice(&seen[0].body).unwrap();
        assert_eq!(json["to"], "user@example.com");
        assert_eq!(json["attachments"][0]["content"], STANDARD.encode(b"HELLO-PDF"));
    }

    #[tokio::test]
    async fn refused_message_is_rejected_with_status() {
        let server = StubServer::start(vec![Reply::new(503, "mailbox quota exceeded")]).await;
        let n = HttpNotifier::new(format!("{}/send", server.url), "noreply@example.com", None);
        let err = n
            .send("user@example.com", Bytes::from_static(b"x"), "x.pdf", "application/pdf")
            .await
            .unwrap_err();
        match err {
            NotifierError::Rejected { status, detail } => {
                assert_eq!(status, 503);
                assert!(detail.contains("quota exceeded"), "got: {detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
