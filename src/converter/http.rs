//! Remote conversion API client.
//!
//! Protocol:
//!
//! 1. `POST {endpoint}?from=<source>&to=<target>` with the raw input as body,
//!    `Content-Type` set to the source MIME type, optional bearer token.
//! 2. `200 OK`: the body is the converted document.
//! 3. `202 Accepted` + `Location`: the job runs asynchronously. `GET` the
//!    location with exponential backoff (`poll_interval * 2^n`, capped) until
//!    it answers `200` (done, body is the document) or anything other than
//!    `202` (failed).
//!
//! `415 Unsupported Media Type` means the service cannot do this pair
//! ([`ToolError::Unsupported`]). Every other status is a tool failure
//! carrying a body excerpt. The whole
//! exchange, polling included, is bounded by the caller's timeout.

use super::{tail, Converter};
use crate::error::ToolError;
use crate::format::Format;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode, Url};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const TOOL: &str = "conversion-api";
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Converter backed by an HTTP conversion service.
#[derive(Debug, Clone)]
pub struct HttpConverter {
    client: Client,
    endpoint: Url,
    token: Option<String>,
    poll_interval: Duration,
}

impl HttpConverter {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self, ToolError> {
        let endpoint = Url::parse(endpoint).map_err(|e| ToolError::Failed {
            tool: TOOL.into(),
            detail: format!("invalid endpoint '{endpoint}': {e}"),
        })?;
        let client = Client::builder().build().map_err(|e| ToolError::Failed {
            tool: TOOL.into(),
            detail: format!("cannot build HTTP client: {e}"),
        })?;
        Ok(Self {
            client,
            endpoint,
            token,
            poll_interval: Duration::from_millis(250),
        })
    }

    /// First delay between job polls. Default: 250 ms.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn transport_err(e: reqwest::Error, timeout: Duration) -> ToolError {
        if e.is_timeout() {
            ToolError::TimedOut {
                tool: TOOL.into(),
                secs: timeout.as_secs(),
            }
        } else {
            ToolError::Failed {
                tool: TOOL.into(),
                detail: e.to_string(),
            }
        }
    }

    async fn rejected(resp: reqwest::Response) -> ToolError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        ToolError::Failed {
            tool: TOOL.into(),
            detail: format!("HTTP {}: {}", status.as_u16(), tail(&body, 300)),
        }
    }

    async fn poll_job(
        &self,
        job: Url,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Bytes, ToolError> {
        let timed_out = || ToolError::TimedOut {
            tool: TOOL.into(),
            secs: timeout.as_secs(),
        };

        for attempt in 0u32.. {
            let backoff = self
                .poll_interval
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(MAX_POLL_INTERVAL);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining <= backoff {
                return Err(timed_out());
            }
            sleep(backoff).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let resp = self
                .authorize(self.client.get(job.clone()).timeout(remaining))
                .send()
                .await
                .map_err(|e| Self::transport_err(e, timeout))?;

            match resp.status() {
                StatusCode::OK => {
                    debug!("Job {} finished after {} polls", job, attempt + 1);
                    return resp.bytes().await.map_err(|e| Self::transport_err(e, timeout));
                }
                StatusCode::ACCEPTED => continue,
                _ => return Err(Self::rejected(resp).await),
            }
        }
        Err(timed_out())
    }
}

#[async_trait]
impl Converter for HttpConverter {
    fn name(&self) -> &str {
        TOOL
    }

    async fn convert(
        &self,
        input: Bytes,
        source: Format,
        target: Format,
        timeout: Duration,
    ) -> Result<Bytes, ToolError> {
        let deadline = Instant::now() + timeout;
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("from", source.extension())
            .append_pair("to", target.extension());

        info!("POST {} ({} bytes, {} → {})", self.endpoint, input.len(), source, target);

        let req = self
            .client
            .post(url)
            .header(CONTENT_TYPE, source.mime_type())
            .header(ACCEPT, target.mime_type())
            .timeout(timeout)
            .body(input);

        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Self::transport_err(e, timeout))?;

        match resp.status() {
            StatusCode::OK => resp.bytes().await.map_err(|e| Self::transport_err(e, timeout)),
            StatusCode::ACCEPTED => {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ToolError::Failed {
                        tool: TOOL.into(),
                        detail: "202 Accepted without a Location header".into(),
                    })?;
                let job = self.endpoint.join(location).map_err(|e| ToolError::Failed {
                    tool: TOOL.into(),
                    detail: format!("bad job location '{location}': {e}"),
                })?;
                debug!("Conversion queued as {}", job);
                self.poll_job(job, deadline, timeout).await
            }
            StatusCode::UNSUPPORTED_MEDIA_TYPE => Err(ToolError::Unsupported {
                tool: TOOL.into(),
                source_format: source,
                target,
            }),
            status => {
                warn!("Conversion API answered {}", status);
                Err(Self::rejected(resp).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub_http::{Reply, StubServer};

    #[test]
    fn rejects_invalid_endpoint() {
        let err = HttpConverter::new("not a url", None).unwrap_err();
        assert!(err.to_string().contains("invalid endpoint"));
    }

    #[test]
    fn relative_location_resolves_against_endpoint() {
        let conv = HttpConverter::new("https://convert.example.com/v1/convert", None).unwrap();
        let job = conv.endpoint.join("/v1/jobs/42").unwrap();
        assert_eq!(job.as_str(), "https://convert.example.com/v1/jobs/42");
    }

    #[tokio::test]
    async fn unreachable_service_is_a_tool_failure() {
        // Port 9 (discard) on localhost is closed in test environments.
        let conv = HttpConverter::new("http://127.0.0.1:9/convert", None).unwrap();
        let err = conv
            .convert(
                Bytes::from_static(b"x"),
                Format::Docx,
                Format::Pdf,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, ToolError::Failed { .. } | ToolError::TimedOut { .. }),
            "got: {err:?}"
        );
    }

    fn converter(server: &StubServer, token: Option<&str>) -> HttpConverter {
        HttpConverter::new(&format!("{}/convert", server.url), token.map(String::from))
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn docx_to_pdf(conv: &HttpConverter, timeout: Duration) -> Result<Bytes, ToolError> {
        conv.convert(Bytes::from_static(b"hello-doc"), Format::Docx, Format::Pdf, timeout)
            .await
    }

    #[tokio::test]
    async fn immediate_answer_is_the_document() {
        let server = StubServer::start(vec![Reply::new(200, "HELLO-PDF")]).await;
        let conv = converter(&server, Some("secret"));

        let out = docx_to_pdf(&conv, Duration::from_secs(5)).await.unwrap();
        assert_eq!(&out[..], b"HELLO-PDF");

        let seen = server.requests();
        assert_eq!(seen.len(), 1);
        assert!(
            seen[0].request_line.starts_with("POST /convert?from=docx&to=pdf "),
            "got: {}",
            seen[0].request_line
        );
        assert_eq!(seen[0].header("content-type"), Some(Format::Docx.mime_type()));
        assert_eq!(seen[0].header("accept"), Some(Format::Pdf.mime_type()));
        assert_eq!(seen[0].header("authorization"), Some("Bearer secret"));
        assert_eq!(seen[0].body, b"hello-doc");
    }

    #[tokio::test]
    async fn queued_job_is_polled_until_done() {
        let server = StubServer::start(vec![
            Reply::new(202, "").header("Location", "/jobs/7"),
            Reply::new(202, ""),
            Reply::new(200, "HELLO-PDF"),
        ])
        .await;
        let conv = converter(&server, None);

        let out = docx_to_pdf(&conv, Duration::from_secs(5)).await.unwrap();
        assert_eq!(&out[..], b"HELLO-PDF");

        let seen = server.requests();
        assert_eq!(seen.len(), 3);
        assert!(seen[1].request_line.starts_with("GET /jobs/7 "));
        assert!(seen[2].request_line.starts_with("GET /jobs/7 "));
        assert_eq!(seen[1].header("authorization"), None);
    }

    #[tokio::test]
    async fn accepted_without_location_fails() {
        let server = StubServer::start(vec![Reply::new(202, "")]).await;
        let err = docx_to_pdf(&converter(&server, None), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { detail, .. } => {
                assert!(detail.contains("Location"), "got: {detail}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_status_carries_a_body_excerpt() {
        let server =
            StubServer::start(vec![Reply::new(500, "converter crashed: bad zip header")]).await;
        let err = docx_to_pdf(&converter(&server, None), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { detail, .. } => {
                assert!(detail.contains("HTTP 500"), "got: {detail}");
                assert!(detail.contains("bad zip header"), "got: {detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_job_is_reported() {
        let server = StubServer::start(vec![
            Reply::new(202, "").header("Location", "/jobs/9"),
            Reply::new(422, "password-protected document"),
        ])
        .await;
        let err = docx_to_pdf(&converter(&server, None), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { detail, .. } => {
                assert!(detail.contains("HTTP 422"), "got: {detail}");
                assert!(detail.contains("password-protected"), "got: {detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_media_type_is_unsupported() {
        let server = StubServer::start(vec![Reply::new(415, "")]).await;
        let err = docx_to_pdf(&converter(&server, None), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ToolError::Unsupported {
                    source_format: Format::Docx,
                    target: Format::Pdf,
                    ..
                }
            ),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn job_that_never_finishes_times_out() {
        let server = StubServer::start(vec![
            Reply::new(202, "").header("Location", "/jobs/stuck"),
            Reply::new(202, ""),
        ])
        .await;
        let started = Instant::now();
        let err = docx_to_pdf(&converter(&server, None), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }), "got: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(server.requests().len() >= 2);
    }
}
