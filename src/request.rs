//! Conversion requests and input loading.
//!
//! A [`ConversionRequest`] is the ephemeral unit of work: bytes, the source
//! format they are declared to be in, the wanted target format, and an
//! optional destination. When no source format is declared it is inferred
//! from the file name's extension, never from content.
//!
//! [`load_input`] reads a local path or downloads an `http(s)://` URL into
//! memory so the CLI can build requests from either.

use crate::delivery::Destination;
use crate::error::ConversionError;
use crate::format::Format;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// One inbound conversion job.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: Bytes,
    pub source: Format,
    pub target: Format,
    /// Original file name; used for the attachment name and in logs.
    pub file_name: Option<String>,
    pub destination: Option<Destination>,
}

impl ConversionRequest {
    /// Request with a declared source format.
    pub fn new(input: impl Into<Bytes>, source: Format, target: Format) -> Self {
        Self {
            input: input.into(),
            source,
            target,
            file_name: None,
            destination: None,
        }
    }

    /// Request whose source format is inferred from `file_name`.
    pub fn from_named(
        input: impl Into<Bytes>,
        file_name: &str,
        target: Format,
    ) -> Result<Self, ConversionError> {
        let source = Format::from_file_name(file_name).ok_or_else(|| {
            ConversionError::UnknownSourceFormat {
                name: file_name.to_string(),
            }
        })?;
        Ok(Self::new(input, source, target).with_file_name(file_name))
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Human-readable identifier for logs and progress events.
    pub fn label(&self) -> &str {
        self.file_name.as_deref().unwrap_or("<bytes>")
    }
}

/// Input loaded into memory, with the name it should be known by.
#[derive(Debug, Clone)]
pub struct LoadedInput {
    pub bytes: Bytes,
    /// Final path component of the path or URL.
    pub file_name: String,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Read a local file or download a URL.
pub async fn load_input(
    input: &str,
    download_timeout_secs: u64,
) -> Result<LoadedInput, ConversionError> {
    if is_url(input) {
        download_url(input, download_timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

async fn read_local(path: &Path) -> Result<LoadedInput, ConversionError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => ConversionError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => ConversionError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    debug!("Read {} ({} bytes)", path.display(), bytes.len());
    Ok(LoadedInput {
        bytes: Bytes::from(bytes),
        file_name,
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<LoadedInput, ConversionError> {
    info!("Downloading input from: {}", url);

    let failed = |reason: String| ConversionError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ConversionError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let file_name = file_name_from_url(url);
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    info!("Downloaded {} ({} bytes)", file_name, bytes.len());
    Ok(LoadedInput { bytes, file_name })
}

/// Last non-empty path segment that has an extension, else `download`.
fn file_name_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "download".to_string()
}

/// Where the CLI writes a result for `input` inside `out_dir`.
pub fn output_path(out_dir: &Path, file_name: &str, target: Format) -> PathBuf {
    out_dir.join(crate::delivery::attachment_name(Some(file_name), target))
}
