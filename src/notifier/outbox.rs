//! Filesystem outbox notifier.
//!
//! Delivers by writing `<root>/<destination>/<attachment_name>`. The write is
//! atomic (temp file in the same directory, then rename), so a reader
//! watching the outbox never sees a partial document.

use super::Notifier;
use crate::error::NotifierError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    root: PathBuf,
}

impl OutboxNotifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    fn name(&self) -> &str {
        "outbox"
    }

    fn requires_email(&self) -> bool {
        false
    }

    async fn send(
        &self,
        destination: &str,
        attachment: Bytes,
        attachment_name: &str,
        _mime_type: &str,
    ) -> Result<(), NotifierError> {
        let dir = self.root.join(destination);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(attachment_name);
        let tmp_path = dir.join(format!(".{attachment_name}.tmp"));
        tokio::fs::write(&tmp_path, &attachment).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!("Wrote {} ({} bytes)", path.display(), attachment.len());
        Ok(())
    }
}
