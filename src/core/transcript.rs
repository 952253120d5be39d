use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::TranscriptError;

/// Produces the transcript text for a media reference
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn transcript(&self, media_ref: &str) -> Result<String, TranscriptError>;
}

/// Reads transcripts as files under a root directory
pub struct FileTranscriptSource {
    root: PathBuf,
}

impl FileTranscriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a media reference to a path that stays inside the root
    fn resolve(&self, media_ref: &str) -> Result<PathBuf, TranscriptError> {
        let relative = Path::new(media_ref);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if media_ref.trim().is_empty() || escapes {
            return Err(TranscriptError::OutsideRoot(media_ref.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl TranscriptSource for FileTranscriptSource {
    async fn transcript(&self, media_ref: &str) -> Result<String, TranscriptError> {
        let path = self.resolve(media_ref)?;
        debug!("Reading transcript {}", path.display());

        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TranscriptError::NotFound(media_ref.to_string())
            } else {
                TranscriptError::ReadError(path.clone(), e)
            }
        })?;
        if text.trim().is_empty() {
            return Err(TranscriptError::Empty(media_ref.to_string()));
        }
        Ok(text)
    }
}
