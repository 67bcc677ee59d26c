use crate::error::{AppError, AppResult};
use crate::music::request::MediaRequest;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Metadata describing a downloaded piece of media
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub uploader: String,
    pub duration_s: u32,
}

/// A realized, on-disk audio artifact.
///
/// The source path is the shared content-addressed file owned by the cache;
/// the per-use path is a guild-scoped link the player may delete freely.
#[derive(Debug)]
pub struct MediaDownload {
    pub request: MediaRequest,
    pub url: String,
    pub metadata: TrackMetadata,
    /// Shared cache file
    pub source_path: PathBuf,
    /// Guild-scoped link, set by ready_for_guild
    pub local_path: Option<PathBuf>,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
}

impl MediaDownload {
    pub fn new(
        request: MediaRequest,
        url: impl Into<String>,
        metadata: TrackMetadata,
        source_path: PathBuf,
        cache_hit: bool,
    ) -> Self {
        Self {
            request,
            url: url.into(),
            metadata,
            source_path,
            local_path: None,
            cache_hit,
            created_at: Utc::now(),
        }
    }

    /// Create the per-use path under the guild directory.
    ///
    /// Hard link when the filesystem allows it, copy otherwise. Either way
    /// the result can be deleted without touching the cached source. The
    /// name is the request uuid so identical videos queued twice get
    /// distinct paths.
    pub fn ready_for_guild(&mut self, guild_dir: &Path) -> AppResult<&Path> {
        if !self.source_path.exists() {
            // Usually means the bot stopped mid-download last run
            return Err(AppError::internal(format!(
                "Source file missing: {}",
                self.source_path.display()
            )));
        }
        std::fs::create_dir_all(guild_dir)?;
        let ext = self
            .source_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp3");
        let target = guild_dir.join(format!("{}.{ext}", self.request.id));
        if std::fs::hard_link(&self.source_path, &target).is_err() {
            std::fs::copy(&self.source_path, &target)?;
        }
        self.local_path = Some(target);
        Ok(self.local_path.as_deref().unwrap())
    }

    /// Path handed to the audio pipeline
    pub fn playable_path(&self) -> &Path {
        self.local_path.as_deref().unwrap_or(&self.source_path)
    }

    /// Delete the per-use file. The cached source is left alone.
    pub fn release(&mut self) {
        if let Some(path) = self.local_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove per-use file");
                }
            }
        }
    }
}

impl std::fmt::Display for MediaDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}
