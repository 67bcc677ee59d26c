use crate::config::DownloaderConfig;
use crate::db::TerminalFailureKind;
use crate::music::track::TrackMetadata;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Download failures, split into the two classes the retry discipline
/// cares about
#[derive(Debug)]
pub enum DownloadError {
    /// Transient network-class failure; requeue and feed the backoff tracker
    Retryable(String),
    /// Content-class failure; record the cache sentinel and stop
    Terminal(TerminalFailureKind, String),
}

impl DownloadError {
    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable(reason) => reason,
            Self::Terminal(_, reason) => reason,
        }
    }
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable(reason) => write!(f, "retryable: {reason}"),
            Self::Terminal(kind, reason) => write!(f, "terminal ({kind}): {reason}"),
        }
    }
}

impl std::error::Error for DownloadError {}

/// A successful extraction before cache adoption
#[derive(Debug)]
pub struct DownloadOutcome {
    pub file_path: PathBuf,
    pub canonical_url: String,
    pub metadata: TrackMetadata,
}

/// Map the extractor's stderr onto the failure taxonomy.
///
/// The error strings come from yt-dlp and are stable enough that the
/// original bot matched on them the same way.
fn classify_extractor_error(stderr: &str) -> DownloadError {
    if stderr.contains("Private video") {
        return DownloadError::Terminal(
            TerminalFailureKind::Private,
            "video is private, cannot download".to_string(),
        );
    }
    if stderr.contains("Video unavailable") || stderr.contains("has been removed") {
        return DownloadError::Terminal(
            TerminalFailureKind::Unavailable,
            "video is unavailable, cannot download".to_string(),
        );
    }
    if stderr.contains("Sign in to confirm your age") {
        return DownloadError::Terminal(
            TerminalFailureKind::AgeRestricted,
            "video is age restricted, cannot download".to_string(),
        );
    }
    if stderr.contains("Requested format is not available")
        || stderr.contains("No video formats found")
    {
        return DownloadError::Terminal(
            TerminalFailureKind::InvalidFormat,
            "no usable audio format".to_string(),
        );
    }
    // Bot-detection and throttling are transient: they clear once the
    // backoff tracker slows us down
    if stderr.contains("Sign in to confirm you") && stderr.contains("not a bot") {
        return DownloadError::Retryable("download flagged as bot, backing off".to_string());
    }
    if stderr.contains("HTTP Error 429") || stderr.contains("rate-limited") {
        return DownloadError::Retryable("throttled by remote host".to_string());
    }
    let line = stderr.lines().last().unwrap_or("unknown extractor error");
    DownloadError::Retryable(line.trim().to_string())
}

/// Pull the fields we keep from the extractor's JSON output
fn parse_extractor_json(raw: &str) -> Option<(Value, TrackMetadata)> {
    // The JSON document is the last non-empty stdout line; progress noise
    // may precede it
    let line = raw.lines().rev().find(|l| l.trim_start().starts_with('{'))?;
    let data: Value = serde_json::from_str(line).ok()?;
    let metadata = TrackMetadata {
        title: data["title"].as_str().unwrap_or("unknown").to_string(),
        uploader: data["uploader"].as_str().unwrap_or("").to_string(),
        duration_s: data["duration"].as_f64().unwrap_or(0.0) as u32,
    };
    Some((data, metadata))
}

/// Path of the post-processed variant of a download
fn finished_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("audio");
    path.with_file_name(format!("{stem}.finished.mp3"))
}

/// Wraps the external audio extractor and normalizes its error surface.
///
/// One invocation at a time: the download loop is the only caller and runs
/// a single task, which also keeps the extractor's own rate limits happy.
pub struct Downloader {
    config: DownloaderConfig,
    tmp_dir: PathBuf,
}

impl Downloader {
    pub fn new(config: DownloaderConfig, tmp_dir: PathBuf) -> Self {
        Self { config, tmp_dir }
    }

    /// Download the canonical URL to scratch space, returning the artifact
    /// path (post-processed when enabled) and metadata.
    pub async fn download(&self, url: &str) -> Result<DownloadOutcome, DownloadError> {
        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|e| DownloadError::Retryable(format!("scratch dir: {e}")))?;

        let output_template = self.tmp_dir.join("%(id)s.%(ext)s");
        let mut command = Command::new(&self.config.ytdlp_bin);
        command
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--print-json")
            .arg("-o")
            .arg(&output_template)
            .args(&self.config.extra_args)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(url, "Invoking extractor");
        let mut child = command
            .spawn()
            .map_err(|e| DownloadError::Retryable(format!("failed to spawn extractor: {e}")))?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let reader = async {
            let mut out = String::new();
            let mut err = String::new();
            let _ = stdout.read_to_string(&mut out).await;
            let _ = stderr.read_to_string(&mut err).await;
            let status = child.wait().await;
            (status, out, err)
        };

        let (status, out, err) =
            match tokio::time::timeout(Duration::from_secs(self.config.timeout_s), reader).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(DownloadError::Retryable(format!(
                        "extractor timed out after {}s",
                        self.config.timeout_s
                    )));
                }
            };

        let status =
            status.map_err(|e| DownloadError::Retryable(format!("extractor wait failed: {e}")))?;
        if !status.success() {
            return Err(classify_extractor_error(&err));
        }

        let Some((data, metadata)) = parse_extractor_json(&out) else {
            return Err(DownloadError::Retryable(
                "extractor produced no parsable metadata".to_string(),
            ));
        };

        if self.config.max_duration_s > 0 && metadata.duration_s > self.config.max_duration_s {
            return Err(DownloadError::Terminal(
                TerminalFailureKind::TooLong,
                format!(
                    "video exceeds maximum of {} seconds",
                    self.config.max_duration_s
                ),
            ));
        }

        let canonical_url = data["webpage_url"].as_str().unwrap_or(url).to_string();
        let file_path = data["requested_downloads"][0]["filepath"]
            .as_str()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .or_else(|| {
                data["id"]
                    .as_str()
                    .map(|id| self.tmp_dir.join(format!("{id}.mp3")))
                    .filter(|p| p.exists())
            })
            .ok_or_else(|| {
                DownloadError::Retryable("extractor reported no output file".to_string())
            })?;

        let file_path = if self.config.enable_post_processing {
            self.post_process(&file_path).await
        } else {
            file_path
        };

        info!(url = %canonical_url, path = %file_path.display(), "Download complete");
        Ok(DownloadOutcome {
            file_path,
            canonical_url,
            metadata,
        })
    }

    /// Loudness-normalize and trim leading/trailing silence with ffmpeg.
    ///
    /// The edited file replaces the raw download as the artifact; on any
    /// processing failure the raw download is kept.
    async fn post_process(&self, path: &Path) -> PathBuf {
        let finished = finished_path(path);
        if finished.exists() {
            return finished;
        }
        let result = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(path)
            .arg("-af")
            .arg(
                "silenceremove=start_periods=1:start_threshold=-50dB,\
                 areverse,silenceremove=start_periods=1:start_threshold=-50dB,areverse,\
                 loudnorm",
            )
            .arg(&finished)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match result {
            Ok(status) if status.success() && finished.exists() => {
                let _ = tokio::fs::remove_file(path).await;
                finished
            }
            Ok(status) => {
                warn!(path = %path.display(), ?status, "Audio processing failed, keeping raw file");
                let _ = tokio::fs::remove_file(&finished).await;
                path.to_path_buf()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not run ffmpeg, keeping raw file");
                path.to_path_buf()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_terminal_errors() {
        let err = classify_extractor_error("ERROR: Private video\nmore context");
        assert!(matches!(
            err,
            DownloadError::Terminal(TerminalFailureKind::Private, _)
        ));

        let err = classify_extractor_error("ERROR: Video unavailable");
        assert!(matches!(
            err,
            DownloadError::Terminal(TerminalFailureKind::Unavailable, _)
        ));

        let err =
            classify_extractor_error("ERROR: Sign in to confirm your age. This video may be...");
        assert!(matches!(
            err,
            DownloadError::Terminal(TerminalFailureKind::AgeRestricted, _)
        ));

        let err = classify_extractor_error("ERROR: Requested format is not available");
        assert!(matches!(
            err,
            DownloadError::Terminal(TerminalFailureKind::InvalidFormat, _)
        ));
    }

    #[test]
    fn test_classify_retryable_errors() {
        let err =
            classify_extractor_error("ERROR: Sign in to confirm you're not a bot. Use --cookies");
        assert!(matches!(err, DownloadError::Retryable(_)));

        let err = classify_extractor_error("ERROR: HTTP Error 429: Too Many Requests");
        assert!(matches!(err, DownloadError::Retryable(_)));

        let err = classify_extractor_error("ERROR: something novel went wrong");
        assert!(matches!(err, DownloadError::Retryable(_)));
    }

    #[test]
    fn test_parse_extractor_json_skips_progress_noise() {
        let raw = "[download] 100% done\n{\"id\":\"abc\",\"title\":\"Song\",\"uploader\":\"Someone\",\"duration\":63.4,\"webpage_url\":\"https://example.com/w\"}\n";
        let (data, metadata) = parse_extractor_json(raw).unwrap();
        assert_eq!(metadata.title, "Song");
        assert_eq!(metadata.uploader, "Someone");
        assert_eq!(metadata.duration_s, 63);
        assert_eq!(data["webpage_url"].as_str(), Some("https://example.com/w"));

        assert!(parse_extractor_json("no json here").is_none());
    }

    #[test]
    fn test_finished_path_naming() {
        assert_eq!(
            finished_path(Path::new("/tmp/abc.mp3")),
            PathBuf::from("/tmp/abc.finished.mp3")
        );
    }

    #[cfg(unix)]
    fn write_fake_extractor(dir: &Path, script_body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let bin = dir.join("fake-ytdlp");
        std::fs::write(&bin, format!("#!/bin/sh\n{script_body}")).unwrap();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&bin, perms).unwrap();
        bin
    }

    #[cfg(unix)]
    fn downloader_with_bin(bin: &Path, tmp_dir: PathBuf, max_duration_s: u32) -> Downloader {
        Downloader::new(
            DownloaderConfig {
                ytdlp_bin: bin.to_string_lossy().to_string(),
                max_duration_s,
                enable_post_processing: false,
                download_retries: 3,
                timeout_s: 10,
                extra_args: Vec::new(),
            },
            tmp_dir,
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_happy_path_with_fake_extractor() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let script = format!(
            "touch {}/vid01.mp3\necho '{{\"id\":\"vid01\",\"title\":\"T\",\"uploader\":\"U\",\"duration\":10,\"webpage_url\":\"https://example.com/v\"}}'",
            scratch.display()
        );
        let bin = write_fake_extractor(tmp.path(), &script);
        let downloader = downloader_with_bin(&bin, scratch.clone(), 0);

        let outcome = downloader.download("https://example.com/v").await.unwrap();
        assert_eq!(outcome.canonical_url, "https://example.com/v");
        assert_eq!(outcome.metadata.title, "T");
        assert!(outcome.file_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_duration_cap_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let script = format!(
            "touch {}/vid02.mp3\necho '{{\"id\":\"vid02\",\"title\":\"T\",\"duration\":500,\"webpage_url\":\"https://example.com/v\"}}'",
            scratch.display()
        );
        let bin = write_fake_extractor(tmp.path(), &script);
        let downloader = downloader_with_bin(&bin, scratch, 60);

        let err = downloader.download("https://example.com/v").await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Terminal(TerminalFailureKind::TooLong, _)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_classifies_extractor_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_extractor(
            tmp.path(),
            "echo 'ERROR: Video unavailable' >&2\nexit 1",
        );
        let downloader = downloader_with_bin(&bin, tmp.path().join("scratch"), 0);

        let err = downloader.download("https://example.com/v").await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Terminal(TerminalFailureKind::Unavailable, _)
        ));
    }
}
