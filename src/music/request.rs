use chrono::{DateTime, Utc};
use uuid::Uuid;

/// How a raw input string was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchType {
    /// Track from a streaming-platform URL, resolved by free-text search later
    StreamingTrack,
    /// Canonical video URL
    VideoUrl,
    /// Video expanded out of a playlist URL
    VideoPlaylistMember,
    /// Direct media URL outside the video site
    DirectUrl,
    /// Free text needing catalog resolution
    FreeText,
    /// Grouped searches and placeholders
    Other,
}

impl SearchType {
    /// Whether this request still needs the search stage to produce a
    /// canonical URL before it can be downloaded
    pub fn needs_resolution(&self) -> bool {
        matches!(self, Self::StreamingTrack | Self::FreeText)
    }
}

/// Lifecycle of a media request through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Searching,
    Queued,
    Backoff,
    InProgress,
    Completed,
    Failed,
    Discarded,
}

impl LifecycleStage {
    /// Terminal stages count toward bundle completion
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Discarded)
    }
}

/// One user-intended track flowing through search and download
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub id: Uuid,
    pub guild_id: u64,
    pub channel_id: u64,
    pub requester_name: String,
    pub requester_id: u64,
    /// What the user typed, or the URL extracted from a playlist
    pub raw_search: String,
    /// Equals raw_search until the search stage rewrites it to a canonical URL
    pub resolved_search: String,
    pub search_type: SearchType,
    /// Bundle this request reports progress to, absent for internal requests
    pub bundle_id: Option<Uuid>,
    pub retry_count: u32,
    /// Requests replayed from history are not written back to it
    pub from_history: bool,
    pub history_item_id: Option<i64>,
    /// Save the download to this playlist instead of playing it
    pub add_to_playlist: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl MediaRequest {
    pub fn new(
        guild_id: u64,
        channel_id: u64,
        requester_name: impl Into<String>,
        requester_id: u64,
        raw_search: impl Into<String>,
        search_type: SearchType,
    ) -> Self {
        let raw_search = raw_search.into();
        Self {
            id: Uuid::new_v4(),
            guild_id,
            channel_id,
            requester_name: requester_name.into(),
            requester_id,
            resolved_search: raw_search.clone(),
            raw_search,
            search_type,
            bundle_id: None,
            retry_count: 0,
            from_history: false,
            history_item_id: None,
            add_to_playlist: None,
            created_at: Utc::now(),
        }
    }

    /// Set the canonical URL produced by the search stage
    pub fn resolve(&mut self, url: impl Into<String>) {
        self.resolved_search = url.into();
    }

    /// Display form with auto-embed suppressed for URLs
    pub fn display(&self) -> String {
        suppress_embed(&self.raw_search)
    }
}

impl std::fmt::Display for MediaRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Wrap URLs in angle brackets so Discord does not unfurl them
pub fn suppress_embed(text: &str) -> String {
    if text.contains("https://") && !text.starts_with('<') {
        format!("<{text}>")
    } else {
        text.to_string()
    }
}

/// Truncate to a character budget, appending an ellipsis when cut
pub fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_resolution() {
        assert!(SearchType::FreeText.needs_resolution());
        assert!(SearchType::StreamingTrack.needs_resolution());
        assert!(!SearchType::VideoUrl.needs_resolution());
        assert!(!SearchType::VideoPlaylistMember.needs_resolution());
        assert!(!SearchType::DirectUrl.needs_resolution());
    }

    #[test]
    fn test_resolved_search_tracks_raw_until_resolution() {
        let mut req = MediaRequest::new(1, 2, "user", 3, "hello world", SearchType::FreeText);
        assert_eq!(req.resolved_search, "hello world");
        req.resolve("https://www.youtube.com/watch?v=ddddddddddd");
        assert_eq!(req.raw_search, "hello world");
        assert_eq!(
            req.resolved_search,
            "https://www.youtube.com/watch?v=ddddddddddd"
        );
    }

    #[test]
    fn test_display_suppresses_embeds() {
        let req = MediaRequest::new(
            1,
            2,
            "user",
            3,
            "https://www.youtube.com/watch?v=eeeeeeeeeee",
            SearchType::VideoUrl,
        );
        assert_eq!(
            req.display(),
            "<https://www.youtube.com/watch?v=eeeeeeeeeee>"
        );

        let plain = MediaRequest::new(1, 2, "user", 3, "some song", SearchType::FreeText);
        assert_eq!(plain.display(), "some song");
    }

    #[test]
    fn test_shorten() {
        assert_eq!(shorten("short", 10), "short");
        assert_eq!(shorten("abcdefghij", 10), "abcdefghij");
        assert_eq!(shorten("abcdefghijk", 10), "abcdefg...");
    }

    #[test]
    fn test_terminal_stages() {
        assert!(LifecycleStage::Completed.is_terminal());
        assert!(LifecycleStage::Failed.is_terminal());
        assert!(LifecycleStage::Discarded.is_terminal());
        assert!(!LifecycleStage::Queued.is_terminal());
        assert!(!LifecycleStage::Backoff.is_terminal());
    }
}
