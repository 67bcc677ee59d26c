use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Reserved name for the per-guild history playlist
pub const HISTORY_PLAYLIST_NAME: &str = "__playhistory__";

/// Cached download, keyed by canonical URL
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VideoCacheRow {
    pub url: String,
    /// Source file on disk, empty for failure sentinels
    pub path: String,
    pub title: String,
    pub uploader: String,
    pub duration_s: i64,
    pub created_at: DateTime<Utc>,
    pub last_iterated_at: DateTime<Utc>,
    pub marked_for_delete: bool,
    pub backup_key: Option<String>,
    pub failure_kind: Option<String>,
    pub failure_at: Option<DateTime<Utc>>,
}

impl VideoCacheRow {
    /// Whether this row records a terminal failure instead of a file
    pub fn is_failure_sentinel(&self) -> bool {
        self.failure_kind.is_some()
    }

    pub fn failure(&self) -> Option<TerminalFailureKind> {
        self.failure_kind.as_deref().map(TerminalFailureKind::parse)
    }
}

/// Terminal download failure classes recorded in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalFailureKind {
    AgeRestricted,
    Unavailable,
    Private,
    InvalidFormat,
    TooLong,
}

impl TerminalFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgeRestricted => "age_restricted",
            Self::Unavailable => "unavailable",
            Self::Private => "private",
            Self::InvalidFormat => "invalid_format",
            Self::TooLong => "too_long",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "age_restricted" => Self::AgeRestricted,
            "private" => Self::Private,
            "invalid_format" => Self::InvalidFormat,
            "too_long" => Self::TooLong,
            _ => Self::Unavailable,
        }
    }

    /// User-facing reason text
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AgeRestricted => "video is age restricted, cannot download",
            Self::Unavailable => "video is unavailable, cannot download",
            Self::Private => "video is private, cannot download",
            Self::InvalidFormat => "no usable audio format",
            Self::TooLong => "video exceeds the maximum allowed length",
        }
    }
}

impl std::fmt::Display for TerminalFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Memoized free-text search resolution
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SearchStringRow {
    pub query_normalized: String,
    pub url: String,
    pub last_iterated_at: DateTime<Utc>,
}

/// Playlist kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaylistKind {
    User,
    History,
}

impl PlaylistKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::History => "history",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "history" => Self::History,
            _ => Self::User,
        }
    }
}

/// Saved playlist, user-created or the guild's history playlist
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlaylistRow {
    pub id: i64,
    pub guild_id: String,
    pub name: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
}

impl PlaylistRow {
    pub fn kind(&self) -> PlaylistKind {
        PlaylistKind::parse(&self.kind)
    }

    pub fn is_history(&self) -> bool {
        self.kind() == PlaylistKind::History
    }
}

/// One entry of a playlist
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlaylistItemRow {
    pub id: i64,
    pub playlist_id: i64,
    pub url: String,
    pub title: String,
    pub added_at: DateTime<Utc>,
}

/// Per-guild playback counters
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GuildAnalyticsRow {
    pub guild_id: String,
    pub total_plays: i64,
    pub total_duration_s: i64,
    pub cached_plays: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_round_trip() {
        for kind in [
            TerminalFailureKind::AgeRestricted,
            TerminalFailureKind::Unavailable,
            TerminalFailureKind::Private,
            TerminalFailureKind::InvalidFormat,
            TerminalFailureKind::TooLong,
        ] {
            assert_eq!(TerminalFailureKind::parse(kind.as_str()), kind);
        }
        // Unknown values degrade to the generic class
        assert_eq!(
            TerminalFailureKind::parse("whatever"),
            TerminalFailureKind::Unavailable
        );
    }

    #[test]
    fn test_playlist_kind() {
        assert_eq!(PlaylistKind::parse("user"), PlaylistKind::User);
        assert_eq!(PlaylistKind::parse("history"), PlaylistKind::History);
        assert_eq!(PlaylistKind::parse(""), PlaylistKind::User);
    }

    #[test]
    fn test_failure_sentinel() {
        let row = VideoCacheRow {
            url: "https://www.youtube.com/watch?v=aaaaaaaaaaa".to_string(),
            path: String::new(),
            title: String::new(),
            uploader: String::new(),
            duration_s: 0,
            created_at: Utc::now(),
            last_iterated_at: Utc::now(),
            marked_for_delete: false,
            backup_key: None,
            failure_kind: Some("age_restricted".to_string()),
            failure_at: Some(Utc::now()),
        };
        assert!(row.is_failure_sentinel());
        assert_eq!(row.failure(), Some(TerminalFailureKind::AgeRestricted));
    }
}
