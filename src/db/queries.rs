use crate::db::models::*;
use crate::error::{AppError, AppResult};
use chrono::Utc;
use sqlx::{Pool, Sqlite};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Database operations for the video cache
pub struct VideoCacheRepo;

impl VideoCacheRepo {
    /// Get entry by canonical URL without touching timestamps
    pub async fn get_by_url(pool: &DbPool, url: &str) -> AppResult<Option<VideoCacheRow>> {
        let row = sqlx::query_as::<_, VideoCacheRow>("SELECT * FROM video_cache WHERE url = ?")
            .bind(url)
            .fetch_optional(pool)
            .await?;

        Ok(row)
    }

    /// Bump last_iterated_at and unmark deletion for a reused entry
    pub async fn touch(pool: &DbPool, url: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE video_cache SET last_iterated_at = ?, marked_for_delete = false WHERE url = ?",
        )
        .bind(Utc::now())
        .bind(url)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Insert a cached download. Idempotent on URL: a second insert only
    /// refreshes last_iterated_at and clears any failure sentinel.
    pub async fn upsert(
        pool: &DbPool,
        url: &str,
        path: &str,
        title: &str,
        uploader: &str,
        duration_s: i64,
    ) -> AppResult<VideoCacheRow> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO video_cache (url, path, title, uploader, duration_s, created_at, last_iterated_at, marked_for_delete)
            VALUES (?, ?, ?, ?, ?, ?, ?, false)
            ON CONFLICT(url) DO UPDATE SET
                path = excluded.path,
                last_iterated_at = excluded.last_iterated_at,
                marked_for_delete = false,
                failure_kind = NULL,
                failure_at = NULL
            "#,
        )
        .bind(url)
        .bind(path)
        .bind(title)
        .bind(uploader)
        .bind(duration_s)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get_by_url(pool, url)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve cached entry"))
    }

    /// Record a terminal failure sentinel so later requests short-circuit
    pub async fn record_failure(
        pool: &DbPool,
        url: &str,
        kind: TerminalFailureKind,
    ) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO video_cache (url, path, title, uploader, duration_s, created_at, last_iterated_at, marked_for_delete, failure_kind, failure_at)
            VALUES (?, '', '', '', 0, ?, ?, false, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                failure_kind = excluded.failure_kind,
                failure_at = excluded.failure_at,
                last_iterated_at = excluded.last_iterated_at
            "#,
        )
        .bind(url)
        .bind(now)
        .bind(now)
        .bind(kind.as_str())
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Count non-sentinel entries
    pub async fn count(pool: &DbPool) -> AppResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM video_cache WHERE failure_kind IS NULL")
                .fetch_one(pool)
                .await?;
        Ok(count.0)
    }

    /// Mark the least-recently-iterated entries for deletion, skipping the
    /// given in-transit URLs
    pub async fn mark_lru_for_delete(
        pool: &DbPool,
        excess: i64,
        exclude_urls: &[String],
    ) -> AppResult<u64> {
        if excess < 1 {
            return Ok(0);
        }
        // SQLite has no array binds; the exclusion set is small (in-transit
        // downloads only) so an IN list is built inline.
        let placeholders = if exclude_urls.is_empty() {
            "''".to_string()
        } else {
            vec!["?"; exclude_urls.len()].join(", ")
        };
        let sql = format!(
            r#"
            UPDATE video_cache SET marked_for_delete = true
            WHERE url IN (
                SELECT url FROM video_cache
                WHERE failure_kind IS NULL
                  AND marked_for_delete = false
                  AND url NOT IN ({placeholders})
                ORDER BY last_iterated_at ASC
                LIMIT ?
            )
            "#
        );
        let mut query = sqlx::query(&sql);
        for url in exclude_urls {
            query = query.bind(url);
        }
        let result = query.bind(excess).execute(pool).await?;
        Ok(result.rows_affected())
    }

    /// All entries currently marked for deletion
    pub async fn marked_for_delete(pool: &DbPool) -> AppResult<Vec<VideoCacheRow>> {
        let rows = sqlx::query_as::<_, VideoCacheRow>(
            "SELECT * FROM video_cache WHERE marked_for_delete = true",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_by_url(pool: &DbPool, url: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM video_cache WHERE url = ?")
            .bind(url)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_backup_key(pool: &DbPool, url: &str, key: &str) -> AppResult<()> {
        sqlx::query("UPDATE video_cache SET backup_key = ? WHERE url = ?")
            .bind(key)
            .bind(url)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Entries with a file but no backup yet
    pub async fn pending_backup(pool: &DbPool, limit: i64) -> AppResult<Vec<VideoCacheRow>> {
        let rows = sqlx::query_as::<_, VideoCacheRow>(
            r#"
            SELECT * FROM video_cache
            WHERE failure_kind IS NULL AND backup_key IS NULL AND marked_for_delete = false
            ORDER BY last_iterated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Every non-sentinel entry, for the startup verification sweep
    pub async fn all_entries(pool: &DbPool) -> AppResult<Vec<VideoCacheRow>> {
        let rows = sqlx::query_as::<_, VideoCacheRow>(
            "SELECT * FROM video_cache WHERE failure_kind IS NULL",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Random playable entries for random-play with the cache-only pool
    pub async fn random_entries(pool: &DbPool, limit: i64) -> AppResult<Vec<VideoCacheRow>> {
        let rows = sqlx::query_as::<_, VideoCacheRow>(
            r#"
            SELECT * FROM video_cache
            WHERE failure_kind IS NULL AND marked_for_delete = false
            ORDER BY RANDOM()
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Database operations for memoized search strings
pub struct SearchStringRepo;

impl SearchStringRepo {
    /// Look up a normalized query, bumping last_iterated_at on hit
    pub async fn lookup(pool: &DbPool, query_normalized: &str) -> AppResult<Option<String>> {
        let row = sqlx::query_as::<_, SearchStringRow>(
            "SELECT * FROM search_string WHERE query_normalized = ?",
        )
        .bind(query_normalized)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        sqlx::query("UPDATE search_string SET last_iterated_at = ? WHERE query_normalized = ?")
            .bind(Utc::now())
            .bind(query_normalized)
            .execute(pool)
            .await?;
        Ok(Some(row.url))
    }

    /// Memoize a resolution. Idempotent on the normalized query.
    pub async fn upsert(pool: &DbPool, query_normalized: &str, url: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO search_string (query_normalized, url, last_iterated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(query_normalized) DO UPDATE SET
                url = excluded.url,
                last_iterated_at = excluded.last_iterated_at
            "#,
        )
        .bind(query_normalized)
        .bind(url)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Evict the least-recently-iterated entries beyond the cap
    pub async fn prune(pool: &DbPool, max_entries: i64) -> AppResult<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM search_string")
            .fetch_one(pool)
            .await?;
        let excess = count.0 - max_entries;
        if excess < 1 {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM search_string WHERE query_normalized IN (
                SELECT query_normalized FROM search_string
                ORDER BY last_iterated_at ASC
                LIMIT ?
            )
            "#,
        )
        .bind(excess)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Database operations for playlists
pub struct PlaylistRepo;

impl PlaylistRepo {
    pub async fn get_by_id(pool: &DbPool, id: i64) -> AppResult<Option<PlaylistRow>> {
        let row = sqlx::query_as::<_, PlaylistRow>("SELECT * FROM playlist WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    /// Create a user playlist. Fails on duplicate (guild, name).
    pub async fn create(pool: &DbPool, guild_id: u64, name: &str) -> AppResult<PlaylistRow> {
        if name.starts_with(HISTORY_PLAYLIST_NAME) {
            return Err(AppError::internal("Playlist name is reserved"));
        }
        let guild = guild_id.to_string();
        sqlx::query(
            "INSERT INTO playlist (guild_id, name, kind, created_at) VALUES (?, ?, 'user', ?)",
        )
        .bind(&guild)
        .bind(name)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        let row = sqlx::query_as::<_, PlaylistRow>(
            "SELECT * FROM playlist WHERE guild_id = ? AND name = ?",
        )
        .bind(&guild)
        .bind(name)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    /// Fetch or lazily create the guild's history playlist
    pub async fn get_or_create_history(pool: &DbPool, guild_id: u64) -> AppResult<PlaylistRow> {
        let guild = guild_id.to_string();
        let existing = sqlx::query_as::<_, PlaylistRow>(
            "SELECT * FROM playlist WHERE guild_id = ? AND kind = 'history'",
        )
        .bind(&guild)
        .fetch_optional(pool)
        .await?;
        if let Some(row) = existing {
            return Ok(row);
        }

        sqlx::query(
            "INSERT INTO playlist (guild_id, name, kind, created_at) VALUES (?, ?, 'history', ?)",
        )
        .bind(&guild)
        .bind(format!("{HISTORY_PLAYLIST_NAME}{guild}"))
        .bind(Utc::now())
        .execute(pool)
        .await?;

        let row = sqlx::query_as::<_, PlaylistRow>(
            "SELECT * FROM playlist WHERE guild_id = ? AND kind = 'history'",
        )
        .bind(&guild)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    /// User playlists for a guild, oldest first
    pub async fn list_for_guild(pool: &DbPool, guild_id: u64) -> AppResult<Vec<PlaylistRow>> {
        let rows = sqlx::query_as::<_, PlaylistRow>(
            "SELECT * FROM playlist WHERE guild_id = ? AND kind = 'user' ORDER BY created_at ASC",
        )
        .bind(guild_id.to_string())
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn rename(pool: &DbPool, id: i64, new_name: &str) -> AppResult<()> {
        if new_name.starts_with(HISTORY_PLAYLIST_NAME) {
            return Err(AppError::internal("Playlist name is reserved"));
        }
        sqlx::query("UPDATE playlist SET name = ? WHERE id = ? AND kind = 'user'")
            .bind(new_name)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_queued_at(pool: &DbPool, id: i64) -> AppResult<()> {
        sqlx::query("UPDATE playlist SET queued_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &DbPool, id: i64) -> AppResult<()> {
        sqlx::query("DELETE FROM playlist_item WHERE playlist_id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM playlist WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn add_item(
        pool: &DbPool,
        playlist_id: i64,
        url: &str,
        title: &str,
    ) -> AppResult<PlaylistItemRow> {
        sqlx::query(
            "INSERT INTO playlist_item (playlist_id, url, title, added_at) VALUES (?, ?, ?, ?)",
        )
        .bind(playlist_id)
        .bind(url)
        .bind(title)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        let row = sqlx::query_as::<_, PlaylistItemRow>(
            "SELECT * FROM playlist_item WHERE playlist_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(playlist_id)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    /// Items in insertion order
    pub async fn items(pool: &DbPool, playlist_id: i64) -> AppResult<Vec<PlaylistItemRow>> {
        let rows = sqlx::query_as::<_, PlaylistItemRow>(
            "SELECT * FROM playlist_item WHERE playlist_id = ? ORDER BY added_at ASC, id ASC",
        )
        .bind(playlist_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_items(pool: &DbPool, playlist_id: i64) -> AppResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM playlist_item WHERE playlist_id = ?")
                .bind(playlist_id)
                .fetch_one(pool)
                .await?;
        Ok(count.0)
    }

    pub async fn delete_item(pool: &DbPool, item_id: i64) -> AppResult<()> {
        sqlx::query("DELETE FROM playlist_item WHERE id = ?")
            .bind(item_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Evict the oldest items past the per-playlist bound
    pub async fn evict_oldest(pool: &DbPool, playlist_id: i64, max_items: i64) -> AppResult<u64> {
        let count = Self::count_items(pool, playlist_id).await?;
        let excess = count - max_items;
        if excess < 1 {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM playlist_item WHERE id IN (
                SELECT id FROM playlist_item
                WHERE playlist_id = ?
                ORDER BY added_at ASC, id ASC
                LIMIT ?
            )
            "#,
        )
        .bind(playlist_id)
        .bind(excess)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Database operations for per-guild playback analytics
pub struct AnalyticsRepo;

impl AnalyticsRepo {
    /// Record one finished play
    pub async fn record_play(
        pool: &DbPool,
        guild_id: u64,
        duration_s: i64,
        cache_hit: bool,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO guild_analytics (guild_id, total_plays, total_duration_s, cached_plays, updated_at)
            VALUES (?, 1, ?, ?, ?)
            ON CONFLICT(guild_id) DO UPDATE SET
                total_plays = total_plays + 1,
                total_duration_s = total_duration_s + excluded.total_duration_s,
                cached_plays = cached_plays + excluded.cached_plays,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(guild_id.to_string())
        .bind(duration_s)
        .bind(if cache_hit { 1 } else { 0 })
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get(pool: &DbPool, guild_id: u64) -> AppResult<Option<GuildAnalyticsRow>> {
        let row = sqlx::query_as::<_, GuildAnalyticsRow>(
            "SELECT * FROM guild_analytics WHERE guild_id = ?",
        )
        .bind(guild_id.to_string())
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}

/// Initialize database with migrations
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS video_cache (
            url TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            title TEXT NOT NULL,
            uploader TEXT NOT NULL,
            duration_s INTEGER NOT NULL,
            created_at DATETIME NOT NULL,
            last_iterated_at DATETIME NOT NULL,
            marked_for_delete BOOLEAN NOT NULL DEFAULT false,
            backup_key TEXT,
            failure_kind TEXT,
            failure_at DATETIME
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_string (
            query_normalized TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            last_iterated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playlist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            guild_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'user',
            created_at DATETIME NOT NULL,
            queued_at DATETIME,
            UNIQUE(guild_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playlist_item (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            playlist_id INTEGER NOT NULL REFERENCES playlist(id),
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            added_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS guild_analytics (
            guild_id TEXT PRIMARY KEY,
            total_plays INTEGER NOT NULL DEFAULT 0,
            total_duration_s INTEGER NOT NULL DEFAULT 0,
            cached_plays INTEGER NOT NULL DEFAULT 0,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One history playlist per guild
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_playlist_history ON playlist(guild_id) WHERE kind = 'history'",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_playlist_item_order ON playlist_item(playlist_id, added_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_video_cache_lru ON video_cache(last_iterated_at)",
    )
    .execute(pool)
    .await?;

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> DbPool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_db(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_video_cache_upsert_idempotent() {
        let pool = test_pool().await;
        let url = "https://www.youtube.com/watch?v=aaaaaaaaaaa";

        let first = VideoCacheRepo::upsert(&pool, url, "/tmp/a.mp3", "Title", "Uploader", 120)
            .await
            .unwrap();
        let second = VideoCacheRepo::upsert(&pool, url, "/tmp/a.mp3", "Title", "Uploader", 120)
            .await
            .unwrap();

        assert_eq!(VideoCacheRepo::count(&pool).await.unwrap(), 1);
        assert!(second.last_iterated_at >= first.last_iterated_at);
    }

    #[tokio::test]
    async fn test_failure_sentinel_round_trip() {
        let pool = test_pool().await;
        let url = "https://www.youtube.com/watch?v=bbbbbbbbbbb";

        VideoCacheRepo::record_failure(&pool, url, TerminalFailureKind::AgeRestricted)
            .await
            .unwrap();
        let row = VideoCacheRepo::get_by_url(&pool, url).await.unwrap().unwrap();
        assert!(row.is_failure_sentinel());
        assert_eq!(row.failure(), Some(TerminalFailureKind::AgeRestricted));

        // Sentinels don't count toward the file cap
        assert_eq!(VideoCacheRepo::count(&pool).await.unwrap(), 0);

        // A later successful download clears the sentinel
        VideoCacheRepo::upsert(&pool, url, "/tmp/b.mp3", "T", "U", 60)
            .await
            .unwrap();
        let row = VideoCacheRepo::get_by_url(&pool, url).await.unwrap().unwrap();
        assert!(!row.is_failure_sentinel());
    }

    #[tokio::test]
    async fn test_mark_lru_skips_in_transit() {
        let pool = test_pool().await;
        for i in 0..4 {
            let url = format!("https://www.youtube.com/watch?v=aaaaaaaaaa{i}");
            VideoCacheRepo::upsert(&pool, &url, "/tmp/x.mp3", "T", "U", 10)
                .await
                .unwrap();
        }
        let protected = vec!["https://www.youtube.com/watch?v=aaaaaaaaaa0".to_string()];
        let marked = VideoCacheRepo::mark_lru_for_delete(&pool, 2, &protected)
            .await
            .unwrap();
        assert_eq!(marked, 2);

        let rows = VideoCacheRepo::marked_for_delete(&pool).await.unwrap();
        assert!(rows.iter().all(|r| r.url != protected[0]));
    }

    #[tokio::test]
    async fn test_search_string_memoization() {
        let pool = test_pool().await;
        SearchStringRepo::upsert(&pool, "hello world", "https://www.youtube.com/watch?v=ccccccccccc")
            .await
            .unwrap();
        let url = SearchStringRepo::lookup(&pool, "hello world").await.unwrap();
        assert_eq!(
            url.as_deref(),
            Some("https://www.youtube.com/watch?v=ccccccccccc")
        );
        assert_eq!(SearchStringRepo::lookup(&pool, "missing").await.unwrap(), None);

        // Repeat upserts keep a single row
        SearchStringRepo::upsert(&pool, "hello world", "https://www.youtube.com/watch?v=ccccccccccc")
            .await
            .unwrap();
        assert_eq!(SearchStringRepo::prune(&pool, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_search_string_prune() {
        let pool = test_pool().await;
        for i in 0..5 {
            SearchStringRepo::upsert(&pool, &format!("query {i}"), "https://example.com")
                .await
                .unwrap();
        }
        let removed = SearchStringRepo::prune(&pool, 2).await.unwrap();
        assert_eq!(removed, 3);
    }

    #[tokio::test]
    async fn test_playlist_crud_and_history() {
        let pool = test_pool().await;

        let playlist = PlaylistRepo::create(&pool, 42, "bangers").await.unwrap();
        assert_eq!(playlist.kind(), PlaylistKind::User);

        // Duplicate name in same guild rejected
        assert!(PlaylistRepo::create(&pool, 42, "bangers").await.is_err());
        // Reserved prefix rejected
        assert!(PlaylistRepo::create(&pool, 42, "__playhistory__x").await.is_err());

        let history = PlaylistRepo::get_or_create_history(&pool, 42).await.unwrap();
        assert!(history.is_history());
        let again = PlaylistRepo::get_or_create_history(&pool, 42).await.unwrap();
        assert_eq!(history.id, again.id);

        PlaylistRepo::add_item(&pool, playlist.id, "https://example.com/a", "A")
            .await
            .unwrap();
        PlaylistRepo::add_item(&pool, playlist.id, "https://example.com/b", "B")
            .await
            .unwrap();
        let items = PlaylistRepo::items(&pool, playlist.id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "A");

        PlaylistRepo::delete(&pool, playlist.id).await.unwrap();
        assert!(PlaylistRepo::get_by_id(&pool, playlist.id).await.unwrap().is_none());
        assert_eq!(PlaylistRepo::count_items(&pool, playlist.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_playlist_evict_oldest() {
        let pool = test_pool().await;
        let history = PlaylistRepo::get_or_create_history(&pool, 7).await.unwrap();
        for i in 0..6 {
            PlaylistRepo::add_item(&pool, history.id, &format!("https://example.com/{i}"), "t")
                .await
                .unwrap();
        }
        let removed = PlaylistRepo::evict_oldest(&pool, history.id, 4).await.unwrap();
        assert_eq!(removed, 2);
        let items = PlaylistRepo::items(&pool, history.id).await.unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].url, "https://example.com/2");
    }

    #[tokio::test]
    async fn test_analytics_counters() {
        let pool = test_pool().await;
        AnalyticsRepo::record_play(&pool, 9, 120, false).await.unwrap();
        AnalyticsRepo::record_play(&pool, 9, 60, true).await.unwrap();

        let row = AnalyticsRepo::get(&pool, 9).await.unwrap().unwrap();
        assert_eq!(row.total_plays, 2);
        assert_eq!(row.total_duration_s, 180);
        assert_eq!(row.cached_plays, 1);
    }
}
