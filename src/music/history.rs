use crate::config::HistoryConfig;
use crate::db::{AnalyticsRepo, DbPool, PlaylistRepo};
use crate::error::AppResult;
use tracing::{debug, warn};

/// One finished playback, queued for persistent recording
#[derive(Debug, Clone)]
pub struct HistoryItem {
    pub guild_id: u64,
    pub url: String,
    pub title: String,
    pub duration_s: u32,
    pub cache_hit: bool,
}

/// Writes playback analytics and the bounded per-guild history playlist.
///
/// Consumes items the players push after each track finishes; requests that
/// were replayed from history never produce items, so the playlist cannot
/// feed back into itself.
pub struct HistoryRecorder {
    pool: DbPool,
    config: HistoryConfig,
}

impl HistoryRecorder {
    pub fn new(pool: DbPool, config: HistoryConfig) -> Self {
        Self { pool, config }
    }

    /// Record one play: bump analytics counters, append to the history
    /// playlist, evict past the bound.
    pub async fn record(&self, item: HistoryItem) -> AppResult<()> {
        AnalyticsRepo::record_play(
            &self.pool,
            item.guild_id,
            i64::from(item.duration_s),
            item.cache_hit,
        )
        .await?;

        let playlist = PlaylistRepo::get_or_create_history(&self.pool, item.guild_id).await?;
        PlaylistRepo::add_item(&self.pool, playlist.id, &item.url, &item.title).await?;
        let evicted = PlaylistRepo::evict_oldest(
            &self.pool,
            playlist.id,
            i64::from(self.config.playlist_max_items),
        )
        .await?;
        if evicted > 0 {
            debug!(
                guild_id = item.guild_id,
                evicted, "Evicted history playlist items"
            );
        }
        Ok(())
    }

    /// Drain a batch from the history queue; errors are logged and the item
    /// dropped rather than wedging the loop
    pub async fn drain(&self, items: Vec<HistoryItem>) {
        for item in items {
            let guild_id = item.guild_id;
            if let Err(e) = self.record(item).await {
                warn!(guild_id, error = %e, "Failed writing history item");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    async fn recorder(max_items: u32) -> HistoryRecorder {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_db(&pool).await.unwrap();
        HistoryRecorder::new(
            pool,
            HistoryConfig {
                playlist_max_items: max_items,
            },
        )
    }

    fn item(guild_id: u64, url: &str, cache_hit: bool) -> HistoryItem {
        HistoryItem {
            guild_id,
            url: url.to_string(),
            title: "Title".to_string(),
            duration_s: 100,
            cache_hit,
        }
    }

    #[tokio::test]
    async fn test_record_updates_analytics_and_playlist() {
        let recorder = recorder(10).await;
        recorder.record(item(1, "https://a.test/1", false)).await.unwrap();
        recorder.record(item(1, "https://a.test/2", true)).await.unwrap();

        let analytics = AnalyticsRepo::get(&recorder.pool, 1).await.unwrap().unwrap();
        assert_eq!(analytics.total_plays, 2);
        assert_eq!(analytics.cached_plays, 1);
        assert_eq!(analytics.total_duration_s, 200);

        let playlist = PlaylistRepo::get_or_create_history(&recorder.pool, 1)
            .await
            .unwrap();
        let items = PlaylistRepo::items(&recorder.pool, playlist.id).await.unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_history_playlist_bounded() {
        let recorder = recorder(3).await;
        for i in 0..5 {
            recorder
                .record(item(2, &format!("https://a.test/{i}"), false))
                .await
                .unwrap();
        }
        let playlist = PlaylistRepo::get_or_create_history(&recorder.pool, 2)
            .await
            .unwrap();
        let items = PlaylistRepo::items(&recorder.pool, playlist.id).await.unwrap();
        assert_eq!(items.len(), 3);
        // Oldest two evicted
        assert_eq!(items[0].url, "https://a.test/2");
    }

    #[tokio::test]
    async fn test_guilds_are_isolated() {
        let recorder = recorder(10).await;
        recorder.record(item(1, "https://a.test/1", false)).await.unwrap();
        recorder.record(item(2, "https://a.test/2", false)).await.unwrap();

        let one = PlaylistRepo::get_or_create_history(&recorder.pool, 1).await.unwrap();
        let two = PlaylistRepo::get_or_create_history(&recorder.pool, 2).await.unwrap();
        assert_ne!(one.id, two.id);
        assert_eq!(PlaylistRepo::count_items(&recorder.pool, one.id).await.unwrap(), 1);
        assert_eq!(PlaylistRepo::count_items(&recorder.pool, two.id).await.unwrap(), 1);
    }
}
