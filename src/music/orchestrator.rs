use crate::config::AppConfig;
use crate::db::{DbPool, PlaylistRepo};
use crate::error::{AppError, AppResult};
use crate::music::backoff::FailureBackoffTracker;
use crate::music::bundle::ProgressBundle;
use crate::music::cache::{CacheLookup, DownloadCache};
use crate::music::downloader::{DownloadError, Downloader};
use crate::music::history::{HistoryItem, HistoryRecorder};
use crate::music::message::{MessageDispatcher, SingleMessage, TickOutcome};
use crate::music::player::{play_order_bundle_id, GuildPlayer, HistoryEntry};
use crate::music::queue::{DistributedQueue, QueueError};
use crate::music::request::{shorten, LifecycleStage, MediaRequest, SearchType};
use crate::music::search::{Requester, SearchResolver};
use crate::music::track::{MediaDownload, TrackMetadata};
use crate::storage::ObjectStorageClient;
use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use rand::seq::SliceRandom;
use songbird::Songbird;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How many items random-play queues by default
const RANDOM_PLAY_DEFAULT: usize = 32;

/// Bundle registry key for a progress bundle
fn bundle_key(id: Uuid) -> String {
    format!("request-bundle-{id}")
}

/// Bundle registry key for a guild's history display
fn history_bundle_id(guild_id: u64) -> String {
    format!("history-{guild_id}")
}

/// Which playlist a playlist command targets
#[derive(Debug, Clone, Copy)]
pub enum PlaylistSelector {
    /// 1-based index into the guild's user playlists
    Index(usize),
    History,
}

/// Top-level owner of all guilds, queues, and background loops.
///
/// Commands enter through the methods below; six loops drive the pipeline.
/// All cross-component references are injected at construction.
pub struct MusicOrchestrator {
    config: &'static AppConfig,
    pool: DbPool,
    manager: Arc<Songbird>,
    discord_cache: Option<Arc<serenity::Cache>>,
    pub dispatcher: Arc<MessageDispatcher>,
    cache: Option<Arc<DownloadCache>>,
    resolver: SearchResolver,
    downloader: Downloader,
    backoff: FailureBackoffTracker,
    history: HistoryRecorder,
    players: DashMap<u64, Arc<GuildPlayer>>,
    bundles: DashMap<String, Arc<Mutex<ProgressBundle>>>,
    search_queue: DistributedQueue<MediaRequest>,
    download_queue: DistributedQueue<MediaRequest>,
    history_tx: UnboundedSender<HistoryItem>,
    history_rx: tokio::sync::Mutex<UnboundedReceiver<HistoryItem>>,
    shutdown_tx: watch::Sender<bool>,
    last_download_at: Mutex<Option<Instant>>,
    /// Monotonic liveness stamps, one per loop
    heartbeats: DashMap<&'static str, Instant>,
}

impl MusicOrchestrator {
    pub fn new(
        config: &'static AppConfig,
        pool: DbPool,
        manager: Arc<Songbird>,
        discord_cache: Option<Arc<serenity::Cache>>,
        dispatcher: Arc<MessageDispatcher>,
        resolver: SearchResolver,
    ) -> Self {
        let storage = config
            .storage
            .as_ref()
            .map(|s| Arc::new(ObjectStorageClient::new(s)));
        let cache = config.cache.enabled.then(|| {
            Arc::new(DownloadCache::new(
                pool.clone(),
                config.cache_dir(),
                config.cache.max_entries,
                config.cache.max_search_entries,
                storage,
            ))
        });
        let downloader = Downloader::new(config.downloader.clone(), config.tmp_dir());
        let backoff = FailureBackoffTracker::new(
            config.backoff.max_size,
            Duration::from_secs(config.backoff.max_age_s),
        );
        let history = HistoryRecorder::new(pool.clone(), config.history.clone());
        let (history_tx, history_rx) = unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let priorities: std::collections::HashMap<u64, u32> = config
            .queues
            .guild_priorities
            .iter()
            .filter_map(|(guild, priority)| guild.parse().ok().map(|g| (g, *priority)))
            .collect();
        Self {
            config,
            pool,
            manager,
            discord_cache,
            dispatcher,
            cache,
            resolver,
            downloader,
            backoff,
            history,
            players: DashMap::new(),
            bundles: DashMap::new(),
            search_queue: DistributedQueue::new(config.queues.search_capacity, priorities.clone()),
            download_queue: DistributedQueue::new(config.queues.download_capacity, priorities),
            history_tx,
            history_rx: tokio::sync::Mutex::new(history_rx),
            shutdown_tx,
            last_download_at: Mutex::new(None),
            heartbeats: DashMap::new(),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn heartbeat(&self, loop_name: &'static str) {
        self.heartbeats.insert(loop_name, Instant::now());
    }

    /// Age of a loop's last heartbeat, for liveness observers
    pub fn heartbeat_age(&self, loop_name: &str) -> Option<Duration> {
        self.heartbeats.get(loop_name).map(|at| at.elapsed())
    }

    pub fn cache(&self) -> Option<&Arc<DownloadCache>> {
        self.cache.as_ref()
    }

    // ---- players ----

    pub fn player(&self, guild_id: u64) -> Option<Arc<GuildPlayer>> {
        self.players.get(&guild_id).map(|p| p.value().clone())
    }

    /// Get or create the guild's player and join its voice channel
    pub async fn ensure_player(
        self: &Arc<Self>,
        guild_id: u64,
        voice_channel_id: u64,
        text_channel_id: u64,
    ) -> AppResult<Arc<GuildPlayer>> {
        if let Some(player) = self.player(guild_id) {
            if !player.is_shutting_down() {
                if player.voice_channel_id() != voice_channel_id {
                    player.move_voice(voice_channel_id).await?;
                }
                return Ok(player);
            }
            self.players.remove(&guild_id);
        }

        let player = Arc::new(GuildPlayer::new(
            guild_id,
            voice_channel_id,
            text_channel_id,
            self.manager.clone(),
            self.dispatcher.clone(),
            self.config.player.queue_max_size,
            self.config.player.history_max_size,
            Duration::from_secs(self.config.player.empty_channel_timeout_s),
            self.history_tx.clone(),
            self.config.messages.page_char_limit,
        ));
        player.join_voice().await?;
        self.players.insert(guild_id, player.clone());
        tokio::spawn(player.clone().run(self.shutdown_signal()));
        Ok(player)
    }

    /// Shut one player down and clear its pipeline state
    pub async fn remove_player(&self, guild_id: u64, reason: &str) {
        self.search_queue.block_partition(guild_id);
        self.download_queue.block_partition(guild_id);
        for request in self.search_queue.clear_partition(guild_id) {
            self.update_bundle_row(&request, LifecycleStage::Discarded, None);
        }
        for request in self.download_queue.clear_partition(guild_id) {
            self.update_bundle_row(&request, LifecycleStage::Discarded, None);
        }
        if let Some((_, player)) = self.players.remove(&guild_id) {
            player.shutdown(reason).await;
        }
        self.dispatcher.retire(&history_bundle_id(guild_id));
    }

    // ---- bundle plumbing ----

    fn register_bundle(&self, bundle: ProgressBundle) -> (String, Arc<Mutex<ProgressBundle>>) {
        let key = bundle_key(bundle.id);
        let channel_id = bundle.channel_id;
        let shared = Arc::new(Mutex::new(bundle));
        self.bundles.insert(key.clone(), shared.clone());
        self.dispatcher.register(&key, channel_id, false);
        self.dispatcher.touch(&key);
        (key, shared)
    }

    /// Advance one request's bundle row and wake the dispatcher
    fn update_bundle_row(
        &self,
        request: &MediaRequest,
        stage: LifecycleStage,
        reason: Option<String>,
    ) {
        let Some(bundle_id) = request.bundle_id else {
            return;
        };
        let key = bundle_key(bundle_id);
        let Some(bundle) = self.bundles.get(&key) else {
            return;
        };
        bundle.lock().unwrap().update(request.id, stage, reason);
        self.dispatcher.touch(&key);
    }

    /// Render callback handed to the dispatch loop
    pub fn render_bundle(&self, bundle_id: &str) -> Option<Vec<String>> {
        if let Some(guild_id) = bundle_id.strip_prefix("play-order-") {
            let guild_id: u64 = guild_id.parse().ok()?;
            return self.player(guild_id).map(|p| p.render_play_order());
        }
        if let Some(guild_id) = bundle_id.strip_prefix("history-") {
            let guild_id: u64 = guild_id.parse().ok()?;
            return self
                .player(guild_id)
                .map(|p| render_history(&p.history_entries(), self.config.messages.page_char_limit));
        }
        self.bundles
            .get(bundle_id)
            .map(|b| b.lock().unwrap().render())
    }

    // ---- command surface ----

    /// The play command: resolve, bundle, enqueue
    pub async fn play(
        self: &Arc<Self>,
        requester: Requester,
        voice_channel_id: u64,
        input: &str,
    ) -> AppResult<()> {
        let player = self
            .ensure_player(requester.guild_id, voice_channel_id, requester.channel_id)
            .await?;

        let mut bundle = ProgressBundle::new(
            requester.guild_id,
            requester.channel_id,
            self.config.messages.page_char_limit,
        );
        bundle.set_initial_input(input);
        let (key, shared) = self.register_bundle(bundle);

        let resolved = match self.resolver.resolve(input, &requester).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let message = match &e {
                    AppError::Catalog(msg) => msg.clone(),
                    other => {
                        error!(error = %other, "Search resolution failed");
                        "issue gathering catalog data".to_string()
                    }
                };
                shared.lock().unwrap().set_search_error(&message);
                self.dispatcher.touch(&key);
                return Ok(());
            }
        };

        {
            let mut bundle = shared.lock().unwrap();
            if let Some(name) = &resolved.display_name {
                bundle.set_display_name(name);
            }
            for request in &resolved.requests {
                let stage = if request.search_type.needs_resolution() {
                    LifecycleStage::Searching
                } else {
                    LifecycleStage::Queued
                };
                bundle.add_request(request, stage);
            }
            bundle.freeze();
        }
        self.dispatcher.touch(&key);

        for mut request in resolved.requests {
            request.bundle_id = Some(shared.lock().unwrap().id);
            if request.search_type.needs_resolution() {
                if let Err(e) = self.search_queue.put(requester.guild_id, request.clone()) {
                    self.update_bundle_row(
                        &request,
                        LifecycleStage::Failed,
                        Some(format!("search queue unavailable, {e}")),
                    );
                }
            } else {
                self.enqueue_download(request, Some(&player)).await;
            }
        }
        Ok(())
    }

    /// Cache-check a canonical-URL request, then either serve it directly
    /// or put it on the download queue
    async fn enqueue_download(
        self: &Arc<Self>,
        request: MediaRequest,
        player: Option<&Arc<GuildPlayer>>,
    ) {
        if let Some(cache) = &self.cache {
            match cache.lookup(&request.resolved_search).await {
                Ok(CacheLookup::KnownFailure(kind)) => {
                    self.update_bundle_row(
                        &request,
                        LifecycleStage::Failed,
                        Some(kind.reason().to_string()),
                    );
                    return;
                }
                Ok(CacheLookup::Hit(row)) => {
                    debug!(url = %row.url, "Cache hit before download queue");
                    cache.begin_use(&row.url);
                    let download = MediaDownload::new(
                        request.clone(),
                        row.url.clone(),
                        TrackMetadata {
                            title: row.title.clone(),
                            uploader: row.uploader.clone(),
                            duration_s: row.duration_s as u32,
                        },
                        PathBuf::from(&row.path),
                        true,
                    );
                    self.deliver(request, download, player.cloned()).await;
                    cache.end_use(&row.url);
                    return;
                }
                Ok(CacheLookup::Miss) => {}
                Err(e) => warn!(error = %e, "Cache lookup failed, downloading instead"),
            }
        }

        self.update_bundle_row(&request, LifecycleStage::Queued, None);
        let guild_id = request.guild_id;
        if let Err(e) = self.download_queue.put(guild_id, request.clone()) {
            let reason = match e {
                QueueError::Full => "download queue is full".to_string(),
                QueueError::Blocked => "downloads are shut down for this server".to_string(),
            };
            self.update_bundle_row(&request, LifecycleStage::Failed, Some(reason));
        }
    }

    /// Hand a finished download to its guild player or saved playlist
    async fn deliver(
        self: &Arc<Self>,
        request: MediaRequest,
        mut download: MediaDownload,
        player: Option<Arc<GuildPlayer>>,
    ) {
        if let Some(playlist_id) = request.add_to_playlist {
            let result = PlaylistRepo::add_item(
                &self.pool,
                playlist_id,
                &download.url,
                &download.metadata.title,
            )
            .await;
            match result {
                Ok(_) => self.update_bundle_row(&request, LifecycleStage::Completed, None),
                Err(e) => self.update_bundle_row(
                    &request,
                    LifecycleStage::Failed,
                    Some(format!("could not save to playlist, {e}")),
                ),
            }
            return;
        }

        let player = match player.or_else(|| self.player(request.guild_id)) {
            Some(player) if !player.is_shutting_down() => player,
            // Player gone before delivery is administrative, not a failure
            _ => {
                debug!(guild_id = request.guild_id, "Player gone, discarding download");
                download.release();
                self.update_bundle_row(&request, LifecycleStage::Discarded, None);
                return;
            }
        };

        if let Err(e) = download.ready_for_guild(&self.config.guild_dir(request.guild_id)) {
            warn!(error = %e, "Could not ready per-use file");
            self.update_bundle_row(
                &request,
                LifecycleStage::Failed,
                Some("could not prepare local file".to_string()),
            );
            return;
        }

        match player.enqueue(download) {
            Ok(()) => self.update_bundle_row(&request, LifecycleStage::Completed, None),
            Err(QueueError::Full) => {
                self.update_bundle_row(
                    &request,
                    LifecycleStage::Failed,
                    Some("play queue is full".to_string()),
                );
            }
            Err(QueueError::Blocked) => {
                self.update_bundle_row(&request, LifecycleStage::Discarded, None);
            }
        }
    }

    pub async fn skip(&self, guild_id: u64) -> AppResult<()> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        player.skip().await;
        Ok(())
    }

    pub async fn pause(&self, guild_id: u64) -> AppResult<()> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        player.pause().await;
        Ok(())
    }

    pub async fn resume(&self, guild_id: u64) -> AppResult<()> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        player.resume().await;
        Ok(())
    }

    pub async fn stop(&self, guild_id: u64) -> AppResult<()> {
        if self.player(guild_id).is_none() {
            return Err(AppError::PlayerGone(guild_id));
        }
        self.remove_player(guild_id, "stop requested").await;
        Ok(())
    }

    pub fn remove_queue_item(&self, guild_id: u64, position: usize) -> AppResult<String> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        player
            .remove_queue_item(position)
            .ok_or_else(|| AppError::internal(format!("no queue entry at position {position}")))
    }

    pub fn bump_queue_item(&self, guild_id: u64, position: usize) -> AppResult<()> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        if !player.bump_queue_item(position) {
            return Err(AppError::internal(format!(
                "no queue entry at position {position}"
            )));
        }
        Ok(())
    }

    pub fn shuffle_queue(&self, guild_id: u64) -> AppResult<()> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        player.shuffle_queue();
        Ok(())
    }

    /// Show the play-order bundle (it is sticky; this re-anchors it)
    pub fn show_queue(&self, guild_id: u64) -> AppResult<()> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        player.touch_play_order();
        Ok(())
    }

    /// Render the recent-history bundle in the guild's text channel
    pub fn show_history(&self, guild_id: u64) -> AppResult<()> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        let key = history_bundle_id(guild_id);
        self.dispatcher.register(&key, player.text_channel_id(), false);
        self.dispatcher.touch(&key);
        Ok(())
    }

    /// Point future status messages at another text channel
    pub fn move_messages(&self, guild_id: u64, new_channel_id: u64) -> AppResult<()> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        player.set_text_channel(new_channel_id);
        self.dispatcher
            .move_channel(&play_order_bundle_id(guild_id), new_channel_id);
        self.dispatcher
            .move_channel(&history_bundle_id(guild_id), new_channel_id);
        Ok(())
    }

    pub fn notify(&self, channel_id: u64, content: impl Into<String>) {
        self.dispatcher.send_single(SingleMessage {
            channel_id,
            content: content.into(),
            delete_after: Some(Duration::from_secs(self.config.messages.finished_grace_s)),
        });
    }

    // ---- playlist commands ----

    async fn resolve_playlist(
        &self,
        guild_id: u64,
        selector: PlaylistSelector,
    ) -> AppResult<crate::db::PlaylistRow> {
        match selector {
            PlaylistSelector::History => {
                PlaylistRepo::get_or_create_history(&self.pool, guild_id).await
            }
            PlaylistSelector::Index(index) => {
                let playlists = PlaylistRepo::list_for_guild(&self.pool, guild_id).await?;
                playlists
                    .into_iter()
                    .nth(index.saturating_sub(1))
                    .ok_or_else(|| AppError::internal(format!("no playlist at index {index}")))
            }
        }
    }

    pub async fn playlist_create(&self, guild_id: u64, name: &str) -> AppResult<String> {
        let playlist = PlaylistRepo::create(&self.pool, guild_id, name).await?;
        Ok(format!("Created playlist \"{}\"", playlist.name))
    }

    pub async fn playlist_list(&self, guild_id: u64) -> AppResult<String> {
        let playlists = PlaylistRepo::list_for_guild(&self.pool, guild_id).await?;
        if playlists.is_empty() {
            return Ok("No playlists saved for this server".to_string());
        }
        let mut lines = vec!["Saved playlists:".to_string()];
        for (index, playlist) in playlists.iter().enumerate() {
            let count = PlaylistRepo::count_items(&self.pool, playlist.id).await?;
            lines.push(format!("{}. {} ({count} items)", index + 1, playlist.name));
        }
        Ok(lines.join("\n"))
    }

    pub async fn playlist_show(
        &self,
        guild_id: u64,
        selector: PlaylistSelector,
    ) -> AppResult<String> {
        let playlist = self.resolve_playlist(guild_id, selector).await?;
        let items = PlaylistRepo::items(&self.pool, playlist.id).await?;
        if items.is_empty() {
            return Ok(format!("Playlist \"{}\" is empty", playlist.name));
        }
        let mut lines = vec![format!("Playlist \"{}\":", playlist.name)];
        for (index, item) in items.iter().enumerate() {
            lines.push(format!(
                "{}. {}",
                index + 1,
                shorten(&item.title, 64)
            ));
        }
        Ok(lines.join("\n"))
    }

    pub async fn playlist_delete(
        &self,
        guild_id: u64,
        selector: PlaylistSelector,
    ) -> AppResult<String> {
        let playlist = self.resolve_playlist(guild_id, selector).await?;
        if playlist.is_history() {
            return Err(AppError::internal("The history playlist cannot be deleted"));
        }
        let name = playlist.name.clone();
        PlaylistRepo::delete(&self.pool, playlist.id).await?;
        Ok(format!("Deleted playlist \"{name}\""))
    }

    pub async fn playlist_rename(
        &self,
        guild_id: u64,
        selector: PlaylistSelector,
        new_name: &str,
    ) -> AppResult<String> {
        let playlist = self.resolve_playlist(guild_id, selector).await?;
        if playlist.is_history() {
            return Err(AppError::internal("The history playlist cannot be renamed"));
        }
        PlaylistRepo::rename(&self.pool, playlist.id, new_name).await?;
        Ok(format!("Renamed \"{}\" to \"{new_name}\"", playlist.name))
    }

    /// Resolve a search and save the results to a playlist via the
    /// download pipeline (metadata comes from the extractor)
    pub async fn playlist_item_add(
        self: &Arc<Self>,
        requester: Requester,
        selector: PlaylistSelector,
        input: &str,
    ) -> AppResult<String> {
        let playlist = self.resolve_playlist(requester.guild_id, selector).await?;
        if playlist.is_history() {
            // Append-only: the recorder is the only writer
            return Err(AppError::internal(
                "Items cannot be added to the history playlist directly",
            ));
        }
        let resolved = self.resolver.resolve(input, &requester).await?;
        let count = resolved.requests.len();
        for mut request in resolved.requests {
            request.add_to_playlist = Some(playlist.id);
            if request.search_type.needs_resolution() {
                self.search_queue
                    .put(requester.guild_id, request)
                    .map_err(|e| AppError::internal(format!("search queue unavailable: {e}")))?;
            } else {
                self.enqueue_download(request, None).await;
            }
        }
        Ok(format!(
            "Queued {count} item(s) for playlist \"{}\"",
            playlist.name
        ))
    }

    pub async fn playlist_item_remove(
        &self,
        guild_id: u64,
        selector: PlaylistSelector,
        item_index: usize,
    ) -> AppResult<String> {
        let playlist = self.resolve_playlist(guild_id, selector).await?;
        if playlist.is_history() {
            return Err(AppError::internal("The history playlist is append-only"));
        }
        let items = PlaylistRepo::items(&self.pool, playlist.id).await?;
        let item = items
            .into_iter()
            .nth(item_index.saturating_sub(1))
            .ok_or_else(|| AppError::internal(format!("no item at index {item_index}")))?;
        PlaylistRepo::delete_item(&self.pool, item.id).await?;
        Ok(format!("Removed \"{}\"", shorten(&item.title, 64)))
    }

    /// Save the current play queue (or recent history) as a new playlist
    pub async fn playlist_save_queue(
        &self,
        guild_id: u64,
        name: &str,
        from_history: bool,
    ) -> AppResult<String> {
        let player = self.player(guild_id).ok_or(AppError::PlayerGone(guild_id))?;
        let playlist = PlaylistRepo::create(&self.pool, guild_id, name).await?;
        let entries: Vec<(String, String)> = if from_history {
            player
                .history_entries()
                .into_iter()
                .map(|e| (e.url, e.title))
                .collect()
        } else {
            player.queued_tracks()
        };
        let count = entries.len();
        for (url, title) in entries {
            PlaylistRepo::add_item(&self.pool, playlist.id, &url, &title).await?;
        }
        Ok(format!("Saved {count} item(s) to playlist \"{name}\""))
    }

    pub async fn playlist_merge(
        &self,
        guild_id: u64,
        from: PlaylistSelector,
        into: PlaylistSelector,
    ) -> AppResult<String> {
        let from_playlist = self.resolve_playlist(guild_id, from).await?;
        let into_playlist = self.resolve_playlist(guild_id, into).await?;
        if into_playlist.is_history() {
            return Err(AppError::internal("The history playlist is append-only"));
        }
        let items = PlaylistRepo::items(&self.pool, from_playlist.id).await?;
        let count = items.len();
        for item in items {
            PlaylistRepo::add_item(&self.pool, into_playlist.id, &item.url, &item.title).await?;
        }
        Ok(format!(
            "Merged {count} item(s) from \"{}\" into \"{}\"",
            from_playlist.name, into_playlist.name
        ))
    }

    /// Queue a saved playlist through the download pipeline
    pub async fn playlist_queue(
        self: &Arc<Self>,
        requester: Requester,
        voice_channel_id: u64,
        selector: PlaylistSelector,
        shuffle: bool,
        limit: Option<usize>,
    ) -> AppResult<()> {
        let playlist = self.resolve_playlist(requester.guild_id, selector).await?;
        let is_history = playlist.is_history();
        let mut items = PlaylistRepo::items(&self.pool, playlist.id).await?;
        if shuffle {
            items.shuffle(&mut rand::thread_rng());
        }
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        if items.is_empty() {
            return Err(AppError::internal("Playlist is empty"));
        }

        let player = self
            .ensure_player(requester.guild_id, voice_channel_id, requester.channel_id)
            .await?;
        let mut bundle = ProgressBundle::new(
            requester.guild_id,
            requester.channel_id,
            self.config.messages.page_char_limit,
        );
        bundle.set_initial_input(&playlist.name);
        let (key, shared) = self.register_bundle(bundle);

        let mut requests = Vec::with_capacity(items.len());
        {
            let mut bundle = shared.lock().unwrap();
            for item in &items {
                let mut request = MediaRequest::new(
                    requester.guild_id,
                    requester.channel_id,
                    requester.name.clone(),
                    requester.id,
                    item.url.clone(),
                    SearchType::VideoUrl,
                );
                request.from_history = is_history;
                request.history_item_id = Some(item.id);
                request.bundle_id = Some(bundle.id);
                bundle.add_request(&request, LifecycleStage::Queued);
                requests.push(request);
            }
            bundle.freeze();
        }
        self.dispatcher.touch(&key);
        PlaylistRepo::set_queued_at(&self.pool, playlist.id).await?;

        for request in requests {
            self.enqueue_download(request, Some(&player)).await;
        }
        Ok(())
    }

    /// Queue random items from the history playlist, or from the cache pool
    pub async fn random_play(
        self: &Arc<Self>,
        requester: Requester,
        voice_channel_id: u64,
        cache_only: bool,
        count: Option<usize>,
    ) -> AppResult<()> {
        let count = count.unwrap_or(RANDOM_PLAY_DEFAULT);
        if cache_only {
            let Some(cache) = &self.cache else {
                return Err(AppError::internal("Cache is not enabled"));
            };
            let pool = cache.random_urls(count as i64).await?;
            if pool.is_empty() {
                return Err(AppError::internal("No cached items to play"));
            }
            let player = self
                .ensure_player(requester.guild_id, voice_channel_id, requester.channel_id)
                .await?;
            let mut bundle = ProgressBundle::new(
                requester.guild_id,
                requester.channel_id,
                self.config.messages.page_char_limit,
            );
            bundle.set_initial_input("random cached tracks");
            let (key, shared) = self.register_bundle(bundle);
            let mut requests = Vec::new();
            {
                let mut bundle = shared.lock().unwrap();
                for (url, _title) in pool {
                    let mut request = MediaRequest::new(
                        requester.guild_id,
                        requester.channel_id,
                        requester.name.clone(),
                        requester.id,
                        url,
                        SearchType::VideoUrl,
                    );
                    request.from_history = true;
                    request.bundle_id = Some(bundle.id);
                    bundle.add_request(&request, LifecycleStage::Queued);
                    requests.push(request);
                }
                bundle.freeze();
            }
            self.dispatcher.touch(&key);
            for request in requests {
                self.enqueue_download(request, Some(&player)).await;
            }
            return Ok(());
        }

        self.playlist_queue(
            requester,
            voice_channel_id,
            PlaylistSelector::History,
            true,
            Some(count),
        )
        .await
    }

    // ---- pipeline loops ----

    /// Spawn every background loop
    pub fn start(self: &Arc<Self>) {
        let loops: Vec<(&'static str, tokio::task::JoinHandle<()>)> = vec![
            ("dispatch", tokio::spawn(self.clone().dispatch_loop())),
            ("search", tokio::spawn(self.clone().search_loop())),
            ("download", tokio::spawn(self.clone().download_loop())),
            (
                "cleanup-players",
                tokio::spawn(self.clone().cleanup_players_loop()),
            ),
            (
                "cache-cleanup",
                tokio::spawn(self.clone().cache_cleanup_loop()),
            ),
            (
                "history-write",
                tokio::spawn(self.clone().history_write_loop()),
            ),
        ];
        for (name, _) in &loops {
            info!(name, "Started background loop");
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            self.heartbeat("dispatch");
            if *shutdown.borrow() {
                break;
            }
            let this = self.clone();
            let outcome = tokio::select! {
                outcome = self.dispatcher.tick(move |id| this.render_bundle(id)) => outcome,
                _ = shutdown.changed() => break,
            };
            match outcome {
                TickOutcome::Dispatched => {}
                TickOutcome::Idle => tokio::time::sleep(Duration::from_millis(200)).await,
                TickOutcome::Backpressure => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
        debug!("Dispatch loop exited");
    }

    async fn search_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            self.heartbeat("search");
            let request = tokio::select! {
                request = self.search_queue.get() => request,
                _ = shutdown.changed() => break,
            };
            if let Err(e) = self.handle_search(request).await {
                error!(error = %e, "Search loop iteration failed");
            }
        }
        debug!("Search loop exited");
    }

    /// Resolve one free-text request to a canonical URL and forward it
    async fn handle_search(self: &Arc<Self>, mut request: MediaRequest) -> AppResult<()> {
        if self.is_shutting_down() {
            self.update_bundle_row(&request, LifecycleStage::Discarded, None);
            return Ok(());
        }

        if let Some(cache) = &self.cache {
            match cache.search_lookup(&request.raw_search).await {
                Ok(Some(url)) => {
                    debug!(query = %request.raw_search, url = %url, "Search memo hit");
                    request.resolve(url);
                    self.enqueue_download(request, None).await;
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Search memo lookup failed"),
            }
        }

        let Some(youtube) = self.resolver.youtube() else {
            self.update_bundle_row(
                &request,
                LifecycleStage::Failed,
                Some("no search catalog configured".to_string()),
            );
            return Ok(());
        };
        match youtube.search_video(&request.raw_search).await {
            Ok(Some(url)) => {
                if let Some(cache) = &self.cache {
                    // Streaming-track queries are deterministic enough to memoize
                    if request.search_type == SearchType::StreamingTrack {
                        if let Err(e) = cache.search_insert(&request.raw_search, &url).await {
                            warn!(error = %e, "Could not memoize search resolution");
                        }
                    }
                }
                request.resolve(url);
                self.enqueue_download(request, None).await;
            }
            Ok(None) => {
                self.update_bundle_row(
                    &request,
                    LifecycleStage::Failed,
                    Some("no search results found".to_string()),
                );
            }
            Err(e) => {
                warn!(error = %e, query = %request.raw_search, "Search catalog call failed");
                self.update_bundle_row(
                    &request,
                    LifecycleStage::Failed,
                    Some("search catalog unavailable".to_string()),
                );
            }
        }
        Ok(())
    }

    async fn download_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            self.heartbeat("download");
            let request = tokio::select! {
                request = self.download_queue.get() => request,
                _ = shutdown.changed() => break,
            };
            self.handle_download(request, &mut shutdown).await;
        }
        debug!("Download loop exited");
    }

    /// Remaining wait before the next download may start
    fn download_wait(&self) -> Duration {
        let base = Duration::from_secs(self.config.backoff.base_wait_s);
        let target = self.backoff.wait_for(base);
        let elapsed = self
            .last_download_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed())
            .unwrap_or(target);
        target.saturating_sub(elapsed)
    }

    fn mark_download_attempt(&self) {
        *self.last_download_at.lock().unwrap() = Some(Instant::now());
    }

    /// One download-queue item: wait out the backoff, download, deliver
    async fn handle_download(
        self: &Arc<Self>,
        request: MediaRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        if self.is_shutting_down() {
            self.update_bundle_row(&request, LifecycleStage::Discarded, None);
            return;
        }

        // Skip items for players that disappeared while queued
        let player = self.player(request.guild_id);
        if request.add_to_playlist.is_none() {
            match &player {
                Some(player) if !player.is_shutting_down() => {
                    if player.queue_is_full() {
                        self.update_bundle_row(
                            &request,
                            LifecycleStage::Failed,
                            Some("play queue is full".to_string()),
                        );
                        return;
                    }
                }
                _ => {
                    self.update_bundle_row(&request, LifecycleStage::Discarded, None);
                    return;
                }
            }
        }

        // Cache may have filled while this sat in the queue
        if let Some(cache) = &self.cache {
            match cache.lookup(&request.resolved_search).await {
                Ok(CacheLookup::Hit(row)) => {
                    cache.begin_use(&row.url);
                    let download = MediaDownload::new(
                        request.clone(),
                        row.url.clone(),
                        TrackMetadata {
                            title: row.title.clone(),
                            uploader: row.uploader.clone(),
                            duration_s: row.duration_s as u32,
                        },
                        PathBuf::from(&row.path),
                        true,
                    );
                    self.deliver(request, download, player).await;
                    cache.end_use(&row.url);
                    return;
                }
                Ok(CacheLookup::KnownFailure(kind)) => {
                    self.update_bundle_row(
                        &request,
                        LifecycleStage::Failed,
                        Some(kind.reason().to_string()),
                    );
                    return;
                }
                Ok(CacheLookup::Miss) => {}
                Err(e) => warn!(error = %e, "Cache re-check failed"),
            }
        }

        let wait = self.download_wait();
        if !wait.is_zero() {
            debug!(
                wait_s = wait.as_secs(),
                backoff = %self.backoff.status_summary(),
                "Waiting before next download"
            );
            self.update_bundle_row(&request, LifecycleStage::Backoff, None);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    self.update_bundle_row(&request, LifecycleStage::Discarded, None);
                    return;
                }
            }
        }

        self.update_bundle_row(&request, LifecycleStage::InProgress, None);
        self.mark_download_attempt();
        match self.downloader.download(&request.resolved_search).await {
            Ok(outcome) => {
                self.backoff.record_success();
                let download = if let Some(cache) = &self.cache {
                    match cache
                        .adopt(&outcome.canonical_url, &outcome.file_path, &outcome.metadata)
                        .await
                    {
                        Ok(row) => {
                            cache.begin_use(&row.url);
                            let download = MediaDownload::new(
                                request.clone(),
                                row.url.clone(),
                                outcome.metadata,
                                PathBuf::from(&row.path),
                                false,
                            );
                            self.deliver(request.clone(), download, player).await;
                            cache.end_use(&row.url);
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "Cache adopt failed, serving from scratch file");
                            MediaDownload::new(
                                request.clone(),
                                outcome.canonical_url,
                                outcome.metadata,
                                outcome.file_path,
                                false,
                            )
                        }
                    }
                } else {
                    MediaDownload::new(
                        request.clone(),
                        outcome.canonical_url,
                        outcome.metadata,
                        outcome.file_path,
                        false,
                    )
                };
                let scratch = download.source_path.clone();
                self.deliver(request, download, player).await;
                // Without a cache the scratch file has no further use
                if self.cache.is_none() {
                    let _ = tokio::fs::remove_file(&scratch).await;
                }
            }
            Err(DownloadError::Retryable(reason)) => {
                self.backoff.record_failure();
                let mut request = request;
                if request.retry_count < self.config.downloader.download_retries {
                    request.retry_count += 1;
                    info!(
                        url = %request.resolved_search,
                        retry = request.retry_count,
                        reason = %reason,
                        "Retryable download failure, requeueing"
                    );
                    self.update_bundle_row(
                        &request,
                        LifecycleStage::Queued,
                        Some("will retry".to_string()),
                    );
                    if self
                        .download_queue
                        .put(request.guild_id, request.clone())
                        .is_err()
                    {
                        self.update_bundle_row(
                            &request,
                            LifecycleStage::Failed,
                            Some("download queue is full".to_string()),
                        );
                    }
                } else {
                    self.update_bundle_row(
                        &request,
                        LifecycleStage::Failed,
                        Some(format!("retries exhausted, {reason}")),
                    );
                }
            }
            Err(DownloadError::Terminal(kind, reason)) => {
                // Terminal failures do not feed the backoff tracker
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache
                        .record_terminal_failure(&request.resolved_search, kind)
                        .await
                    {
                        warn!(error = %e, "Could not record failure sentinel");
                    }
                }
                self.update_bundle_row(&request, LifecycleStage::Failed, Some(reason));
            }
        }
    }

    /// Whether any non-bot member occupies the player's voice channel.
    /// Without a gateway cache (tests) the channel counts as occupied.
    fn voice_channel_occupied(&self, player: &GuildPlayer) -> bool {
        let Some(cache) = &self.discord_cache else {
            return true;
        };
        let bot_id = cache.current_user().id;
        let Some(guild) = cache.guild(serenity::GuildId::new(player.guild_id)) else {
            return true;
        };
        guild.voice_states.values().any(|vs| {
            vs.channel_id
                .is_some_and(|c| c.get() == player.voice_channel_id())
                && vs.user_id != bot_id
        })
    }

    async fn cleanup_players_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            self.heartbeat("cleanup-players");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = shutdown.changed() => break,
            }

            let mut to_remove = Vec::new();
            for entry in self.players.iter() {
                let player = entry.value();
                // Players that shut themselves down (voice loss) just need
                // their map slot and queues cleared
                if player.is_shutting_down() {
                    to_remove.push(player.guild_id);
                    continue;
                }
                let occupied = self.voice_channel_occupied(player);
                if player.note_occupancy(occupied) {
                    to_remove.push(player.guild_id);
                }
            }
            for guild_id in to_remove {
                warn!(guild_id, "Voice channel empty past timeout, stopping player");
                self.remove_player(guild_id, "empty channel timeout").await;
            }

            self.sweep_finished_bundles();
        }
        debug!("Cleanup loop exited");
    }

    /// Retire bundles whose finished state has held past the grace period
    fn sweep_finished_bundles(&self) {
        let grace = chrono::Duration::seconds(self.config.messages.finished_grace_s as i64);
        let now = chrono::Utc::now();
        let mut expired = Vec::new();
        for entry in self.bundles.iter() {
            let bundle = entry.value().lock().unwrap();
            if let Some(finished_at) = bundle.finished_at() {
                if now - finished_at > grace {
                    expired.push(entry.key().clone());
                }
            }
        }
        for key in expired {
            debug!(bundle = %key, "Retiring finished bundle");
            self.bundles.remove(&key);
            self.dispatcher.retire(&key);
        }
    }

    async fn cache_cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        loop {
            self.heartbeat("cache-cleanup");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                _ = shutdown.changed() => break,
            }
            let Some(cache) = &self.cache else {
                continue;
            };
            if let Err(e) = self.run_cache_cleanup(cache).await {
                error!(error = %e, "Cache cleanup iteration failed");
            }
        }
        debug!("Cache cleanup loop exited");
    }

    async fn run_cache_cleanup(&self, cache: &Arc<DownloadCache>) -> AppResult<()> {
        cache.mark_lru_for_delete().await?;
        let deletable = cache.collect_deletable().await?;
        if !deletable.is_empty() {
            let deleted = cache.delete_entries(deletable).await?;
            info!(deleted, "Deleted expired cache entries");
        }
        cache.prune_search().await?;
        if let Some(storage) = self.config.storage.as_ref() {
            cache.backup_pending(storage.backup_batch).await?;
        }
        Ok(())
    }

    async fn history_write_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        let mut rx = self.history_rx.lock().await;
        loop {
            self.heartbeat("history-write");
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = shutdown.changed() => break,
            };
            let Some(item) = item else {
                break;
            };
            self.history.drain(vec![item]).await;
        }
        debug!("History write loop exited");
    }

    // ---- shutdown ----

    /// Clean shutdown: stop accepting work, discard queued requests, close
    /// players and voice handles.
    pub async fn shutdown(&self) {
        info!("Music orchestrator shutting down");
        let _ = self.shutdown_tx.send(true);

        for request in self.search_queue.clear_all() {
            self.update_bundle_row(&request, LifecycleStage::Discarded, None);
        }
        for request in self.download_queue.clear_all() {
            self.update_bundle_row(&request, LifecycleStage::Discarded, None);
        }

        let guild_ids: Vec<u64> = self.players.iter().map(|e| *e.key()).collect();
        for guild_id in guild_ids {
            if let Some((_, player)) = self.players.remove(&guild_id) {
                player.shutdown("bot shutdown").await;
            }
        }
    }
}

/// Render the recent-history table for a guild
fn render_history(entries: &[HistoryEntry], page_char_limit: usize) -> Vec<String> {
    if entries.is_empty() {
        return vec!["No playback history yet".to_string()];
    }
    let mut lines = vec![format!(
        "{:<3} || {:<48} || {:<32}",
        "Pos", "Title", "Uploader"
    )];
    // Newest first
    for (index, entry) in entries.iter().rev().enumerate() {
        lines.push(format!(
            "{:<3} || {:<48} || {:<32}",
            index + 1,
            shorten(&entry.title, 48),
            shorten(&entry.uploader, 32),
        ));
    }
    let mut pages = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0;
    for line in lines {
        if current_len + line.len() + 8 > page_char_limit && !current.is_empty() {
            pages.push(format!("```{}```", current.join("\n")));
            current = Vec::new();
            current_len = 0;
        }
        current_len += line.len() + 1;
        current.push(line);
    }
    if !current.is_empty() {
        pages.push(format!("```{}```", current.join("\n")));
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_keys() {
        let id = Uuid::new_v4();
        assert_eq!(bundle_key(id), format!("request-bundle-{id}"));
        assert_eq!(history_bundle_id(9), "history-9");
    }

    #[test]
    fn test_render_history_paginates() {
        let entries: Vec<HistoryEntry> = (0..60)
            .map(|i| HistoryEntry {
                url: format!("https://a.test/{i}"),
                title: format!("A somewhat long track title number {i}"),
                uploader: "Uploader".to_string(),
                duration_s: 100,
            })
            .collect();
        let pages = render_history(&entries, 900);
        assert!(pages.len() > 1);
        assert!(pages.iter().all(|p| p.len() <= 900));
        // Newest entry listed first
        assert!(pages[0].contains("number 59"));
    }

    #[test]
    fn test_render_history_empty() {
        assert_eq!(render_history(&[], 2000), vec!["No playback history yet"]);
    }
}
