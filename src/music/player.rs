use crate::error::{AppError, AppResult};
use crate::music::history::HistoryItem;
use crate::music::message::{MessageDispatcher, SingleMessage};
use crate::music::queue::PlayQueue;
use crate::music::request::shorten;
use crate::music::track::MediaDownload;
use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use songbird::input::File as AudioFile;
use songbird::tracks::{Track, TrackHandle};
use songbird::Songbird;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Playback state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Joining,
    Playing,
    Paused,
    ShuttingDown,
}

/// What the player is currently streaming
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub url: String,
    pub title: String,
    pub requester_name: String,
    pub duration_s: u32,
}

/// Finished track kept for the history command
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub url: String,
    pub title: String,
    pub uploader: String,
    pub duration_s: u32,
}

/// Fires the player's track-end notify when songbird reports the end
struct TrackEndNotifier {
    notify: Arc<Notify>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        self.notify.notify_one();
        None
    }
}

/// Stable bundle id for a guild's play-order display
pub fn play_order_bundle_id(guild_id: u64) -> String {
    format!("play-order-{guild_id}")
}

/// Per-guild playback state machine.
///
/// Owns the local play queue and the bounded history list; streams files
/// through the guild's voice connection and reports finished tracks to the
/// history queue. Only the orchestrator's command path and this player's
/// own loop mutate it.
pub struct GuildPlayer {
    pub guild_id: u64,
    voice_channel_id: AtomicU64,
    text_channel_id: AtomicU64,
    manager: Arc<Songbird>,
    dispatcher: Arc<MessageDispatcher>,
    state: Mutex<PlayerState>,
    play_queue: PlayQueue<MediaDownload>,
    history: Mutex<VecDeque<HistoryEntry>>,
    history_max: usize,
    now_playing: Mutex<Option<NowPlaying>>,
    current_track: Mutex<Option<TrackHandle>>,
    skip_requested: AtomicBool,
    inactive_since: Mutex<Option<Instant>>,
    empty_timeout: Duration,
    history_tx: UnboundedSender<HistoryItem>,
    page_char_limit: usize,
}

impl GuildPlayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guild_id: u64,
        voice_channel_id: u64,
        text_channel_id: u64,
        manager: Arc<Songbird>,
        dispatcher: Arc<MessageDispatcher>,
        queue_max_size: usize,
        history_max: usize,
        empty_timeout: Duration,
        history_tx: UnboundedSender<HistoryItem>,
        page_char_limit: usize,
    ) -> Self {
        Self {
            guild_id,
            voice_channel_id: AtomicU64::new(voice_channel_id),
            text_channel_id: AtomicU64::new(text_channel_id),
            manager,
            dispatcher,
            state: Mutex::new(PlayerState::Idle),
            play_queue: PlayQueue::new(queue_max_size),
            history: Mutex::new(VecDeque::new()),
            history_max,
            now_playing: Mutex::new(None),
            current_track: Mutex::new(None),
            skip_requested: AtomicBool::new(false),
            inactive_since: Mutex::new(None),
            empty_timeout,
            history_tx,
            page_char_limit,
        }
    }

    pub fn state(&self) -> PlayerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: PlayerState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() == PlayerState::ShuttingDown
    }

    pub fn voice_channel_id(&self) -> u64 {
        self.voice_channel_id.load(Ordering::SeqCst)
    }

    /// Follow the requester into another voice channel
    pub async fn move_voice(&self, voice_channel_id: u64) -> AppResult<()> {
        self.voice_channel_id.store(voice_channel_id, Ordering::SeqCst);
        self.join_voice().await
    }

    pub fn text_channel_id(&self) -> u64 {
        self.text_channel_id.load(Ordering::SeqCst)
    }

    /// Move future status messages to another text channel
    pub fn set_text_channel(&self, channel_id: u64) {
        self.text_channel_id.store(channel_id, Ordering::SeqCst);
    }

    /// Acquire the voice connection. Idle -> Joining -> Playing, back to
    /// Idle when the join fails.
    pub async fn join_voice(&self) -> AppResult<()> {
        self.set_state(PlayerState::Joining);
        match self
            .manager
            .join(
                serenity::GuildId::new(self.guild_id),
                serenity::ChannelId::new(self.voice_channel_id()),
            )
            .await
        {
            Ok(_) => {
                self.set_state(PlayerState::Playing);
                info!(
                    guild_id = self.guild_id,
                    channel_id = self.voice_channel_id(),
                    "Joined voice channel"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(PlayerState::Idle);
                Err(AppError::Voice(format!("Failed to join voice channel: {e}")))
            }
        }
    }

    /// Append a finished download. The caller readied its per-use file.
    pub fn enqueue(&self, download: MediaDownload) -> Result<(), crate::music::queue::QueueError> {
        self.play_queue.put(download)?;
        self.touch_play_order();
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.play_queue.len()
    }

    pub fn queue_is_full(&self) -> bool {
        self.play_queue.is_full()
    }

    pub fn shuffle_queue(&self) {
        self.play_queue.shuffle();
        self.touch_play_order();
    }

    /// Remove the 1-based queue entry, releasing its file
    pub fn remove_queue_item(&self, position: usize) -> Option<String> {
        let mut removed = self.play_queue.remove(position)?;
        let title = removed.metadata.title.clone();
        removed.release();
        self.touch_play_order();
        Some(title)
    }

    /// Move the 1-based queue entry to the front
    pub fn bump_queue_item(&self, position: usize) -> bool {
        let bumped = self.play_queue.bump(position);
        if bumped {
            self.touch_play_order();
        }
        bumped
    }

    /// (url, title) of each queued track, for queue-save
    pub fn queued_tracks(&self) -> Vec<(String, String)> {
        self.play_queue
            .map_items(|d| (d.url.clone(), d.metadata.title.clone()))
    }

    pub fn history_entries(&self) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.now_playing.lock().unwrap().clone()
    }

    /// Ask the dispatcher to re-project the play-order bundle
    pub fn touch_play_order(&self) {
        let bundle_id = play_order_bundle_id(self.guild_id);
        self.dispatcher
            .register(&bundle_id, self.text_channel_id(), true);
        self.dispatcher.touch(&bundle_id);
    }

    pub async fn skip(&self) {
        self.skip_requested.store(true, Ordering::SeqCst);
        let handle = self.current_track.lock().unwrap().clone();
        if let Some(handle) = handle {
            let _ = handle.stop();
        }
    }

    pub async fn pause(&self) {
        let handle = self.current_track.lock().unwrap().clone();
        if let Some(handle) = handle {
            if handle.pause().is_ok() {
                self.set_state(PlayerState::Paused);
            }
        }
    }

    pub async fn resume(&self) {
        let handle = self.current_track.lock().unwrap().clone();
        if let Some(handle) = handle {
            if handle.play().is_ok() {
                self.set_state(PlayerState::Playing);
            }
        }
    }

    /// Track continuous emptiness of the voice channel; true once the
    /// configured timeout has elapsed with nobody in it
    pub fn note_occupancy(&self, occupied: bool) -> bool {
        let mut inactive = self.inactive_since.lock().unwrap();
        if occupied {
            *inactive = None;
            return false;
        }
        match *inactive {
            Some(since) => since.elapsed() > self.empty_timeout,
            None => {
                *inactive = Some(Instant::now());
                false
            }
        }
    }

    /// The player loop: pop, stream, clean up, repeat. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let download = tokio::select! {
                download = self.play_queue.get() => {
                    match download {
                        Some(download) => download,
                        // Queue blocked and drained: the player is done
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            };
            if self.is_shutting_down() || *shutdown.borrow() {
                let mut download = download;
                download.release();
                break;
            }
            self.play_one(download, &mut shutdown).await;
        }
        debug!(guild_id = self.guild_id, "Player loop exited");
    }

    async fn play_one(&self, mut download: MediaDownload, shutdown: &mut watch::Receiver<bool>) {
        // Voice loss is recoverable once; a failed reconnect shuts the
        // player down cleanly
        let call = match self.manager.get(serenity::GuildId::new(self.guild_id)) {
            Some(call) => call,
            None => {
                warn!(guild_id = self.guild_id, "Voice connection lost, reconnecting");
                if self.join_voice().await.is_err() {
                    download.release();
                    self.shutdown("voice connection lost").await;
                    return;
                }
                match self.manager.get(serenity::GuildId::new(self.guild_id)) {
                    Some(call) => call,
                    None => {
                        download.release();
                        self.shutdown("voice connection lost").await;
                        return;
                    }
                }
            }
        };

        self.skip_requested.store(false, Ordering::SeqCst);
        let track_end = Arc::new(Notify::new());
        let input = AudioFile::new(download.playable_path().to_path_buf());
        let handle = {
            let mut call = call.lock().await;
            call.play_only(Track::from(input))
        };
        let _ = handle.add_event(
            Event::Track(TrackEvent::End),
            TrackEndNotifier {
                notify: track_end.clone(),
            },
        );
        let _ = handle.add_event(
            Event::Track(TrackEvent::Error),
            TrackEndNotifier {
                notify: track_end.clone(),
            },
        );
        *self.current_track.lock().unwrap() = Some(handle);
        *self.now_playing.lock().unwrap() = Some(NowPlaying {
            url: download.url.clone(),
            title: download.metadata.title.clone(),
            requester_name: download.request.requester_name.clone(),
            duration_s: download.metadata.duration_s,
        });
        self.set_state(PlayerState::Playing);
        info!(
            guild_id = self.guild_id,
            url = %download.url,
            requester = %download.request.requester_id,
            "Now playing"
        );
        self.touch_play_order();

        tokio::select! {
            _ = track_end.notified() => {}
            _ = shutdown.changed() => {
                let handle = self.current_track.lock().unwrap().clone();
                if let Some(handle) = handle {
                    let _ = handle.stop();
                }
            }
        }

        *self.current_track.lock().unwrap() = None;
        *self.now_playing.lock().unwrap() = None;
        download.release();

        let skipped = self.skip_requested.swap(false, Ordering::SeqCst);
        if !skipped {
            self.push_history(&download);
            if !download.request.from_history {
                let _ = self.history_tx.send(HistoryItem {
                    guild_id: self.guild_id,
                    url: download.url.clone(),
                    title: download.metadata.title.clone(),
                    duration_s: download.metadata.duration_s,
                    cache_hit: download.cache_hit,
                });
            }
        }
        self.touch_play_order();
    }

    fn push_history(&self, download: &MediaDownload) {
        let mut history = self.history.lock().unwrap();
        if history.len() >= self.history_max {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            url: download.url.clone(),
            title: download.metadata.title.clone(),
            uploader: download.metadata.uploader.clone(),
            duration_s: download.metadata.duration_s,
        });
    }

    /// Stop streaming, drain the queue and per-use files, close the voice
    /// handle and announce the disconnect.
    pub async fn shutdown(&self, reason: &str) {
        if self.is_shutting_down() {
            return;
        }
        self.set_state(PlayerState::ShuttingDown);
        info!(guild_id = self.guild_id, reason, "Shutting down player");

        self.play_queue.block();
        for mut download in self.play_queue.clear() {
            download.release();
        }
        let handle = self.current_track.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.stop();
        }

        if let Err(e) = self
            .manager
            .remove(serenity::GuildId::new(self.guild_id))
            .await
        {
            debug!(guild_id = self.guild_id, error = %e, "Voice handle already gone");
        }

        self.dispatcher.retire(&play_order_bundle_id(self.guild_id));
        self.dispatcher.send_single(SingleMessage {
            channel_id: self.text_channel_id(),
            content: "Disconnected from voice channel".to_string(),
            delete_after: Some(Duration::from_secs(300)),
        });
    }

    /// Render the "Now playing" banner plus the paginated upcoming table
    pub fn render_play_order(&self) -> Vec<String> {
        let mut pages = Vec::new();
        let now_playing = self.now_playing();
        let mut banner = String::new();
        if let Some(np) = &now_playing {
            banner = format!("Now playing {} requested by {}", np.url, np.requester_name);
        }

        let rows: Vec<(String, String)> = self
            .play_queue
            .map_items(|d| (d.metadata.title.clone(), d.metadata.uploader.clone()));
        if rows.is_empty() {
            return if banner.is_empty() {
                Vec::new()
            } else {
                vec![banner]
            };
        }

        let mut wait = now_playing.map(|np| np.duration_s).unwrap_or(0);
        let durations: Vec<u32> = self.play_queue.map_items(|d| d.metadata.duration_s);
        let mut lines = vec![format!(
            "{:<3} || {:<9} || {:<48} || {:<32}",
            "Pos", "Wait Time", "Title", "Uploader"
        )];
        for (index, (title, uploader)) in rows.iter().enumerate() {
            lines.push(format!(
                "{:<3} || {:<9} || {:<48} || {:<32}",
                index + 1,
                format_wait(wait),
                shorten(title, 48),
                shorten(uploader, 32),
            ));
            wait += durations.get(index).copied().unwrap_or(0);
        }

        // First page carries the banner; each page is a single code block
        // under the message character budget
        let overhead = 8; // the ``` fences and newlines
        let mut current: Vec<String> = Vec::new();
        let mut current_len = if banner.is_empty() { 0 } else { banner.len() + 1 };
        for line in lines {
            if current_len + line.len() + overhead > self.page_char_limit && !current.is_empty() {
                pages.push(Self::wrap_page(&banner, &current, pages.is_empty()));
                current = Vec::new();
                current_len = 0;
            }
            current_len += line.len() + 1;
            current.push(line);
        }
        if !current.is_empty() {
            pages.push(Self::wrap_page(&banner, &current, pages.is_empty()));
        }
        pages
    }

    fn wrap_page(banner: &str, lines: &[String], first: bool) -> String {
        let table = format!("```{}```", lines.join("\n"));
        if first && !banner.is_empty() {
            format!("{banner}\n{table}")
        } else {
            table
        }
    }
}

/// Queue wait formatted like 3:05 or 1:02:45
fn format_wait(total_s: u32) -> String {
    let hours = total_s / 3600;
    let minutes = (total_s % 3600) / 60;
    let seconds = total_s % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_wait() {
        assert_eq!(format_wait(0), "0:00");
        assert_eq!(format_wait(185), "3:05");
        assert_eq!(format_wait(3765), "1:02:45");
    }

    #[test]
    fn test_play_order_bundle_id() {
        assert_eq!(play_order_bundle_id(42), "play-order-42");
    }

    #[test]
    fn test_occupancy_timeout_tracking() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::new(NullMessenger),
            10,
        ));
        let manager = Songbird::serenity();
        let player = GuildPlayer::new(
            1,
            2,
            3,
            manager,
            dispatcher,
            8,
            8,
            Duration::from_millis(30),
            tx,
            2000,
        );

        // Occupied channel never times out
        assert!(!player.note_occupancy(true));
        // First empty observation arms the timer
        assert!(!player.note_occupancy(false));
        assert!(!player.note_occupancy(false));
        std::thread::sleep(Duration::from_millis(50));
        assert!(player.note_occupancy(false));
        // Someone joining resets it
        assert!(!player.note_occupancy(true));
        assert!(!player.note_occupancy(false));
    }

    struct NullMessenger;

    #[async_trait]
    impl crate::music::message::Messenger for NullMessenger {
        async fn send(
            &self,
            _channel_id: u64,
            _content: &str,
            _delete_after: Option<Duration>,
        ) -> Result<u64, crate::music::message::MessageError> {
            Ok(1)
        }
        async fn edit(
            &self,
            _channel_id: u64,
            _message_id: u64,
            _content: &str,
        ) -> Result<(), crate::music::message::MessageError> {
            Ok(())
        }
        async fn delete(
            &self,
            _channel_id: u64,
            _message_id: u64,
        ) -> Result<(), crate::music::message::MessageError> {
            Ok(())
        }
        async fn fetch_recent(
            &self,
            _channel_id: u64,
            _limit: usize,
        ) -> Result<Vec<u64>, crate::music::message::MessageError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_state_transitions() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Arc::new(MessageDispatcher::new(Arc::new(NullMessenger), 10));
        let player = GuildPlayer::new(
            1,
            2,
            3,
            Songbird::serenity(),
            dispatcher,
            8,
            8,
            Duration::from_secs(60),
            tx,
            2000,
        );
        assert_eq!(player.state(), PlayerState::Idle);
        player.set_state(PlayerState::Playing);
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(!player.is_shutting_down());
        player.set_state(PlayerState::ShuttingDown);
        assert!(player.is_shutting_down());
    }

    #[test]
    fn test_text_channel_move() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Arc::new(MessageDispatcher::new(Arc::new(NullMessenger), 10));
        let player = GuildPlayer::new(
            1,
            2,
            3,
            Songbird::serenity(),
            dispatcher,
            8,
            8,
            Duration::from_secs(60),
            tx,
            2000,
        );
        assert_eq!(player.text_channel_id(), 3);
        player.set_text_channel(99);
        assert_eq!(player.text_channel_id(), 99);
    }
}
