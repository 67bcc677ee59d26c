//! End-to-end tests of the request pipeline and its coordination
//! machinery, driven without a live Discord connection: an in-memory
//! messenger stands in for the chat platform and a stub extractor for
//! yt-dlp.

use async_trait::async_trait;
use cadence::config::*;
use cadence::db::init_db;
use cadence::music::bundle::ProgressBundle;
use cadence::music::message::{MessageDispatcher, MessageError, Messenger};
use cadence::music::request::{LifecycleStage, MediaRequest, SearchType};
use cadence::music::search::{Requester, SearchResolver};
use cadence::music::{MusicOrchestrator, PlaylistSelector};
use songbird::Songbird;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory messenger recording each channel's messages in order
struct MemoryMessenger {
    next_id: AtomicU64,
    channels: Mutex<HashMap<u64, Vec<(u64, String)>>>,
}

impl MemoryMessenger {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn contents(&self, channel_id: u64) -> Vec<String> {
        self.channels
            .lock()
            .unwrap()
            .get(&channel_id)
            .map(|m| m.iter().map(|(_, c)| c.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn send(
        &self,
        channel_id: u64,
        content: &str,
        _delete_after: Option<Duration>,
    ) -> Result<u64, MessageError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.channels
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .push((id, content.to_string()));
        Ok(id)
    }

    async fn edit(
        &self,
        channel_id: u64,
        message_id: u64,
        content: &str,
    ) -> Result<(), MessageError> {
        let mut channels = self.channels.lock().unwrap();
        let messages = channels.entry(channel_id).or_default();
        match messages.iter_mut().find(|(id, _)| *id == message_id) {
            Some(slot) => {
                slot.1 = content.to_string();
                Ok(())
            }
            None => Err(MessageError::NotFound),
        }
    }

    async fn delete(&self, channel_id: u64, message_id: u64) -> Result<(), MessageError> {
        let mut channels = self.channels.lock().unwrap();
        let messages = channels.entry(channel_id).or_default();
        let before = messages.len();
        messages.retain(|(id, _)| *id != message_id);
        if messages.len() == before {
            return Err(MessageError::NotFound);
        }
        Ok(())
    }

    async fn fetch_recent(&self, channel_id: u64, limit: usize) -> Result<Vec<u64>, MessageError> {
        let channels = self.channels.lock().unwrap();
        Ok(channels
            .get(&channel_id)
            .map(|m| m.iter().rev().take(limit).map(|(id, _)| *id).collect())
            .unwrap_or_default())
    }
}

#[cfg(unix)]
fn write_fake_extractor(dir: &Path, scratch: &Path, marker: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let bin = dir.join("fake-ytdlp");
    let script = format!(
        "#!/bin/sh\ntouch {marker}\ntouch {scratch}/track1.mp3\necho '{{\"id\":\"track1\",\"title\":\"Test Track\",\"uploader\":\"Test Uploader\",\"duration\":120,\"webpage_url\":\"https://example.com/watch\"}}'\n",
        marker = marker.display(),
        scratch = scratch.display(),
    );
    std::fs::write(&bin, script).unwrap();
    let mut perms = std::fs::metadata(&bin).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&bin, perms).unwrap();
    bin
}

fn test_config(work_dir: PathBuf, ytdlp_bin: String) -> &'static AppConfig {
    Box::leak(Box::new(AppConfig {
        discord: DiscordConfig {
            token: "test-token".to_string(),
            prefix: "!c ".to_string(),
        },
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        },
        work_dir,
        queues: QueueConfig::default(),
        backoff: BackoffConfig {
            // No artificial waits in tests
            base_wait_s: 0,
            max_size: 100,
            max_age_s: 300,
        },
        cache: CacheConfig::default(),
        downloader: DownloaderConfig {
            ytdlp_bin,
            max_duration_s: 0,
            enable_post_processing: false,
            download_retries: 2,
            timeout_s: 10,
            extra_args: Vec::new(),
        },
        player: PlayerConfig::default(),
        messages: MessagesConfig::default(),
        history: HistoryConfig::default(),
        spotify: None,
        youtube: None,
        storage: None,
    }))
}

async fn test_orchestrator(
    config: &'static AppConfig,
) -> (Arc<MusicOrchestrator>, Arc<MemoryMessenger>) {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&config.database.url)
        .await
        .unwrap();
    init_db(&pool).await.unwrap();

    let messenger = Arc::new(MemoryMessenger::new());
    let dispatcher = Arc::new(MessageDispatcher::new(
        messenger.clone(),
        config.messages.sticky_recent_window,
    ));
    let orchestrator = Arc::new(MusicOrchestrator::new(
        config,
        pool,
        Songbird::serenity(),
        None,
        dispatcher,
        SearchResolver::new(None, None),
    ));
    (orchestrator, messenger)
}

#[cfg(unix)]
#[tokio::test]
async fn test_playlist_item_add_flows_through_download_pipeline() {
    let tmp = tempfile::tempdir().unwrap();
    let marker = tmp.path().join("extractor-invoked");
    let work_dir = tmp.path().join("work");
    std::fs::create_dir_all(work_dir.join("tmp")).unwrap();
    let bin = write_fake_extractor(tmp.path(), &work_dir.join("tmp"), &marker);
    let config = test_config(work_dir, bin.to_string_lossy().to_string());

    let (orchestrator, _messenger) = test_orchestrator(config).await;
    orchestrator.start();

    orchestrator.playlist_create(1, "favorites").await.unwrap();
    let requester = Requester {
        guild_id: 1,
        channel_id: 10,
        name: "tester".to_string(),
        id: 99,
    };
    let reply = orchestrator
        .playlist_item_add(requester, PlaylistSelector::Index(1), "https://example.com/watch")
        .await
        .unwrap();
    assert!(reply.contains("Queued 1 item(s)"));

    // The download loop picks it up, the fake extractor produces the file,
    // the cache adopts it, and the item lands in the playlist
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let playlists = orchestrator.playlist_list(1).await.unwrap();
        if playlists.contains("(1 items)") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "playlist item never arrived"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(marker.exists(), "extractor should have been invoked");
    assert!(orchestrator.heartbeat_age("download").is_some());
    orchestrator.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_known_terminal_failure_short_circuits_downloader() {
    let tmp = tempfile::tempdir().unwrap();
    let marker = tmp.path().join("extractor-invoked");
    let work_dir = tmp.path().join("work");
    std::fs::create_dir_all(work_dir.join("tmp")).unwrap();
    let bin = write_fake_extractor(tmp.path(), &work_dir.join("tmp"), &marker);
    let config = test_config(work_dir, bin.to_string_lossy().to_string());

    let (orchestrator, _messenger) = test_orchestrator(config).await;

    // Poison the URL with a terminal sentinel before starting the loops
    let cache = orchestrator.cache().unwrap().clone();
    cache
        .record_terminal_failure(
            "https://example.com/watch",
            cadence::db::TerminalFailureKind::AgeRestricted,
        )
        .await
        .unwrap();

    orchestrator.start();
    orchestrator.playlist_create(1, "favorites").await.unwrap();
    let requester = Requester {
        guild_id: 1,
        channel_id: 10,
        name: "tester".to_string(),
        id: 99,
    };
    orchestrator
        .playlist_item_add(requester, PlaylistSelector::Index(1), "https://example.com/watch")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !marker.exists(),
        "downloader must not run for a known-bad URL"
    );
    let playlists = orchestrator.playlist_list(1).await.unwrap();
    assert!(playlists.contains("(0 items)"));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_bundle_dispatch_projects_minimal_edits() {
    // Simulate the play-command display path: bundle -> dispatcher ->
    // chat messages, checking content convergence at each stage
    let messenger = Arc::new(MemoryMessenger::new());
    let dispatcher = Arc::new(MessageDispatcher::new(messenger.clone(), 10));

    let mut bundle = ProgressBundle::new(1, 55, 2000);
    bundle.set_initial_input("some album");
    let mut ids = Vec::new();
    for i in 0..3 {
        let request = MediaRequest::new(1, 55, "tester", 9, format!("track {i}"), SearchType::FreeText);
        ids.push(request.id);
        bundle.add_request(&request, LifecycleStage::Queued);
    }
    bundle.freeze();
    let bundle = Arc::new(Mutex::new(bundle));

    dispatcher.register("bundle", 55, false);
    dispatcher.touch("bundle");
    let render = {
        let bundle = bundle.clone();
        move |_: &str| Some(bundle.lock().unwrap().render())
    };
    dispatcher.tick(&render).await;

    let first = messenger.contents(55);
    assert_eq!(first.len(), 1);
    assert!(first[0].contains("0/3 media requests processed"));

    // Progress one row to completion; the same message is edited in place
    bundle
        .lock()
        .unwrap()
        .update(ids[0], LifecycleStage::Completed, None);
    dispatcher.touch("bundle");
    dispatcher.tick(&render).await;
    let second = messenger.contents(55);
    assert_eq!(second.len(), 1);
    assert!(second[0].contains("1/3 media requests processed"));

    // Finish everything; banner flips to the completed form
    bundle
        .lock()
        .unwrap()
        .update(ids[1], LifecycleStage::Completed, None);
    bundle
        .lock()
        .unwrap()
        .update(ids[2], LifecycleStage::Failed, Some("no results".to_string()));
    dispatcher.touch("bundle");
    dispatcher.tick(&render).await;
    let last = messenger.contents(55);
    assert!(last[0].contains("Completed processing of \"some album\""));
    assert!(last[0].contains("2/3 media requests processed, 1 failed"));
    assert!(bundle.lock().unwrap().is_finished());
}
