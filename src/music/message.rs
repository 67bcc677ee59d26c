use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poise::serenity_prelude as serenity;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Chat-platform failure classes the dispatcher cares about
#[derive(Debug)]
pub enum MessageError {
    /// Message already gone; the handle is forgotten and work continues
    NotFound,
    /// Transient failure; the bundle stays pending for the next tick
    Other(String),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "message not found"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for MessageError {}

/// The five message primitives the core needs from the chat platform
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a message, returning its handle. When delete_after is given the
    /// platform removes the message after that delay.
    async fn send(
        &self,
        channel_id: u64,
        content: &str,
        delete_after: Option<Duration>,
    ) -> Result<u64, MessageError>;

    async fn edit(&self, channel_id: u64, message_id: u64, content: &str)
        -> Result<(), MessageError>;

    async fn delete(&self, channel_id: u64, message_id: u64) -> Result<(), MessageError>;

    /// Recent message ids in the channel, newest first
    async fn fetch_recent(&self, channel_id: u64, limit: usize) -> Result<Vec<u64>, MessageError>;
}

/// Messenger backed by the Discord HTTP API
pub struct DiscordMessenger {
    http: Arc<serenity::Http>,
}

impl DiscordMessenger {
    pub fn new(http: Arc<serenity::Http>) -> Self {
        Self { http }
    }

    fn classify(error: serenity::Error) -> MessageError {
        if let serenity::Error::Http(serenity::HttpError::UnsuccessfulRequest(ref resp)) = error {
            if resp.status_code == serenity::StatusCode::NOT_FOUND {
                return MessageError::NotFound;
            }
        }
        MessageError::Other(error.to_string())
    }
}

#[async_trait]
impl Messenger for DiscordMessenger {
    async fn send(
        &self,
        channel_id: u64,
        content: &str,
        delete_after: Option<Duration>,
    ) -> Result<u64, MessageError> {
        let channel = serenity::ChannelId::new(channel_id);
        let message = channel
            .say(&self.http, content)
            .await
            .map_err(Self::classify)?;
        if let Some(delay) = delete_after {
            let http = self.http.clone();
            let message_id = message.id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = channel.delete_message(&http, message_id).await;
            });
        }
        Ok(message.id.get())
    }

    async fn edit(
        &self,
        channel_id: u64,
        message_id: u64,
        content: &str,
    ) -> Result<(), MessageError> {
        serenity::ChannelId::new(channel_id)
            .edit_message(
                &self.http,
                serenity::MessageId::new(message_id),
                serenity::EditMessage::new().content(content),
            )
            .await
            .map(|_| ())
            .map_err(Self::classify)
    }

    async fn delete(&self, channel_id: u64, message_id: u64) -> Result<(), MessageError> {
        serenity::ChannelId::new(channel_id)
            .delete_message(&self.http, serenity::MessageId::new(message_id))
            .await
            .map_err(Self::classify)
    }

    async fn fetch_recent(&self, channel_id: u64, limit: usize) -> Result<Vec<u64>, MessageError> {
        let messages = serenity::ChannelId::new(channel_id)
            .messages(
                &self.http,
                serenity::GetMessages::new().limit(limit.min(100) as u8),
            )
            .await
            .map_err(Self::classify)?;
        Ok(messages.iter().map(|m| m.id.get()).collect())
    }
}

/// One chat message managed by a mutable bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub message_id: u64,
    pub content: String,
}

/// Planned chat-API operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOp {
    Edit { message_id: u64, content: String },
    Delete { message_id: u64 },
    Send { content: String },
}

/// Compute the minimal edit script projecting `handles` onto `new_content`.
///
/// Two-pointer pass over existing messages and new pages: identical content
/// is kept untouched, surplus messages are deleted in place (preserving the
/// order of the survivors), everything else is edited, and missing pages are
/// appended as sends at the tail. Matching by content means a shrink prefers
/// reusing messages that already show the right page.
pub fn plan_ops(handles: &[MessageHandle], new_content: &[String]) -> Vec<MessageOp> {
    let mut ops = Vec::new();
    let mut i = 0; // existing
    let mut j = 0; // new
    while i < handles.len() && j < new_content.len() {
        let remaining_existing = handles.len() - i;
        let remaining_new = new_content.len() - j;
        if handles[i].content == new_content[j] {
            i += 1;
            j += 1;
        } else if remaining_existing > remaining_new {
            ops.push(MessageOp::Delete {
                message_id: handles[i].message_id,
            });
            i += 1;
        } else {
            ops.push(MessageOp::Edit {
                message_id: handles[i].message_id,
                content: new_content[j].clone(),
            });
            i += 1;
            j += 1;
        }
    }
    while i < handles.len() {
        ops.push(MessageOp::Delete {
            message_id: handles[i].message_id,
        });
        i += 1;
    }
    while j < new_content.len() {
        ops.push(MessageOp::Send {
            content: new_content[j].clone(),
        });
        j += 1;
    }
    ops
}

/// Registered mutable message bundle
struct MutableBundle {
    channel_id: u64,
    handles: Vec<MessageHandle>,
    sticky: bool,
    last_dispatched_at: DateTime<Utc>,
    /// Delete everything and drop the registration at the next tick
    retired: bool,
}

impl MutableBundle {
    /// Sticky bundles must be the newest messages in their channel; a
    /// foreign message below them forces a delete-and-resend.
    fn overtaken(&self, recent_newest_first: &[u64]) -> bool {
        if !self.sticky || self.handles.is_empty() {
            return false;
        }
        if recent_newest_first.len() < self.handles.len() {
            return true;
        }
        self.handles
            .iter()
            .rev()
            .zip(recent_newest_first.iter())
            .any(|(handle, recent)| handle.message_id != *recent)
    }
}

/// Fire-and-forget notification
#[derive(Debug, Clone)]
pub struct SingleMessage {
    pub channel_id: u64,
    pub content: String,
    pub delete_after: Option<Duration>,
}

/// Outcome of one dispatcher tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing pending
    Idle,
    /// Work was performed
    Dispatched,
    /// Transient platform error; retry next tick
    Backpressure,
}

/// Diff-based projector of mutable bundles onto chat messages.
///
/// Owns every message handle it creates. Other components signal work with
/// `touch`; the dispatch loop calls `tick` with a renderer that maps bundle
/// ids to their current page strings.
pub struct MessageDispatcher {
    messenger: Arc<dyn Messenger>,
    state: Mutex<DispatcherState>,
    sticky_window: usize,
}

struct DispatcherState {
    bundles: HashMap<String, MutableBundle>,
    pending: HashMap<String, DateTime<Utc>>,
    single_queue: VecDeque<SingleMessage>,
    /// Messages left behind by channel moves, deleted at the next tick
    orphans: Vec<(u64, u64)>,
}

impl MessageDispatcher {
    pub fn new(messenger: Arc<dyn Messenger>, sticky_window: usize) -> Self {
        Self {
            messenger,
            state: Mutex::new(DispatcherState {
                bundles: HashMap::new(),
                pending: HashMap::new(),
                single_queue: VecDeque::new(),
                orphans: Vec::new(),
            }),
            sticky_window,
        }
    }

    /// Register a mutable bundle. Idempotent; re-registering keeps existing
    /// message handles.
    pub fn register(&self, bundle_id: &str, channel_id: u64, sticky: bool) {
        let mut state = self.state.lock().unwrap();
        state
            .bundles
            .entry(bundle_id.to_string())
            .or_insert_with(|| MutableBundle {
                channel_id,
                handles: Vec::new(),
                sticky,
                last_dispatched_at: DateTime::<Utc>::MIN_UTC,
                retired: false,
            });
    }

    /// Mark a bundle as having pending work
    pub fn touch(&self, bundle_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.bundles.contains_key(bundle_id) {
            state
                .pending
                .entry(bundle_id.to_string())
                .or_insert_with(Utc::now);
        }
    }

    /// Retire a bundle: its messages are deleted at the next tick and the
    /// registration dropped
    pub fn retire(&self, bundle_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(bundle) = state.bundles.get_mut(bundle_id) {
            bundle.retired = true;
        }
        state
            .pending
            .entry(bundle_id.to_string())
            .or_insert_with(Utc::now);
    }

    /// Move a bundle to a new channel: old messages are deleted and content
    /// is resent there on the next tick
    pub fn move_channel(&self, bundle_id: &str, new_channel_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(bundle) = state.bundles.get_mut(bundle_id) {
            let old_channel = bundle.channel_id;
            let orphaned: Vec<(u64, u64)> = bundle
                .handles
                .drain(..)
                .map(|h| (old_channel, h.message_id))
                .collect();
            bundle.channel_id = new_channel_id;
            state.orphans.extend(orphaned);
        }
        state
            .pending
            .entry(bundle_id.to_string())
            .or_insert_with(Utc::now);
    }

    /// Enqueue a fire-and-forget notification
    pub fn send_single(&self, message: SingleMessage) {
        self.state.lock().unwrap().single_queue.push_back(message);
    }

    pub fn has_bundle(&self, bundle_id: &str) -> bool {
        self.state.lock().unwrap().bundles.contains_key(bundle_id)
    }

    /// Pick the pending bundle whose last dispatch is oldest
    fn next_pending(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .pending
            .keys()
            .filter_map(|id| {
                state
                    .bundles
                    .get(id)
                    .map(|b| (id.clone(), b.last_dispatched_at))
            })
            .min_by_key(|(_, at)| *at)
            .map(|(id, _)| id)
    }

    /// One iteration of the dispatch loop.
    ///
    /// The renderer maps a bundle id to its current pages; None retires the
    /// bundle.
    pub async fn tick<F>(&self, render: F) -> TickOutcome
    where
        F: Fn(&str) -> Option<Vec<String>>,
    {
        let orphans: Vec<(u64, u64)> = std::mem::take(&mut self.state.lock().unwrap().orphans);
        for (channel_id, message_id) in orphans {
            if let Err(MessageError::Other(e)) = self.messenger.delete(channel_id, message_id).await
            {
                warn!(channel_id, message_id, error = %e, "Failed deleting orphaned message");
            }
        }

        if let Some(bundle_id) = self.next_pending() {
            return self.dispatch_bundle(&bundle_id, render).await;
        }

        let single = self.state.lock().unwrap().single_queue.pop_front();
        if let Some(message) = single {
            match self
                .messenger
                .send(message.channel_id, &message.content, message.delete_after)
                .await
            {
                Ok(_) => return TickOutcome::Dispatched,
                Err(MessageError::NotFound) => return TickOutcome::Dispatched,
                Err(MessageError::Other(e)) => {
                    warn!(error = %e, "Failed to send notification, requeueing");
                    self.state
                        .lock()
                        .unwrap()
                        .single_queue
                        .push_front(message);
                    return TickOutcome::Backpressure;
                }
            }
        }
        TickOutcome::Idle
    }

    async fn dispatch_bundle<F>(&self, bundle_id: &str, render: F) -> TickOutcome
    where
        F: Fn(&str) -> Option<Vec<String>>,
    {
        // Snapshot what we need without holding the lock across awaits
        let (channel_id, handles, sticky, retired) = {
            let mut state = self.state.lock().unwrap();
            state.pending.remove(bundle_id);
            let Some(bundle) = state.bundles.get_mut(bundle_id) else {
                return TickOutcome::Dispatched;
            };
            bundle.last_dispatched_at = Utc::now();
            (
                bundle.channel_id,
                bundle.handles.clone(),
                bundle.sticky,
                bundle.retired,
            )
        };

        let content = if retired { None } else { render(bundle_id) };
        let Some(mut content) = content else {
            // Retired or unknown to the renderer: delete everything
            for handle in &handles {
                if let Err(MessageError::Other(e)) =
                    self.messenger.delete(channel_id, handle.message_id).await
                {
                    warn!(bundle_id, error = %e, "Failed deleting retired bundle message");
                }
            }
            self.state.lock().unwrap().bundles.remove(bundle_id);
            return TickOutcome::Dispatched;
        };
        // The platform rejects empty messages, so fully-blank pages project
        // to deletions instead
        content.retain(|page| !page.is_empty());
        if content.is_empty() && handles.is_empty() {
            return TickOutcome::Dispatched;
        }

        let mut working = handles;

        // Sticky bundles that have been overtaken are cleared and resent
        if sticky && !working.is_empty() {
            let window = self.sticky_window.max(working.len());
            match self.messenger.fetch_recent(channel_id, window).await {
                Ok(recent) => {
                    let bundle_view = MutableBundle {
                        channel_id,
                        handles: working.clone(),
                        sticky,
                        last_dispatched_at: Utc::now(),
                        retired: false,
                    };
                    if bundle_view.overtaken(&recent) {
                        debug!(bundle_id, "Sticky bundle overtaken, resending");
                        for handle in working.drain(..) {
                            let _ = self.messenger.delete(channel_id, handle.message_id).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(bundle_id, error = %e, "Failed sticky check");
                }
            }
        }

        let ops = plan_ops(&working, &content);
        for op in ops {
            match op {
                MessageOp::Edit {
                    message_id,
                    content,
                } => match self.messenger.edit(channel_id, message_id, &content).await {
                    Ok(()) => {
                        if let Some(handle) =
                            working.iter_mut().find(|h| h.message_id == message_id)
                        {
                            handle.content = content;
                        }
                    }
                    Err(MessageError::NotFound) => {
                        working.retain(|h| h.message_id != message_id);
                    }
                    Err(MessageError::Other(e)) => {
                        warn!(bundle_id, error = %e, "Edit failed, retrying next tick");
                        self.finish_dispatch(bundle_id, working, true);
                        return TickOutcome::Backpressure;
                    }
                },
                MessageOp::Delete { message_id } => {
                    match self.messenger.delete(channel_id, message_id).await {
                        Ok(()) | Err(MessageError::NotFound) => {
                            working.retain(|h| h.message_id != message_id);
                        }
                        Err(MessageError::Other(e)) => {
                            warn!(bundle_id, error = %e, "Delete failed, retrying next tick");
                            self.finish_dispatch(bundle_id, working, true);
                            return TickOutcome::Backpressure;
                        }
                    }
                }
                MessageOp::Send { content } => {
                    match self.messenger.send(channel_id, &content, None).await {
                        Ok(message_id) => {
                            working.push(MessageHandle {
                                message_id,
                                content,
                            });
                        }
                        Err(MessageError::NotFound) => {}
                        Err(MessageError::Other(e)) => {
                            warn!(bundle_id, error = %e, "Send failed, retrying next tick");
                            self.finish_dispatch(bundle_id, working, true);
                            return TickOutcome::Backpressure;
                        }
                    }
                }
            }
        }

        self.finish_dispatch(bundle_id, working, false);
        TickOutcome::Dispatched
    }

    fn finish_dispatch(&self, bundle_id: &str, handles: Vec<MessageHandle>, still_pending: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(bundle) = state.bundles.get_mut(bundle_id) {
            bundle.handles = handles;
        }
        if still_pending {
            state
                .pending
                .entry(bundle_id.to_string())
                .or_insert_with(Utc::now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory messenger recording a channel's message list in order
    struct MemoryMessenger {
        next_id: AtomicU64,
        channels: Mutex<HashMap<u64, Vec<(u64, String)>>>,
        calls: Mutex<Vec<String>>,
        fail_transient: Mutex<bool>,
    }

    impl MemoryMessenger {
        fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                channels: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                fail_transient: Mutex::new(false),
            }
        }

        fn contents(&self, channel_id: u64) -> Vec<String> {
            self.channels
                .lock()
                .unwrap()
                .get(&channel_id)
                .map(|msgs| msgs.iter().map(|(_, c)| c.clone()).collect())
                .unwrap_or_default()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn check_failure(&self) -> Result<(), MessageError> {
            if *self.fail_transient.lock().unwrap() {
                return Err(MessageError::Other("server error".to_string()));
            }
            Ok(())
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
            self.check_failure()?;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.channels
                .lock()
                .unwrap()
                .entry(channel_id)
                .or_default()
                .push((id, content.to_string()));
            self.calls.lock().unwrap().push(format!("send:{id}"));
            Ok(id)
        }

        async fn edit(
            &self,
            channel_id: u64,
            message_id: u64,
            content: &str,
        ) -> Result<(), MessageError> {
            self.check_failure()?;
            let mut channels = self.channels.lock().unwrap();
            let messages = channels.entry(channel_id).or_default();
            let Some(slot) = messages.iter_mut().find(|(id, _)| *id == message_id) else {
                return Err(MessageError::NotFound);
            };
            slot.1 = content.to_string();
            self.calls.lock().unwrap().push(format!("edit:{message_id}"));
            Ok(())
        }

        async fn delete(&self, channel_id: u64, message_id: u64) -> Result<(), MessageError> {
            self.check_failure()?;
            let mut channels = self.channels.lock().unwrap();
            let messages = channels.entry(channel_id).or_default();
            let before = messages.len();
            messages.retain(|(id, _)| *id != message_id);
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete:{message_id}"));
            if messages.len() == before {
                return Err(MessageError::NotFound);
            }
            Ok(())
        }

        async fn fetch_recent(
            &self,
            channel_id: u64,
            limit: usize,
        ) -> Result<Vec<u64>, MessageError> {
            self.check_failure()?;
            let channels = self.channels.lock().unwrap();
            let messages = channels.get(&channel_id).cloned().unwrap_or_default();
            Ok(messages
                .iter()
                .rev()
                .take(limit)
                .map(|(id, _)| *id)
                .collect())
        }
    }

    fn pages(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_equal_content_is_noop() {
        let handles = vec![
            MessageHandle {
                message_id: 1,
                content: "a".to_string(),
            },
            MessageHandle {
                message_id: 2,
                content: "b".to_string(),
            },
        ];
        assert!(plan_ops(&handles, &pages(&["a", "b"])).is_empty());
    }

    #[test]
    fn test_plan_edits_changed_pages_only() {
        let handles = vec![
            MessageHandle {
                message_id: 1,
                content: "a".to_string(),
            },
            MessageHandle {
                message_id: 2,
                content: "b".to_string(),
            },
        ];
        let ops = plan_ops(&handles, &pages(&["a", "c"]));
        assert_eq!(
            ops,
            vec![MessageOp::Edit {
                message_id: 2,
                content: "c".to_string()
            }]
        );
    }

    #[test]
    fn test_plan_growth_appends_sends() {
        let handles = vec![MessageHandle {
            message_id: 1,
            content: "a".to_string(),
        }];
        let ops = plan_ops(&handles, &pages(&["a", "b"]));
        assert_eq!(
            ops,
            vec![MessageOp::Send {
                content: "b".to_string()
            }]
        );
    }

    #[test]
    fn test_plan_shrink_deletes_middle_by_content_match() {
        // [A, B, C, D] -> [A, B, D] deletes only C
        let handles: Vec<MessageHandle> = ["A", "B", "C", "D"]
            .iter()
            .enumerate()
            .map(|(i, c)| MessageHandle {
                message_id: i as u64 + 1,
                content: c.to_string(),
            })
            .collect();
        let ops = plan_ops(&handles, &pages(&["A", "B", "D"]));
        assert_eq!(ops, vec![MessageOp::Delete { message_id: 3 }]);
    }

    #[test]
    fn test_plan_empty_existing_sends_all() {
        let ops = plan_ops(&[], &pages(&["x", "y"]));
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], MessageOp::Send { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_sends_then_edits() {
        let messenger = Arc::new(MemoryMessenger::new());
        let dispatcher = MessageDispatcher::new(messenger.clone(), 10);
        dispatcher.register("b1", 100, false);

        let content = Mutex::new(pages(&["first"]));
        dispatcher.touch("b1");
        let outcome = dispatcher
            .tick(|_| Some(content.lock().unwrap().clone()))
            .await;
        assert_eq!(outcome, TickOutcome::Dispatched);
        assert_eq!(messenger.contents(100), vec!["first"]);

        *content.lock().unwrap() = pages(&["second"]);
        dispatcher.touch("b1");
        dispatcher
            .tick(|_| Some(content.lock().unwrap().clone()))
            .await;
        assert_eq!(messenger.contents(100), vec!["second"]);
    }

    #[tokio::test]
    async fn test_unchanged_render_issues_zero_ops() {
        let messenger = Arc::new(MemoryMessenger::new());
        let dispatcher = MessageDispatcher::new(messenger.clone(), 10);
        dispatcher.register("b1", 100, false);

        dispatcher.touch("b1");
        dispatcher.tick(|_| Some(pages(&["same"]))).await;
        let calls_after_first = messenger.call_count();

        dispatcher.touch("b1");
        dispatcher.tick(|_| Some(pages(&["same"]))).await;
        assert_eq!(messenger.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn test_retire_deletes_messages() {
        let messenger = Arc::new(MemoryMessenger::new());
        let dispatcher = MessageDispatcher::new(messenger.clone(), 10);
        dispatcher.register("b1", 100, false);
        dispatcher.touch("b1");
        dispatcher.tick(|_| Some(pages(&["page 1", "page 2"]))).await;
        assert_eq!(messenger.contents(100).len(), 2);

        dispatcher.retire("b1");
        dispatcher.tick(|_| Some(pages(&["ignored"]))).await;
        assert!(messenger.contents(100).is_empty());
        assert!(!dispatcher.has_bundle("b1"));
    }

    #[tokio::test]
    async fn test_sticky_overtaken_resends_at_bottom() {
        let messenger = Arc::new(MemoryMessenger::new());
        let dispatcher = MessageDispatcher::new(messenger.clone(), 10);
        dispatcher.register("order", 100, true);
        dispatcher.touch("order");
        dispatcher.tick(|_| Some(pages(&["queue table"]))).await;
        assert_eq!(messenger.contents(100), vec!["queue table"]);

        // A foreign message lands after ours
        messenger.send(100, "someone chatting", None).await.unwrap();

        dispatcher.touch("order");
        dispatcher.tick(|_| Some(pages(&["queue table"]))).await;
        assert_eq!(
            messenger.contents(100),
            vec!["someone chatting", "queue table"]
        );
    }

    #[tokio::test]
    async fn test_transient_error_keeps_bundle_pending() {
        let messenger = Arc::new(MemoryMessenger::new());
        let dispatcher = MessageDispatcher::new(messenger.clone(), 10);
        dispatcher.register("b1", 100, false);
        dispatcher.touch("b1");

        *messenger.fail_transient.lock().unwrap() = true;
        let outcome = dispatcher.tick(|_| Some(pages(&["content"]))).await;
        assert_eq!(outcome, TickOutcome::Backpressure);

        *messenger.fail_transient.lock().unwrap() = false;
        let outcome = dispatcher.tick(|_| Some(pages(&["content"]))).await;
        assert_eq!(outcome, TickOutcome::Dispatched);
        assert_eq!(messenger.contents(100), vec!["content"]);
    }

    #[tokio::test]
    async fn test_single_queue_drained_when_no_bundle_pending() {
        let messenger = Arc::new(MemoryMessenger::new());
        let dispatcher = MessageDispatcher::new(messenger.clone(), 10);
        dispatcher.send_single(SingleMessage {
            channel_id: 7,
            content: "one-off".to_string(),
            delete_after: None,
        });

        let outcome = dispatcher.tick(|_| None).await;
        assert_eq!(outcome, TickOutcome::Dispatched);
        assert_eq!(messenger.contents(7), vec!["one-off"]);
        assert_eq!(dispatcher.tick(|_| None).await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_move_channel_resends_in_new_channel() {
        let messenger = Arc::new(MemoryMessenger::new());
        let dispatcher = MessageDispatcher::new(messenger.clone(), 10);
        dispatcher.register("b1", 100, false);
        dispatcher.touch("b1");
        dispatcher.tick(|_| Some(pages(&["hello"]))).await;

        dispatcher.move_channel("b1", 200);
        dispatcher.tick(|_| Some(pages(&["hello"]))).await;

        assert!(messenger.contents(100).is_empty());
        assert_eq!(messenger.contents(200), vec!["hello"]);
    }
}
