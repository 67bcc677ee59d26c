use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::Notify;

/// Rejected puts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Bounded capacity reached
    Full,
    /// Queue is blocked for shutdown
    Blocked,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "queue is full"),
            Self::Blocked => write!(f, "queue is blocked"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Bounded FIFO with the queue-surgery operations the player commands need.
///
/// Indexes are 1-based to match what users see in the queue table.
pub struct PlayQueue<T> {
    inner: Mutex<PlayQueueInner<T>>,
    notify: Notify,
    max_size: usize,
}

struct PlayQueueInner<T> {
    items: VecDeque<T>,
    blocked: bool,
}

impl<T> PlayQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(PlayQueueInner {
                items: VecDeque::new(),
                blocked: false,
            }),
            notify: Notify::new(),
            max_size,
        }
    }

    pub fn put(&self, item: T) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.blocked {
                return Err(QueueError::Blocked);
            }
            if inner.items.len() >= self.max_size {
                return Err(QueueError::Full);
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_get(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Wait until an item is available. None once the queue is blocked and
    /// drained, so consumer loops can exit.
    pub async fn get(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.blocked {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Block future puts, for shutdown. Wakes parked consumers.
    pub fn block(&self) {
        self.inner.lock().unwrap().blocked = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_size
    }

    /// Random permutation
    pub fn shuffle(&self) {
        let mut inner = self.inner.lock().unwrap();
        let mut items: Vec<T> = inner.items.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        inner.items = items.into();
    }

    /// Remove the item at 1-based position, None when out of range
    pub fn remove(&self, position: usize) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if position < 1 || position > inner.items.len() {
            return None;
        }
        inner.items.remove(position - 1)
    }

    /// Move the item at 1-based position to the front
    pub fn bump(&self, position: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if position < 1 || position > inner.items.len() {
            return false;
        }
        if let Some(item) = inner.items.remove(position - 1) {
            inner.items.push_front(item);
        }
        true
    }

    /// Drain everything, returning the items for cleanup
    pub fn clear(&self) -> Vec<T> {
        self.inner.lock().unwrap().items.drain(..).collect()
    }

    /// Project each queued item without removing it
    pub fn map_items<F, R>(&self, f: F) -> Vec<R>
    where
        F: FnMut(&T) -> R,
    {
        self.inner.lock().unwrap().items.iter().map(f).collect()
    }
}

struct Partition<T> {
    items: VecDeque<T>,
    created_at: Instant,
    last_iterated_at: Option<Instant>,
    blocked: bool,
}

impl<T> Partition<T> {
    fn served_marker(&self) -> Instant {
        self.last_iterated_at.unwrap_or(self.created_at)
    }
}

/// Queue partitioned by guild with a fairness policy.
///
/// `get` serves the non-empty partition with the highest priority, breaking
/// ties by whichever partition was served longest ago, so one busy guild
/// cannot starve the rest. Empty partitions are garbage-collected during
/// selection.
pub struct DistributedQueue<T> {
    partitions: Mutex<HashMap<u64, Partition<T>>>,
    notify: Notify,
    per_partition_capacity: usize,
    priorities: HashMap<u64, u32>,
}

impl<T> DistributedQueue<T> {
    pub fn new(per_partition_capacity: usize, priorities: HashMap<u64, u32>) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            per_partition_capacity,
            priorities,
        }
    }

    fn priority(&self, guild_id: u64) -> u32 {
        self.priorities.get(&guild_id).copied().unwrap_or(1)
    }

    pub fn put(&self, guild_id: u64, item: T) -> Result<(), QueueError> {
        {
            let mut partitions = self.partitions.lock().unwrap();
            let partition = partitions.entry(guild_id).or_insert_with(|| Partition {
                items: VecDeque::new(),
                created_at: Instant::now(),
                last_iterated_at: None,
                blocked: false,
            });
            if partition.blocked {
                return Err(QueueError::Blocked);
            }
            if partition.items.len() >= self.per_partition_capacity {
                return Err(QueueError::Full);
            }
            partition.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_get(&self) -> Option<T> {
        let mut partitions = self.partitions.lock().unwrap();

        partitions.retain(|_, p| !p.items.is_empty() || p.blocked);

        let best = partitions
            .iter()
            .filter(|(_, p)| !p.items.is_empty())
            .map(|(guild_id, p)| (*guild_id, self.priority(*guild_id), p.served_marker()))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
            .map(|(guild_id, _, _)| guild_id)?;

        let partition = partitions.get_mut(&best)?;
        let item = partition.items.pop_front();
        partition.last_iterated_at = Some(Instant::now());
        item
    }

    /// Wait until any partition has an item
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Drain one guild's partition, returning its items
    pub fn clear_partition(&self, guild_id: u64) -> Vec<T> {
        let mut partitions = self.partitions.lock().unwrap();
        match partitions.remove(&guild_id) {
            Some(p) => p.items.into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Drain every partition, for shutdown
    pub fn clear_all(&self) -> Vec<T> {
        let mut partitions = self.partitions.lock().unwrap();
        let mut items = Vec::new();
        for (_, partition) in partitions.drain() {
            items.extend(partition.items);
        }
        items
    }

    /// Refuse further puts for a shutting-down guild
    pub fn block_partition(&self, guild_id: u64) {
        let mut partitions = self.partitions.lock().unwrap();
        if let Some(partition) = partitions.get_mut(&guild_id) {
            partition.blocked = true;
        }
    }

    pub fn size(&self, guild_id: u64) -> usize {
        self.partitions
            .lock()
            .unwrap()
            .get(&guild_id)
            .map(|p| p.items.len())
            .unwrap_or(0)
    }

    pub fn total_size(&self) -> usize {
        self.partitions
            .lock()
            .unwrap()
            .values()
            .map(|p| p.items.len())
            .sum()
    }
}
