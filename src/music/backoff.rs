use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window failure counter driving adaptive download waits.
///
/// Each retryable failure appends a timestamped record; each success removes
/// the oldest; records past max_age evaporate. The number of live records is
/// the extra-wait multiplier, so the wait before the next download is
/// `base_wait * (1 + multiplier)` and is bounded by `base_wait * (1 + max_size)`.
pub struct FailureBackoffTracker {
    records: Mutex<VecDeque<Instant>>,
    max_size: usize,
    max_age: Duration,
}

impl FailureBackoffTracker {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_size,
            max_age,
        }
    }

    fn evict_aged(&self, records: &mut VecDeque<Instant>) {
        if self.max_age.is_zero() {
            return;
        }
        let cutoff = Instant::now();
        while let Some(front) = records.front() {
            if cutoff.duration_since(*front) > self.max_age {
                records.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record one retryable failure, dropping the oldest when at capacity
    pub fn record_failure(&self) {
        let mut records = self.records.lock().unwrap();
        self.evict_aged(&mut records);
        while records.len() >= self.max_size {
            records.pop_front();
        }
        records.push_back(Instant::now());
    }

    /// A success forgives the oldest live failure
    pub fn record_success(&self) {
        let mut records = self.records.lock().unwrap();
        self.evict_aged(&mut records);
        records.pop_front();
    }

    /// Current extra-wait multiplier
    pub fn current_multiplier(&self) -> usize {
        let mut records = self.records.lock().unwrap();
        self.evict_aged(&mut records);
        records.len()
    }

    /// Total wait before the next download given the base wait
    pub fn wait_for(&self, base_wait: Duration) -> Duration {
        base_wait + base_wait * self.current_multiplier() as u32
    }

    /// Summary line for the download loop's logs
    pub fn status_summary(&self) -> String {
        let mut records = self.records.lock().unwrap();
        self.evict_aged(&mut records);
        match records.front() {
            None => "0 failures in queue".to_string(),
            Some(oldest) => {
                let age = oldest.elapsed().as_secs();
                let age_str = if age >= 60 {
                    format!("{}m {}s ago", age / 60, age % 60)
                } else {
                    format!("{age}s ago")
                };
                format!("{} failures in queue, oldest: {age_str}", records.len())
            }
        }
    }
}
