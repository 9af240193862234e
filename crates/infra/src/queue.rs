//! In-process dual-lane job queue.
//!
//! Priority 1 jobs go to the high lane (FIFO). Everything else goes to the
//! standard lane, ordered by priority then creation time. Each lane pairs a
//! locked collection with a semaphore whose permits count queued items, so a
//! consumer waiting on an empty lane suspends until a push or `close()`.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use hookrelay_core::{JobId, NotificationJob, Priority};

/// Which lane a job travels through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Lane {
    High,
    Standard,
}

impl Lane {
    pub fn for_priority(priority: Priority) -> Self {
        if priority.is_high() {
            Lane::High
        } else {
            Lane::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::High => "high",
            Lane::Standard => "standard",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard-lane entry, ordered by `(priority, created_at, id)`.
#[derive(Debug, Clone)]
struct QueueItem {
    priority: Priority,
    created_at: DateTime<Utc>,
    id: JobId,
    job: NotificationJob,
}

impl QueueItem {
    fn new(job: NotificationJob) -> Self {
        Self {
            priority: job.priority,
            created_at: job.created_at,
            id: job.id,
            job,
        }
    }

    fn key(&self) -> (Priority, DateTime<Utc>, JobId) {
        (self.priority, self.created_at, self.id)
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Snapshot of lane depths.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct QueueDepth {
    pub high: usize,
    pub standard: usize,
}

/// Owns both lanes; shared by intake, the recovery poller and the dispatcher.
#[derive(Debug)]
pub struct QueueManager {
    high: Mutex<VecDeque<NotificationJob>>,
    high_ready: Semaphore,
    standard: Mutex<BinaryHeap<Reverse<QueueItem>>>,
    standard_ready: Semaphore,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            high: Mutex::new(VecDeque::new()),
            high_ready: Semaphore::new(0),
            standard: Mutex::new(BinaryHeap::new()),
            standard_ready: Semaphore::new(0),
        }
    }

    /// Route `job` to its lane. Returns the lane used.
    pub fn push(&self, job: NotificationJob) -> Lane {
        let lane = Lane::for_priority(job.priority);
        match lane {
            Lane::High => {
                self.high
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(job);
                self.high_ready.add_permits(1);
            }
            Lane::Standard => {
                self.standard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Reverse(QueueItem::new(job)));
                self.standard_ready.add_permits(1);
            }
        }
        lane
    }

    /// Wait for the oldest high-lane job. `None` once the queue is closed.
    pub async fn take_high(&self) -> Option<NotificationJob> {
        loop {
            self.high_ready.acquire().await.ok()?.forget();
            let next = self
                .high
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if next.is_some() {
                return next;
            }
        }
    }

    /// Wait for the best standard-lane job. `None` once the queue is closed.
    pub async fn take_standard(&self) -> Option<NotificationJob> {
        loop {
            self.standard_ready.acquire().await.ok()?.forget();
            let next = self
                .standard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop()
                .map(|Reverse(item)| item.job);
            if next.is_some() {
                return next;
            }
        }
    }

    /// Blocking take on the given lane.
    pub async fn take(&self, lane: Lane) -> Option<NotificationJob> {
        match lane {
            Lane::High => self.take_high().await,
            Lane::Standard => self.take_standard().await,
        }
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            high: self.high.lock().unwrap_or_else(PoisonError::into_inner).len(),
            standard: self
                .standard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Wake every waiting consumer; subsequent takes return `None`.
    ///
    /// Queued jobs are left in place and dropped with the manager.
    pub fn close(&self) {
        self.high_ready.close();
        self.standard_ready.close();
    }

    pub fn is_closed(&self) -> bool {
        self.high_ready.is_closed() && self.standard_ready.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hookrelay_core::JobDraft;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn job(id: i64, priority: i32, created_offset_ms: i64) -> NotificationJob {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        JobDraft::new("http://receiver.test/hook")
            .with_priority(Priority::new(priority).unwrap())
            .into_job(JobId::new(id), base + Duration::milliseconds(created_offset_ms))
    }

    #[tokio::test]
    async fn routes_by_priority() {
        let queue = QueueManager::new();
        assert_eq!(queue.push(job(1, 1, 0)), Lane::High);
        assert_eq!(queue.push(job(2, 2, 0)), Lane::Standard);
        assert_eq!(queue.push(job(3, 3, 0)), Lane::Standard);
        assert_eq!(queue.depth(), QueueDepth { high: 1, standard: 2 });

        assert_eq!(queue.take_high().await.unwrap().id, JobId::new(1));
        assert_eq!(queue.depth().high, 0);
    }

    #[tokio::test]
    async fn high_lane_is_fifo() {
        let queue = QueueManager::new();
        // later creation time pushed first still comes out first
        queue.push(job(1, 1, 50));
        queue.push(job(2, 1, 0));
        queue.push(job(3, 1, 10));

        let order: Vec<i64> = [
            queue.take_high().await.unwrap(),
            queue.take_high().await.unwrap(),
            queue.take_high().await.unwrap(),
        ]
        .iter()
        .map(|j| j.id.get())
        .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn standard_lane_orders_by_priority_then_age() {
        let queue = QueueManager::new();
        queue.push(job(1, 3, 0));
        queue.push(job(2, 2, 30));
        queue.push(job(3, 2, 10));
        queue.push(job(4, 3, -5));

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(queue.take_standard().await.unwrap().id.get());
        }
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[tokio::test]
    async fn take_waits_for_push() {
        let queue = Arc::new(QueueManager::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take_standard().await })
        };

        tokio::task::yield_now().await;
        assert!(!consumer.is_finished());

        queue.push(job(7, 2, 0));
        let taken = consumer.await.unwrap().unwrap();
        assert_eq!(taken.id, JobId::new(7));
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumers() {
        let queue = Arc::new(QueueManager::new());
        let high = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take_high().await })
        };
        let standard = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take(Lane::Standard).await })
        };

        tokio::task::yield_now().await;
        queue.close();

        assert!(high.await.unwrap().is_none());
        assert!(standard.await.unwrap().is_none());
        assert!(queue.is_closed());
    }

    proptest! {
        #[test]
        fn standard_lane_drains_in_key_order(
            entries in prop::collection::vec((2i32..=3, 0i64..10_000), 1..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let queue = QueueManager::new();
                for (i, (priority, offset)) in entries.iter().enumerate() {
                    queue.push(job(i as i64 + 1, *priority, *offset));
                }

                let mut previous: Option<(Priority, DateTime<Utc>, JobId)> = None;
                for _ in 0..entries.len() {
                    let next = queue.take_standard().await.unwrap();
                    let key = (next.priority, next.created_at, next.id);
                    if let Some(prev) = previous {
                        prop_assert!(prev <= key);
                    }
                    previous = Some(key);
                }
                prop_assert_eq!(queue.depth().standard, 0);
                Ok::<(), proptest::test_runner::TestCaseError>(())
            })?;
        }
    }
}
