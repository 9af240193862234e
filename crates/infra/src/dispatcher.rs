//! Lane consumers, timeout-bounded dispatch and the recovery poller.
//!
//! Each lane has a consumer loop that waits for a worker permit, takes the
//! next job and runs it on its own task. Permits bound per-lane concurrency,
//! so a saturated pool stops the loop from taking more work. Every attempt
//! runs under the dispatch timeout; an attempt that overruns is aborted and
//! recorded as an UNKNOWN failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{error, info, trace, warn};

use hookrelay_core::{FailureReason, JobId, NotificationJob};

use crate::delivery::{ProcessError, ProcessOutcome, Processor};
use crate::jobs::JobStore;
use crate::leader::LeaderElection;
use crate::queue::{Lane, QueueManager};
use crate::workers::{ShutdownSignal, TaskHandle, spawn_periodic};

/// Message recorded on jobs whose attempt overran the dispatch timeout.
pub const TIMEOUT_MESSAGE: &str = "Timeout";

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Upper bound on one delivery attempt
    pub dispatch_timeout: Duration,
    /// How often the leader scans for due FAILED jobs
    pub recovery_interval: Duration,
    /// Max jobs claimed per scan
    pub recovery_batch_size: usize,
    pub high_lane_workers: u32,
    pub standard_lane_workers: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(5),
            recovery_batch_size: 50,
            high_lane_workers: 64,
            standard_lane_workers: 64,
        }
    }
}

impl DispatcherConfig {
    pub fn workers_for(&self, lane: Lane) -> u32 {
        match lane {
            Lane::High => self.high_lane_workers,
            Lane::Standard => self.standard_lane_workers,
        }
        .max(1)
    }

    /// How long a recovered job stays hidden from later scans.
    pub fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.dispatch_timeout + self.recovery_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(35))
    }
}

/// Drains the queue into worker pools and re-enqueues due failures.
pub struct Dispatcher {
    queue: Arc<QueueManager>,
    processor: Arc<Processor>,
    store: Arc<dyn JobStore>,
    leader: Arc<LeaderElection>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<QueueManager>,
        processor: Arc<Processor>,
        store: Arc<dyn JobStore>,
        leader: Arc<LeaderElection>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            store,
            leader,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Start both lane consumers and the recovery poller.
    pub fn spawn(self: Arc<Self>) -> Vec<TaskHandle> {
        let high = {
            let dispatcher = Arc::clone(&self);
            TaskHandle::spawn("dispatch-high", move |shutdown| {
                dispatcher.run_lane(Lane::High, shutdown)
            })
        };
        let standard = {
            let dispatcher = Arc::clone(&self);
            TaskHandle::spawn("dispatch-standard", move |shutdown| {
                dispatcher.run_lane(Lane::Standard, shutdown)
            })
        };
        let recovery = {
            let period = self.config.recovery_interval;
            spawn_periodic("recovery-poller", period, move || {
                let dispatcher = Arc::clone(&self);
                async move {
                    dispatcher.recover_once().await;
                }
            })
        };
        vec![high, standard, recovery]
    }

    async fn run_lane(self: Arc<Self>, lane: Lane, mut shutdown: ShutdownSignal) {
        let size = self.config.workers_for(lane);
        let workers = Arc::new(Semaphore::new(size as usize));
        info!(lane = %lane, workers = size, "lane consumer started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = self.queue.take(lane) => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                let job_id = job.id;
                if let Err(err) = dispatcher.dispatch(job).await {
                    error!(job_id = %job_id, lane = %lane, error = %err, "could not record dispatch result");
                }
            });
        }

        // wait for in-flight attempts
        let _ = workers.acquire_many(size).await;
        info!(lane = %lane, "lane consumer stopped");
    }

    /// Run one attempt for `job` under the dispatch timeout.
    ///
    /// Errors from the attempt and panics inside it are recorded through the
    /// failure handler as UNKNOWN, the same as a timeout.
    pub async fn dispatch(&self, job: NotificationJob) -> Result<ProcessOutcome, ProcessError> {
        let job_id = job.id;
        let attempts_seen = job.attempt_count;
        let processor = Arc::clone(&self.processor);
        let mut attempt = tokio::spawn(async move { processor.process(job).await });

        match tokio::time::timeout(self.config.dispatch_timeout, &mut attempt).await {
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(err))) => {
                error!(job_id = %job_id, error = %err, "delivery attempt failed unexpectedly");
                self.fail_once(job_id, attempts_seen, err.to_string()).await
            }
            Ok(Err(join_err)) => {
                error!(job_id = %job_id, error = %join_err, "delivery task crashed");
                self.fail_once(job_id, attempts_seen, format!("delivery task crashed: {join_err}"))
                    .await
            }
            Err(_) => {
                attempt.abort();
                // let the aborted task settle so the re-read sees its last write
                let _ = attempt.await;
                warn!(
                    job_id = %job_id,
                    timeout_ms = self.config.dispatch_timeout.as_millis() as u64,
                    "delivery attempt timed out"
                );
                self.fail_once(job_id, attempts_seen, TIMEOUT_MESSAGE.to_string())
                    .await
            }
        }
    }

    async fn fail_once(
        &self,
        job_id: JobId,
        attempts_seen: u32,
        message: String,
    ) -> Result<ProcessOutcome, ProcessError> {
        self.processor
            .handle_failure_once(job_id, attempts_seen, message, FailureReason::Unknown)
            .await
    }

    /// One recovery scan. Leader-only; returns the number of jobs re-enqueued.
    pub async fn recover_once(&self) -> usize {
        if !self.leader.is_leader().await {
            trace!("not leader, skipping recovery scan");
            return 0;
        }

        let claimed = match self
            .store
            .claim_for_recovery(
                Utc::now(),
                self.config.recovery_batch_size,
                self.config.claim_ttl(),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(error = %err, "recovery scan failed");
                return 0;
            }
        };

        let count = claimed.len();
        for job in claimed {
            info!(
                job_id = %job.id,
                attempts = job.attempt_count,
                priority = job.priority.get(),
                "re-enqueued failed job"
            );
            self.queue.push(job);
        }
        count
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("queue", &self.queue.depth())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{HandlebarsRenderer, InMemoryTemplateRepository};
    use crate::jobs::InMemoryJobStore;
    use crate::jobs::store::seed_failed;
    use crate::leader::InMemoryLeaseStore;
    use crate::testing::{Reply, ScriptedClient};
    use chrono::Duration as ChronoDuration;
    use hookrelay_core::{JobDraft, JobStatus, LeaseConfig, Priority, RetryPolicy};

    struct Rig {
        store: Arc<InMemoryJobStore>,
        client: Arc<ScriptedClient>,
        queue: Arc<QueueManager>,
        leader: Arc<LeaderElection>,
        dispatcher: Arc<Dispatcher>,
    }

    fn rig(client: ScriptedClient, config: DispatcherConfig) -> Rig {
        let store = Arc::new(InMemoryJobStore::new());
        let client = Arc::new(client);
        let queue = Arc::new(QueueManager::new());
        let leader = Arc::new(LeaderElection::new(
            Arc::new(InMemoryLeaseStore::new()),
            LeaseConfig::default(),
        ));
        let processor = Arc::new(Processor::new(
            store.clone(),
            client.clone(),
            Arc::new(HandlebarsRenderer::new(Arc::new(
                InMemoryTemplateRepository::new(),
            ))),
            RetryPolicy::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            processor,
            store.clone(),
            leader.clone(),
            config,
        ));
        Rig {
            store,
            client,
            queue,
            leader,
            dispatcher,
        }
    }

    fn fast() -> DispatcherConfig {
        DispatcherConfig {
            dispatch_timeout: Duration::from_millis(100),
            recovery_interval: Duration::from_millis(20),
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn claim_ttl_covers_timeout_plus_interval() {
        assert_eq!(
            DispatcherConfig::default().claim_ttl(),
            ChronoDuration::seconds(35)
        );
    }

    #[tokio::test]
    async fn hung_attempt_is_aborted_and_counted_once() {
        let r = rig(ScriptedClient::always(Reply::Hang), fast());
        let job = r
            .store
            .insert(JobDraft::new("http://receiver.test/slow"))
            .await
            .unwrap();

        let outcome = r.dispatcher.dispatch(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Failed {
                reason: FailureReason::Unknown,
                attempts: 1
            }
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stored = r.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.failure_message.as_deref(), Some(TIMEOUT_MESSAGE));
        assert_eq!(stored.failure_reason, Some(FailureReason::Unknown));
        assert_eq!(r.client.call_count(), 1);
    }

    #[tokio::test]
    async fn panicking_attempt_goes_through_failure_handler() {
        let r = rig(ScriptedClient::always(Reply::Panic), fast());
        let job = r
            .store
            .insert(JobDraft::new("http://receiver.test/boom"))
            .await
            .unwrap();

        r.dispatcher.dispatch(job.clone()).await.unwrap();
        let stored = r.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.failure_reason, Some(FailureReason::Unknown));
        assert!(stored.failure_message.unwrap().contains("crashed"));
    }

    #[tokio::test]
    async fn recovery_requires_leadership() {
        let r = rig(ScriptedClient::always(Reply::Accept), fast());
        seed_failed(
            r.store.as_ref(),
            JobDraft::new("http://receiver.test/a"),
            1,
            Utc::now() - ChronoDuration::seconds(1),
        )
        .await;

        assert_eq!(r.dispatcher.recover_once().await, 0);
        assert_eq!(r.queue.depth().standard, 0);

        r.leader.heartbeat().await;
        assert_eq!(r.dispatcher.recover_once().await, 1);
        assert_eq!(r.queue.depth().standard, 1);

        // the claim hides it from the next scan
        assert_eq!(r.dispatcher.recover_once().await, 0);
    }

    #[tokio::test]
    async fn recovery_skips_future_and_terminal_jobs() {
        let r = rig(ScriptedClient::always(Reply::Accept), fast());
        r.leader.heartbeat().await;
        seed_failed(
            r.store.as_ref(),
            JobDraft::new("http://receiver.test/later"),
            1,
            Utc::now() + ChronoDuration::seconds(60),
        )
        .await;
        let mut exhausted = seed_failed(
            r.store.as_ref(),
            JobDraft::new("http://receiver.test/dead"),
            5,
            Utc::now() - ChronoDuration::seconds(1),
        )
        .await;
        exhausted.status = JobStatus::MaxRetries;
        exhausted.next_retry_at = None;
        r.store.update(&exhausted).await.unwrap();

        assert_eq!(r.dispatcher.recover_once().await, 0);
    }

    #[tokio::test]
    async fn lanes_deliver_queued_jobs_until_shutdown() {
        let r = rig(ScriptedClient::always(Reply::Accept), fast());
        let handles = Arc::clone(&r.dispatcher).spawn();

        let mut ids = Vec::new();
        for priority in [Priority::HIGH, Priority::NORMAL, Priority::LOW] {
            let job = r
                .store
                .insert(JobDraft::new("http://receiver.test/ok").with_priority(priority))
                .await
                .unwrap();
            ids.push(job.id);
            r.queue.push(job);
        }

        let mut delivered = false;
        for _ in 0..100 {
            let done = r
                .store
                .all()
                .iter()
                .filter(|j| j.status == JobStatus::Success)
                .count();
            if done == ids.len() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(delivered, "jobs were not all delivered");
        assert_eq!(r.client.call_count(), 3);

        for handle in handles {
            handle.shutdown().await;
        }
    }
}
