//! Pending-job registry.
//!
//! [`Queue::push`] registers a job under its id, publishes it, and waits for
//! whichever terminal event reaches the registry first: a completion, a
//! failure, or the job's deadline. Every handler removes the entry before
//! acting, so the losers of that race find nothing and do nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{Notify, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::config::RelaySettings;
use crate::error::{Error, Result};
use crate::gate;
use crate::job::JobId;
use crate::notification::Notification;
use crate::telemetry::metrics;
use crate::transport::Transport;

/// Registry limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Outstanding jobs allowed before `push` waits.
    pub max_queue_depth: usize,
    /// Time a job may stay outstanding before it is abandoned.
    pub max_job_age: Duration,
    /// Fallback re-check interval while waiting for depth.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

impl From<&RelaySettings> for QueueConfig {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            max_queue_depth: settings.max_queue_depth,
            max_job_age: settings.job_timeout(),
            poll_interval: settings.poll_interval(),
        }
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

type Resolver = oneshot::Sender<Result<serde_json::Value>>;

struct PendingJob {
    /// Distinguishes this registration from earlier ones under the same id.
    seq: u64,
    deadline: DateTime<Utc>,
    resolver: Resolver,
    timer: AbortHandle,
}

impl PendingJob {
    fn settle(self, outcome: Result<serde_json::Value>) {
        self.timer.abort();
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.resolver.send(outcome);
    }
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<JobId, PendingJob>,
    next_seq: u64,
    submitted: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
}

impl QueueState {
    fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            submitted: self.submitted,
            completed: self.completed,
            failed: self.failed,
            timed_out: self.timed_out,
        }
    }
}

struct Registry {
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Signalled whenever an entry leaves the registry.
    released: Notify,
}

impl Registry {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` if there is room. `None` means the registry is full.
    fn try_register(
        self: &Arc<Self>,
        id: &JobId,
    ) -> Option<Result<(u64, oneshot::Receiver<Result<serde_json::Value>>)>> {
        let mut state = self.state();
        if state.pending.contains_key(id) {
            return Some(Err(Error::DuplicateJob(id.clone())));
        }
        if state.pending.len() >= self.config.max_queue_depth {
            return None;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.submitted += 1;

        let (resolver, receiver) = oneshot::channel();
        let timer = self.arm_timer(id.clone(), seq);
        let deadline = chrono::TimeDelta::from_std(self.config.max_job_age)
            .ok()
            .and_then(|age| Utc::now().checked_add_signed(age))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        state.pending.insert(
            id.clone(),
            PendingJob {
                seq,
                deadline,
                resolver,
                timer,
            },
        );
        Some(Ok((seq, receiver)))
    }

    fn arm_timer(self: &Arc<Self>, id: JobId, seq: u64) -> AbortHandle {
        let registry = Arc::downgrade(self);
        let age = self.config.max_job_age;
        tokio::spawn(async move {
            tokio::time::sleep(age).await;
            if let Some(registry) = Weak::upgrade(&registry) {
                registry.expire(&id, seq);
            }
        })
        .abort_handle()
    }

    /// Remove the entry only if it is still the registration `seq`.
    fn take(&self, id: &JobId, seq: u64) -> Option<PendingJob> {
        let mut state = self.state();
        match state.pending.get(id) {
            Some(job) if job.seq == seq => state.pending.remove(id),
            _ => None,
        }
    }

    fn expire(&self, id: &JobId, seq: u64) {
        let job = {
            let mut state = self.state();
            match state.pending.get(id) {
                Some(job) if job.seq == seq => {
                    state.timed_out += 1;
                    state.pending.remove(id)
                }
                _ => None,
            }
        };
        let Some(job) = job else {
            return;
        };
        warn!(job.id = %id, after_ms = self.config.max_job_age.as_millis() as u64, "job timed out");
        record_resolution("timed_out");
        let _ = job.resolver.send(Err(Error::JobTimeout {
            id: id.clone(),
            after: self.config.max_job_age,
        }));
        self.released.notify_waiters();
    }

    fn handle(&self, notification: Notification) {
        match notification {
            Notification::JobCompleted { id, result } => {
                let (job, stats) = {
                    let mut state = self.state();
                    let job = state.pending.remove(&id);
                    if job.is_some() {
                        state.completed += 1;
                    }
                    (job, state.stats())
                };
                match job {
                    Some(job) => {
                        job.settle(Ok(result));
                        self.released.notify_waiters();
                        record_resolution("completed");
                        info!(
                            job.id = %id,
                            pending = stats.pending,
                            completed = stats.completed,
                            submitted = stats.submitted,
                            "job completed"
                        );
                    }
                    None => debug!(job.id = %id, "completion for unknown or settled job ignored"),
                }
            }
            Notification::JobFailed { id, error } => {
                let job = {
                    let mut state = self.state();
                    let job = state.pending.remove(&id);
                    if job.is_some() {
                        state.failed += 1;
                    }
                    job
                };
                match job {
                    Some(job) => {
                        info!(job.id = %id, %error, "job failed");
                        job.settle(Err(Error::JobFailed {
                            id,
                            message: error,
                        }));
                        self.released.notify_waiters();
                        record_resolution("failed");
                    }
                    None => debug!(job.id = %id, "failure for unknown or settled job ignored"),
                }
            }
            Notification::Unknown { kind } => {
                error!(kind = %kind, "unknown worker message");
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for job in state.pending.values() {
            job.timer.abort();
        }
    }
}

fn record_resolution(outcome: &'static str) {
    metrics::jobs_resolved().add(1, &[KeyValue::new("outcome", outcome)]);
}

/// Registry of outstanding jobs bound to one transport.
#[derive(Clone)]
pub struct Queue {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
}

impl Queue {
    /// Create a queue and subscribe it to the transport's notifications.
    pub fn new(transport: Arc<dyn Transport>, config: QueueConfig) -> Self {
        info!(
            max_queue_depth = config.max_queue_depth,
            max_job_age_ms = config.max_job_age.as_millis() as u64,
            "queue initialized"
        );
        let registry = Arc::new(Registry {
            config,
            state: Mutex::new(QueueState::default()),
            released: Notify::new(),
        });

        let weak = Arc::downgrade(&registry);
        transport.subscribe(Arc::new(move |message| {
            if let Some(registry) = weak.upgrade() {
                registry.handle(Notification::from_value(message));
            }
        }));

        Self {
            registry,
            transport,
        }
    }

    /// Submit a serialized job and wait for its terminal outcome.
    ///
    /// Waits for room in the registry first. Resolves with the worker's
    /// `result`, or fails with [`Error::JobFailed`], [`Error::JobTimeout`],
    /// [`Error::Publish`] or [`Error::DuplicateJob`].
    pub async fn push(&self, id: JobId, message: Vec<u8>) -> Result<serde_json::Value> {
        let registry = &self.registry;
        let (registered, waited) = gate::acquire(
            &registry.released,
            registry.config.poll_interval,
            || registry.try_register(&id),
        )
        .await;
        if !waited.is_zero() {
            info!(job.id = %id, waited_ms = waited.as_millis() as u64, "queue depth throttling");
            metrics::admission_wait_ms().record(
                waited.as_secs_f64() * 1000.0,
                &[KeyValue::new("gate", "queue_depth")],
            );
        }
        let (seq, receiver) = registered?;
        metrics::jobs_submitted().add(1, &[]);

        if let Err(e) = self.transport.publish(&id, message).await {
            // A notification may already have settled the job; that wins.
            if let Some(job) = registry.take(&id, seq) {
                error!(job.id = %id, error = %e, "publish failed");
                job.timer.abort();
                registry.released.notify_waiters();
                record_resolution("publish_error");
                return Err(Error::Publish {
                    id,
                    source: Box::new(e),
                });
            }
        }

        receiver.await.unwrap_or(Err(Error::Closed(id)))
    }

    /// Feed a raw notification into the registry.
    pub fn on_message(&self, message: serde_json::Value) {
        self.registry.handle(Notification::from_value(message));
    }

    pub fn stats(&self) -> QueueStats {
        self.registry.state().stats()
    }

    pub fn pending_count(&self) -> usize {
        self.registry.state().pending.len()
    }

    pub fn is_pending(&self, id: &JobId) -> bool {
        self.registry.state().pending.contains_key(id)
    }

    /// When the job will be abandoned, if it is still outstanding.
    pub fn deadline_of(&self, id: &JobId) -> Option<DateTime<Utc>> {
        self.registry.state().pending.get(id).map(|job| job.deadline)
    }
}
