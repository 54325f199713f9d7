//! Memory-gated front door to the [`Queue`].
//!
//! A burst of small jobs and a handful of huge ones fail differently, so
//! admission is gated twice: here on in-flight payload bytes, and in the
//! queue on outstanding job count.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, debug, info};

use crate::config::RelaySettings;
use crate::error::Result;
use crate::gate;
use crate::job::{JobRequest, WorkItem};
use crate::queue::{Queue, QueueConfig};
use crate::telemetry::job::{record_job_outcome, start_job_span};
use crate::telemetry::metrics;
use crate::transport::Transport;

/// Configuration for a processor queue.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Processor name, used in spans and logs.
    pub name: String,
    /// Reply topic stamped on outbound messages.
    pub topic: String,
    /// Payload bytes allowed in flight before `admit` waits.
    pub max_in_flight_bytes: u64,
    pub queue: QueueConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_settings("default", &RelaySettings::default())
    }
}

impl ProcessorConfig {
    pub fn from_settings(name: impl Into<String>, settings: &RelaySettings) -> Self {
        Self {
            name: name.into(),
            topic: settings.topic.clone(),
            max_in_flight_bytes: settings.max_in_flight_bytes,
            queue: QueueConfig::from(settings),
        }
    }
}

/// In-flight byte accounting.
struct MemoryBudget {
    in_flight: Mutex<u64>,
    ceiling: u64,
    poll_interval: Duration,
    released: Notify,
}

impl MemoryBudget {
    fn in_flight(&self) -> MutexGuard<'_, u64> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Charge `bytes` if they fit. A job alone in flight always fits, so an
    /// oversized payload cannot wedge the budget.
    fn try_charge(self: &Arc<Self>, bytes: u64) -> Option<Charge> {
        let mut in_flight = self.in_flight();
        let fits = *in_flight == 0 || in_flight.saturating_add(bytes) <= self.ceiling;
        if !fits {
            return None;
        }
        *in_flight += bytes;
        Some(Charge {
            budget: Arc::clone(self),
            bytes,
        })
    }

    fn release(&self, bytes: u64) {
        {
            let mut in_flight = self.in_flight();
            *in_flight = in_flight.saturating_sub(bytes);
        }
        self.released.notify_waiters();
    }
}

/// A reservation against the budget, returned on drop.
struct Charge {
    budget: Arc<MemoryBudget>,
    bytes: u64,
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

/// Admission controller: byte budget in front of a [`Queue`].
#[derive(Clone)]
pub struct ProcessorQueue {
    name: Arc<str>,
    topic: Arc<str>,
    budget: Arc<MemoryBudget>,
    queue: Queue,
}

impl ProcessorQueue {
    pub fn new(transport: Arc<dyn Transport>, config: ProcessorConfig) -> Self {
        let budget = Arc::new(MemoryBudget {
            in_flight: Mutex::new(0),
            ceiling: config.max_in_flight_bytes,
            poll_interval: config.queue.poll_interval,
            released: Notify::new(),
        });
        Self {
            name: config.name.into(),
            topic: config.topic.into(),
            budget,
            queue: Queue::new(transport, config.queue),
        }
    }

    /// Measure a request, then [`admit`](Self::admit) it.
    pub async fn process(&self, request: JobRequest) -> Result<serde_json::Value> {
        let item = WorkItem::new(request).await?;
        self.admit(item).await
    }

    /// Wait for room in the byte budget, then push through the queue.
    ///
    /// The charge is returned when the push settles, on every path,
    /// including the caller dropping this future.
    pub async fn admit(&self, item: WorkItem) -> Result<serde_json::Value> {
        let span = start_job_span(&self.name, item.id());
        let outcome = self.admit_inner(item).instrument(span.clone()).await;
        record_job_outcome(&span, &outcome);
        outcome
    }

    async fn admit_inner(&self, item: WorkItem) -> Result<serde_json::Value> {
        let size = item.size();
        let (charge, waited) = gate::acquire(&self.budget.released, self.budget.poll_interval, || {
            self.budget.try_charge(size)
        })
        .await;
        if !waited.is_zero() {
            info!(
                job.id = %item.id(),
                waited_ms = waited.as_millis() as u64,
                "max memory throttling"
            );
            metrics::admission_wait_ms().record(
                waited.as_secs_f64() * 1000.0,
                &[KeyValue::new("gate", "memory")],
            );
        }
        debug!(job.id = %item.id(), bytes = size, "memory charged");

        let message = item.to_message(&self.topic).await?;
        let id = item.id().clone();
        // The item carries nothing once its message exists.
        drop(item);

        let result = self.queue.push(id, message).await;
        drop(charge);
        result
    }

    /// Payload bytes admitted but not yet settled.
    pub fn in_flight_bytes(&self) -> u64 {
        *self.budget.in_flight()
    }

    pub fn max_in_flight_bytes(&self) -> u64 {
        self.budget.ceiling
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}
