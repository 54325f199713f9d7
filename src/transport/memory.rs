//! In-process transport. Records what was published and lets the caller
//! inject worker notifications by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{NotificationHandler, Subscribers, Transport};
use crate::error::{Error, Result};
use crate::job::{JobId, JobMessage};

#[derive(Default, Clone)]
pub struct MemoryTransport {
    published: Arc<Mutex<Vec<(JobId, Vec<u8>)>>>,
    subscribers: Subscribers,
    fail_publish: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Hand a raw notification to every subscriber.
    pub fn deliver(&self, message: serde_json::Value) {
        self.subscribers.dispatch(&message);
    }

    pub fn complete(&self, id: &str, result: serde_json::Value) {
        self.deliver(serde_json::json!({
            "type": "JobCompleted",
            "payload": {"id": id, "result": result},
        }));
    }

    pub fn fail(&self, id: &str, error: &str) {
        self.deliver(serde_json::json!({
            "type": "JobFailed",
            "payload": {"id": id, "error": error},
        }));
    }

    pub fn published_ids(&self) -> Vec<JobId> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn published_count(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Decode the most recent message published for `id`.
    pub fn message_for(&self, id: &str) -> Option<JobMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(job, _)| job.as_str() == id)
            .and_then(|(_, bytes)| serde_json::from_slice(bytes).ok())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, id: &JobId, message: Vec<u8>) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Other("memory transport rejected publish".to_string()));
        }
        debug!(job.id = %id, bytes = message.len(), "published to memory transport");
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.clone(), message));
        Ok(())
    }

    fn subscribe(&self, handler: NotificationHandler) {
        self.subscribers.add(handler);
    }
}
