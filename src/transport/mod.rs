//! Message bus boundary.
//!
//! The registry only ever sees publish success or failure and a stream of
//! decoded JSON notifications. Payload offload, rehydration and bus
//! acknowledgement are the transport's business.

pub mod blob;
pub mod memory;
pub mod pgmq;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::Result;
use crate::job::JobId;

pub use blob::{BlobStore, FsBlobStore};
pub use memory::MemoryTransport;
pub use pgmq::{PgmqTransport, PgmqTransportConfig};

/// Callback invoked once per inbound notification.
pub type NotificationHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Publish/subscribe channel to remote workers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` for job `id` to the workers.
    async fn publish(&self, id: &JobId, message: Vec<u8>) -> Result<()>;

    /// Register a handler for inbound notifications.
    fn subscribe(&self, handler: NotificationHandler);
}

/// Handler list shared by transport implementations.
#[derive(Default, Clone)]
pub(crate) struct Subscribers {
    handlers: Arc<Mutex<Vec<NotificationHandler>>>,
}

impl Subscribers {
    pub(crate) fn add(&self, handler: NotificationHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Fan a message out to every handler. The lock is released first so a
    /// handler may subscribe further handlers.
    pub(crate) fn dispatch(&self, message: &serde_json::Value) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(message.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
