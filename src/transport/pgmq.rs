//! pgmq-backed transport.
//!
//! Jobs go out on a per-processor worker queue; replies come back on a result
//! queue that a background loop drains. Oversized outbound messages are
//! parked in a [`BlobStore`] and replaced by a pointer; oversized replies
//! arrive the same way and are rehydrated before any handler sees them.
//!
//! pgmq hands each message to exactly one reader, so every transport built
//! with [`PgmqTransportConfig::for_processor`] replies on a topic of its own
//! and drops that result queue on [`shutdown`](PgmqTransport::shutdown).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BlobStore, NotificationHandler, Subscribers, Transport};
use crate::config::RelaySettings;
use crate::db::Db;
use crate::db::pgmq::PgmqMessage;
use crate::error::{Error, Result};
use crate::job::JobId;
use crate::telemetry::metrics;

/// Pointer field used in place of an inline payload.
pub const STORED_PAYLOAD_FIELD: &str = "storedPayload";

/// Reads after which an undecodable reply is archived instead of retried.
const MAX_DECODE_ATTEMPTS: i32 = 5;

/// Configuration for one processor's queues.
#[derive(Debug, Clone)]
pub struct PgmqTransportConfig {
    /// Queue workers read jobs from.
    pub worker_queue: String,
    /// Topic stamped on outbound jobs; workers reply on
    /// `<reply_topic>_<processor>_results`.
    pub reply_topic: String,
    /// Queue workers publish notifications to.
    pub result_queue: String,
    /// Drop `result_queue` on shutdown. Only safe when no other
    /// coordinator reads it.
    pub ephemeral_results: bool,
    /// Messages at or above this size go to blob storage.
    pub max_message_bytes: usize,
    /// Visibility timeout (seconds) for result reads.
    pub visibility_timeout: i32,
    /// Messages read per poll.
    pub batch_size: i32,
    /// Sleep between polls of an empty result queue.
    pub poll_interval: Duration,
}

impl Default for PgmqTransportConfig {
    fn default() -> Self {
        Self {
            worker_queue: "workrelay_jobs".to_string(),
            reply_topic: "workrelay".to_string(),
            result_queue: "workrelay_results".to_string(),
            ephemeral_results: false,
            max_message_bytes: 1024 * 1024 * 5,
            visibility_timeout: 200,
            batch_size: 50,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl PgmqTransportConfig {
    /// Queue names for one run of processor `name`. The reply topic gets a
    /// fresh suffix per call, so concurrent coordinators never compete for
    /// each other's replies.
    pub fn for_processor(name: &str, settings: &RelaySettings) -> Self {
        let reply_topic = run_topic(&settings.topic);
        Self {
            worker_queue: queue_name(&format!("{name}_jobs")),
            result_queue: queue_name(&format!("{reply_topic}_{name}_results")),
            reply_topic,
            ephemeral_results: true,
            max_message_bytes: settings.max_message_bytes,
            ..Self::default()
        }
    }
}

/// `topic` plus a short random run suffix.
fn run_topic(topic: &str) -> String {
    let run = uuid::Uuid::new_v4().simple().to_string();
    format!("{topic}_{}", &run[..8])
}

/// pgmq accepts lowercase identifiers only.
fn queue_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// One key per job id. Base64url keeps it reversible and path-safe.
fn blob_key(id: &JobId) -> String {
    format!("event-{}", URL_SAFE_NO_PAD.encode(id.as_str()))
}

/// Build the body sent for `message`: the message itself when it is under
/// `threshold` bytes, otherwise a `{id, storedPayload}` pointer to a blob.
/// Returns the body plus the blob key, if one was written.
pub async fn outbound(
    blobs: &dyn BlobStore,
    id: &JobId,
    message: &[u8],
    threshold: usize,
) -> Result<(serde_json::Value, Option<String>)> {
    if message.len() < threshold {
        return Ok((serde_json::from_slice(message)?, None));
    }

    let key = blob_key(id);
    debug!(job.id = %id, key = %key, bytes = message.len(), "offloading to blob storage");
    blobs.put(&key, message).await?;
    let pointer = serde_json::json!({
        "id": id,
        STORED_PAYLOAD_FIELD: key.as_str(),
    });
    Ok((pointer, Some(key)))
}

fn undeliverable(read_ct: i32) -> bool {
    read_ct >= MAX_DECODE_ATTEMPTS
}

pub struct PgmqTransport {
    db: Db,
    blobs: Arc<dyn BlobStore>,
    config: PgmqTransportConfig,
    subscribers: Subscribers,
    shutdown: Arc<Notify>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PgmqTransport {
    /// Build the transport. Nothing touches the database until
    /// [`initialize`](Self::initialize).
    pub fn new(db: Db, blobs: Arc<dyn BlobStore>, config: PgmqTransportConfig) -> Self {
        Self {
            db,
            blobs,
            config,
            subscribers: Subscribers::default(),
            shutdown: Arc::new(Notify::new()),
            listener: Mutex::new(None),
        }
    }

    /// Create both queues and start draining the result queue.
    pub async fn initialize(&self) -> Result<()> {
        self.db.create_queue(&self.config.worker_queue).await?;
        self.db.create_queue(&self.config.result_queue).await?;

        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return Ok(());
        }
        let drain = ResultDrain {
            db: self.db.clone(),
            blobs: Arc::clone(&self.blobs),
            config: self.config.clone(),
            subscribers: self.subscribers.clone(),
            shutdown: Arc::clone(&self.shutdown),
        };
        *listener = Some(tokio::spawn(drain.run()));
        info!(
            worker_queue = %self.config.worker_queue,
            result_queue = %self.config.result_queue,
            "pgmq transport initialized"
        );
        Ok(())
    }

    /// Stop the result loop and wait for it to exit, then drop an
    /// ephemeral result queue.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("result loop ended abnormally: {e}");
            }
        }

        if self.config.ephemeral_results {
            let queue = &self.config.result_queue;
            match self.db.drop_queue(queue).await {
                Ok(()) => debug!(queue = %queue, "result queue dropped"),
                Err(e) => warn!(queue = %queue, "result queue not dropped: {e}"),
            }
        }
    }

    pub fn config(&self) -> &PgmqTransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for PgmqTransport {
    async fn publish(&self, id: &JobId, message: Vec<u8>) -> Result<()> {
        let queue = &self.config.worker_queue;
        let (body, stored) = outbound(
            self.blobs.as_ref(),
            id,
            &message,
            self.config.max_message_bytes,
        )
        .await?;
        debug!(job.id = %id, queue = %queue, "publishing to pgmq");
        self.db.send_to_queue(queue, &body, 0).await?;
        if stored.is_some() {
            metrics::payloads_offloaded().add(1, &[]);
        }
        Ok(())
    }

    fn subscribe(&self, handler: NotificationHandler) {
        self.subscribers.add(handler);
    }
}

impl Drop for PgmqTransport {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Background loop that drains the result queue.
struct ResultDrain {
    db: Db,
    blobs: Arc<dyn BlobStore>,
    config: PgmqTransportConfig,
    subscribers: Subscribers,
    shutdown: Arc<Notify>,
}

impl ResultDrain {
    async fn run(self) {
        let queue = self.config.result_queue.clone();
        loop {
            let batch = match self
                .db
                .read_batch(&queue, self.config.visibility_timeout, self.config.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(queue = %queue, "result read failed: {e}");
                    Vec::new()
                }
            };
            let idle = batch.is_empty();

            for msg in batch {
                self.deliver(&queue, msg).await;
            }

            let pause = if idle {
                self.config.poll_interval
            } else {
                Duration::ZERO
            };
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(queue = %queue, "result loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Rehydrate, hand to subscribers, then acknowledge. A message that
    /// cannot be decoded is left alone and reappears after its visibility
    /// timeout, until it has been read [`MAX_DECODE_ATTEMPTS`] times.
    async fn deliver(&self, queue: &str, msg: PgmqMessage) {
        let (notification, stored_key) = match rehydrate(self.blobs.as_ref(), msg.message).await {
            Ok(decoded) => decoded,
            Err(e) if undeliverable(msg.read_ct) => {
                error!(msg_id = msg.msg_id, read_ct = msg.read_ct, "archiving undecodable worker message: {e}");
                if let Err(e) = self.db.archive_message(queue, msg.msg_id).await {
                    warn!(msg_id = msg.msg_id, "archive failed: {e}");
                }
                return;
            }
            Err(e) => {
                warn!(msg_id = msg.msg_id, read_ct = msg.read_ct, "cannot decode worker message: {e}");
                return;
            }
        };

        self.subscribers.dispatch(&notification);

        if let Err(e) = self.db.archive_message(queue, msg.msg_id).await {
            warn!(msg_id = msg.msg_id, "archive failed: {e}");
            return;
        }
        if let Some(key) = stored_key {
            if let Err(e) = self.blobs.delete(&key).await {
                warn!(key = %key, "stored payload cleanup failed: {e}");
            }
        }
    }
}

/// Replace a `storedPayload` pointer with the stored payload itself.
/// Returns the message plus the blob key it was rehydrated from, if any.
pub async fn rehydrate(
    blobs: &dyn BlobStore,
    mut message: serde_json::Value,
) -> Result<(serde_json::Value, Option<String>)> {
    let key = match message.get(STORED_PAYLOAD_FIELD) {
        None => return Ok((message, None)),
        Some(serde_json::Value::String(key)) => key.clone(),
        Some(other) => {
            return Err(Error::Other(format!(
                "{STORED_PAYLOAD_FIELD} must be a string, got {other}"
            )));
        }
    };

    let bytes = blobs.get(&key).await?;
    let payload: serde_json::Value = serde_json::from_slice(&bytes)?;
    if let Some(object) = message.as_object_mut() {
        object.remove(STORED_PAYLOAD_FIELD);
        object.insert("payload".to_string(), payload);
    }
    Ok((message, Some(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FsBlobStore;
    use serde_json::json;

    #[test]
    fn queue_names_are_pgmq_safe() {
        let settings = RelaySettings {
            topic: "Site-Build".to_string(),
            ..RelaySettings::default()
        };
        let config = PgmqTransportConfig::for_processor("image.resize", &settings);
        assert_eq!(config.worker_queue, "image_resize_jobs");
        assert!(config.reply_topic.starts_with("Site-Build_"));
        assert_eq!(
            config.result_queue,
            queue_name(&format!("{}_image.resize_results", config.reply_topic))
        );
        assert!(config.result_queue.starts_with("site_build_"));
        assert!(config.result_queue.ends_with("_image_resize_results"));
        assert!(config.ephemeral_results);
    }

    #[test]
    fn each_run_replies_on_its_own_queue() {
        let settings = RelaySettings::default();
        let a = PgmqTransportConfig::for_processor("resize", &settings);
        let b = PgmqTransportConfig::for_processor("resize", &settings);
        assert_eq!(a.worker_queue, b.worker_queue);
        assert_ne!(a.reply_topic, b.reply_topic);
        assert_ne!(a.result_queue, b.result_queue);
        // pgmq rejects queue names of 48 characters or more.
        assert!(a.result_queue.len() < 48, "{}", a.result_queue);
    }

    #[test]
    fn blob_keys_are_path_safe() {
        let key = blob_key(&JobId::from("a/b c"));
        assert!(key.starts_with("event-"));
        assert!(!key.contains(['/', '\\', ' ']));
    }

    #[tokio::test]
    async fn similar_ids_keep_separate_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        let a = JobId::from("img.png");
        let b = JobId::from("img_png");
        assert_ne!(blob_key(&a), blob_key(&b));

        blobs.put(&blob_key(&a), b"payload-for-a").await.unwrap();
        blobs.put(&blob_key(&b), b"payload-for-b").await.unwrap();
        assert_eq!(blobs.get(&blob_key(&a)).await.unwrap(), b"payload-for-a");
        assert_eq!(blobs.get(&blob_key(&b)).await.unwrap(), b"payload-for-b");
    }

    fn job_bytes() -> Vec<u8> {
        serde_json::to_vec(&json!({"id": "big", "file": "x".repeat(64)})).unwrap()
    }

    #[tokio::test]
    async fn message_below_threshold_is_sent_inline() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        let message = job_bytes();

        let (body, key) = outbound(&blobs, &JobId::from("big"), &message, message.len() + 1)
            .await
            .unwrap();

        assert!(key.is_none());
        assert_eq!(body, serde_json::from_slice::<serde_json::Value>(&message).unwrap());
        assert!(blobs.get(&blob_key(&JobId::from("big"))).await.is_err());
    }

    #[tokio::test]
    async fn message_at_threshold_is_offloaded() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        let id = JobId::from("big");
        let message = job_bytes();

        let (body, key) = outbound(&blobs, &id, &message, message.len()).await.unwrap();

        let key = key.expect("expected a blob key");
        assert_eq!(body, json!({"id": "big", STORED_PAYLOAD_FIELD: key.clone()}));
        assert_eq!(blobs.get(&key).await.unwrap(), message);
    }

    #[tokio::test]
    async fn message_above_threshold_is_offloaded() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        let message = job_bytes();

        let (body, key) = outbound(&blobs, &JobId::from("big"), &message, message.len() - 1)
            .await
            .unwrap();

        assert_eq!(body["id"], "big");
        assert_eq!(body[STORED_PAYLOAD_FIELD], json!(key.as_deref()));
        assert!(body.get("file").is_none());
    }

    #[tokio::test]
    async fn inline_message_must_be_json() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        let result = outbound(&blobs, &JobId::from("bad"), b"not json", 1024).await;
        assert!(result.is_err());
    }

    #[test]
    fn undecodable_replies_are_retried_a_few_times() {
        assert!(!undeliverable(1));
        assert!(!undeliverable(MAX_DECODE_ATTEMPTS - 1));
        assert!(undeliverable(MAX_DECODE_ATTEMPTS));
        assert!(undeliverable(MAX_DECODE_ATTEMPTS + 3));
    }

    #[tokio::test]
    async fn inline_messages_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        let msg = json!({"type": "JobCompleted", "payload": {"id": "a"}});
        let (out, key) = rehydrate(&blobs, msg.clone()).await.unwrap();
        assert_eq!(out, msg);
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn stored_payload_is_rehydrated() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        blobs
            .put("result-a", br#"{"id":"a","result":{"ok":true}}"#)
            .await
            .unwrap();

        let (out, key) = rehydrate(
            &blobs,
            json!({"type": "JobCompleted", "storedPayload": "result-a"}),
        )
        .await
        .unwrap();

        assert_eq!(key.as_deref(), Some("result-a"));
        assert_eq!(
            out,
            json!({"type": "JobCompleted", "payload": {"id": "a", "result": {"ok": true}}})
        );
    }

    #[tokio::test]
    async fn missing_blob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        let result = rehydrate(&blobs, json!({"type": "JobFailed", "storedPayload": "gone"})).await;
        assert!(result.is_err());
    }
}
