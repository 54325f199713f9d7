//! Jobs: the unit of work shipped to remote workers.
//!
//! A [`WorkItem`] has identity (caller-assigned id), arguments the worker
//! interprets, and a payload that is either in memory or on disk. Its size is
//! measured once at construction and drives memory admission.

use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Job ID
// ---------------------------------------------------------------------------

/// Caller-assigned job identifier. Unique among outstanding jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id, for callers that have no natural key.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Job input data: a buffer, or a path read lazily at serialization time.
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<PathBuf> for Payload {
    fn from(path: PathBuf) -> Self {
        Payload::File(path)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// What a host hands over before the payload has been measured.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub id: JobId,
    pub args: serde_json::Value,
    pub payload: Payload,
}

impl JobRequest {
    pub fn new(id: impl Into<JobId>, payload: impl Into<Payload>) -> Self {
        Self {
            id: id.into(),
            args: serde_json::Value::Null,
            payload: payload.into(),
        }
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A measured job, ready to be serialized and queued.
#[derive(Debug, Clone)]
pub struct WorkItem {
    id: JobId,
    args: serde_json::Value,
    payload: Payload,
    size: u64,
}

impl WorkItem {
    /// Measure the payload and build the item.
    ///
    /// File payloads are sized from metadata without being read. Fails with
    /// [`Error::PayloadIo`] when the file cannot be stat'ed.
    pub async fn new(request: JobRequest) -> Result<Self> {
        let JobRequest { id, args, payload } = request;
        let size = match &payload {
            Payload::Bytes(bytes) => bytes.len() as u64,
            Payload::File(path) => match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(source) => return Err(Error::PayloadIo { id, source }),
            },
        };
        Ok(Self {
            id,
            args,
            payload,
            size,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    /// Payload size in bytes, fixed at construction.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Produce the outbound transport message.
    ///
    /// File payloads are read here, so a file removed since construction
    /// surfaces as [`Error::PayloadIo`].
    pub async fn to_message(&self, topic: &str) -> Result<Vec<u8>> {
        let data = match &self.payload {
            Payload::Bytes(bytes) => STANDARD.encode(bytes),
            Payload::File(path) => match tokio::fs::read(path).await {
                Ok(bytes) => STANDARD.encode(bytes),
                Err(source) => {
                    return Err(Error::PayloadIo {
                        id: self.id.clone(),
                        source,
                    });
                }
            },
        };
        let message = JobMessage {
            id: self.id.clone(),
            file: data,
            action: self.args.clone(),
            topic: topic.to_string(),
        };
        Ok(serde_json::to_vec(&message)?)
    }
}

// ---------------------------------------------------------------------------
// Wire message
// ---------------------------------------------------------------------------

/// Outbound message consumed by workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: JobId,
    /// Base64 of the payload bytes.
    pub file: String,
    /// The caller's arguments, untouched.
    pub action: serde_json::Value,
    /// Where the worker should publish its reply.
    pub topic: String,
}

impl JobMessage {
    pub fn decode_file(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.file)
            .map_err(|e| Error::Other(format!("bad base64 payload in job {}: {e}", self.id)))
    }
}
