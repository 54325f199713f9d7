//! Inbound worker notifications.
//!
//! Workers report `{type, payload}` envelopes. Anything that does not parse
//! into a known, well-formed notification becomes [`Notification::Unknown`]
//! so the registry can log it and move on.

use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Raw `{type, payload}` envelope shared by worker and host messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// The `payload.id` string, if present.
    pub fn payload_id(&self) -> Option<JobId> {
        self.payload
            .get("id")
            .and_then(|v| v.as_str())
            .map(JobId::from)
    }
}

/// A decoded worker notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    JobCompleted {
        id: JobId,
        result: serde_json::Value,
    },
    JobFailed {
        id: JobId,
        error: String,
    },
    Unknown {
        kind: String,
    },
}

impl Notification {
    /// Decode a raw message. Never fails; bad shapes map to `Unknown`.
    pub fn from_value(value: serde_json::Value) -> Self {
        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(_) => {
                return Notification::Unknown {
                    kind: "<malformed>".to_string(),
                };
            }
        };

        let Some(id) = envelope.payload_id() else {
            return Notification::Unknown {
                kind: envelope.kind,
            };
        };

        match envelope.kind.as_str() {
            "JobCompleted" | "JOB_COMPLETED" => Notification::JobCompleted {
                id,
                result: envelope
                    .payload
                    .get("result")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            },
            "JobFailed" | "JOB_FAILED" => Notification::JobFailed {
                id,
                error: envelope
                    .payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown worker error")
                    .to_string(),
            },
            _ => Notification::Unknown {
                kind: envelope.kind,
            },
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Notification::JobCompleted { id, .. } | Notification::JobFailed { id, .. } => Some(id),
            Notification::Unknown { .. } => None,
        }
    }
}
