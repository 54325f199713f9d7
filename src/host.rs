//! Host adapter: turns host job requests into processor calls and replies.
//!
//! The host speaks the same `{type, payload}` envelopes as workers. A
//! `JOB_CREATED` names a processor; jobs for processors we do not run are
//! refused with `JOB_NOT_WHITELISTED` rather than failed.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, trace, warn};

use crate::job::{JobId, JobRequest, Payload};
use crate::notification::Envelope;
use crate::processor::ProcessorQueue;

pub const JOB_CREATED: &str = "JOB_CREATED";
pub const JOB_COMPLETED: &str = "JOB_COMPLETED";
pub const JOB_FAILED: &str = "JOB_FAILED";
pub const JOB_NOT_WHITELISTED: &str = "JOB_NOT_WHITELISTED";
pub const LOG_ACTION: &str = "LOG_ACTION";

/// Payload of a `JOB_CREATED` host message.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedJob {
    pub id: JobId,
    /// Processor that should run the job.
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    /// Input file, if the job has one.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl CreatedJob {
    fn into_request(self) -> JobRequest {
        let payload = match self.file {
            Some(path) => Payload::File(path),
            None => Payload::Bytes(Vec::new()),
        };
        JobRequest::new(self.id, payload).args(self.args)
    }
}

/// Routes host messages to processor queues by name.
#[derive(Default, Clone)]
pub struct Dispatcher {
    processors: HashMap<String, ProcessorQueue>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, processor: ProcessorQueue) {
        self.processors.insert(name.into(), processor);
    }

    pub fn processor(&self, name: &str) -> Option<&ProcessorQueue> {
        self.processors.get(name)
    }

    /// Handle one host message. Returns the reply to send back, if any.
    pub async fn handle(&self, message: serde_json::Value) -> Option<Envelope> {
        let envelope: Envelope = match serde_json::from_value(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("ignoring malformed host message: {e}");
                return None;
            }
        };

        match envelope.kind.as_str() {
            JOB_CREATED => {
                let job: CreatedJob = match serde_json::from_value(envelope.payload) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!("ignoring JOB_CREATED with bad payload: {e}");
                        return None;
                    }
                };
                Some(self.run(job).await)
            }
            LOG_ACTION => {
                trace!("log action from host");
                None
            }
            other => {
                warn!(kind = other, "ignoring host message");
                None
            }
        }
    }

    async fn run(&self, job: CreatedJob) -> Envelope {
        let id = job.id.clone();
        let Some(processor) = self.processors.get(&job.name) else {
            info!(job.id = %id, processor = %job.name, "no processor registered");
            return Envelope::new(JOB_NOT_WHITELISTED, json!({ "id": id }));
        };

        debug!(job.id = %id, processor = %job.name, "incoming job");
        match processor.process(job.into_request()).await {
            Ok(result) => Envelope::new(JOB_COMPLETED, json!({ "id": id, "result": result })),
            Err(e) => {
                error!(job.id = %id, error = %e, "processing failed");
                Envelope::new(JOB_FAILED, json!({ "id": id, "error": e.to_string() }))
            }
        }
    }
}
