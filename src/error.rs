//! Error types for workrelay.
//!
//! Every job-scoped variant carries the [`JobId`] it belongs to, so a host
//! adapter can decide per job whether to abort or carry on.

use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read payload for job {id}: {source}")]
    PayloadIo {
        id: JobId,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to publish job {id}: {source}")]
    Publish {
        id: JobId,
        #[source]
        source: Box<Error>,
    },

    /// Worker-reported failure. Displays the worker's message verbatim.
    #[error("{message}")]
    JobFailed { id: JobId, message: String },

    #[error("job timed out {id}")]
    JobTimeout { id: JobId, after: Duration },

    #[error("job {0} is already pending")]
    DuplicateJob(JobId),

    #[error("queue closed before job {0} resolved")]
    Closed(JobId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of [`Error`], for retry/abort policy in callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Publish,
    JobFailed,
    JobTimeout,
    Duplicate,
    Closed,
    Internal,
}

impl Error {
    /// The job this error belongs to, if it is job-scoped.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Error::PayloadIo { id, .. }
            | Error::Publish { id, .. }
            | Error::JobFailed { id, .. }
            | Error::JobTimeout { id, .. }
            | Error::DuplicateJob(id)
            | Error::Closed(id) => Some(id),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PayloadIo { .. } | Error::Io(_) => ErrorKind::Io,
            Error::Publish { .. } => ErrorKind::Publish,
            Error::JobFailed { .. } => ErrorKind::JobFailed,
            Error::JobTimeout { .. } => ErrorKind::JobTimeout,
            Error::DuplicateJob(_) => ErrorKind::Duplicate,
            Error::Closed(_) => ErrorKind::Closed,
            Error::Config(_)
            | Error::Database(_)
            | Error::Serialization(_)
            | Error::Other(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
