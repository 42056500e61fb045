//! Vault workflow error types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use icebox_transfer::TransferError;
use icebox_treehash::TreeHash;

/// Error returned by a [`VaultConnection`](crate::VaultConnection) call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network failure, timeout or server-side error. Safe to retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service refused the request as invalid.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

/// Workflow stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initiation,
    Polling,
    Fetch,
    Verification,
    Upload,
    Completion,
    Abort,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Initiation => "initiation",
            Stage::Polling => "polling",
            Stage::Fetch => "fetch",
            Stage::Verification => "verification",
            Stage::Upload => "upload",
            Stage::Completion => "completion",
            Stage::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a retrieval or upload workflow.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("{stage} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    #[error("{stage} rejected by the service: {source}")]
    Rejected {
        stage: Stage,
        #[source]
        source: RemoteError,
    },

    #[error("archive integrity check failed: expected {expected}, computed {actual}")]
    IntegrityMismatch {
        expected: TreeHash,
        actual: TreeHash,
    },

    #[error("{stage}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        stage: Stage,
        expected: u64,
        actual: u64,
    },

    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("job {job_id} is not ready for download: {reason}")]
    JobNotReady { job_id: String, reason: String },

    #[error("job {job_id} did not complete within {waited:?}")]
    PollDeadline { job_id: String, waited: Duration },

    #[error("session does not match request: {0}")]
    SessionMismatch(String),

    #[error("no upload session recorded at {}", .0.display())]
    NoSession(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl VaultError {
    /// Stage the failure belongs to, when it is tied to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            VaultError::RetriesExhausted { stage, .. }
            | VaultError::Rejected { stage, .. }
            | VaultError::SizeMismatch { stage, .. } => Some(*stage),
            VaultError::IntegrityMismatch { .. } => Some(Stage::Verification),
            VaultError::JobFailed { .. } | VaultError::PollDeadline { .. } => Some(Stage::Polling),
            VaultError::JobNotReady { .. } => Some(Stage::Fetch),
            _ => None,
        }
    }

    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        VaultError::Io(std::io::Error::other(format!("task join error: {err}")))
    }
}
