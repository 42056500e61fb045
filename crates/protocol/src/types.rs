use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use icebox_treehash::TreeHash;
use serde::{Deserialize, Serialize};

/// Kind of asynchronous job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobAction {
    ArchiveRetrieval,
    InventoryRetrieval,
}

impl JobAction {
    /// Value used for the `Type` field when initiating a job.
    pub fn request_type(self) -> &'static str {
        match self {
            JobAction::ArchiveRetrieval => "archive-retrieval",
            JobAction::InventoryRetrieval => "inventory-retrieval",
        }
    }
}

/// Server-side job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    InProgress,
    Succeeded,
    Failed,
}

/// Snapshot of a job as reported by the service.
///
/// Read-only from the client's point of view; the only transition observed
/// locally is `completed` flipping to `true` between polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    pub job_id: String,
    pub action: JobAction,
    pub completed: bool,
    pub creation_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<DateTime<Utc>>,
    pub status_code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size_in_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_size_in_bytes: Option<u64>,
    #[serde(
        rename = "SHA256TreeHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sha256_tree_hash: Option<TreeHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_description: Option<String>,
    #[serde(rename = "SNSTopic", default, skip_serializing_if = "Option::is_none")]
    pub sns_topic: Option<String>,
    #[serde(rename = "VaultARN")]
    pub vault_arn: String,
}

impl Job {
    /// Size of the retrievable payload, once known.
    pub fn payload_size(&self) -> Option<u64> {
        match self.action {
            JobAction::ArchiveRetrieval => self.archive_size_in_bytes,
            JobAction::InventoryRetrieval => self.inventory_size_in_bytes,
        }
    }

    /// `true` once the job finished with a failure status.
    pub fn is_failed(&self) -> bool {
        self.completed && self.status_code == StatusCode::Failed
    }
}

// ---------------------------------------------------------------------------
// ByteRange
// ---------------------------------------------------------------------------

/// Inclusive byte range `[start, end]` of a job's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Error returned when a `"start-end"` range string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid byte range: {0:?}")]
pub struct ParseByteRangeError(pub String);

impl ByteRange {
    /// Window of at most `size` bytes starting at `offset`, clamped to
    /// `total` bytes. Returns `None` when `offset` is past the end or
    /// `size` is zero.
    pub fn window(offset: u64, size: u64, total: u64) -> Option<Self> {
        if offset >= total || size == 0 {
            return None;
        }
        let end = offset.saturating_add(size).min(total) - 1;
        Some(Self { start: offset, end })
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for ByteRange {
    type Err = ParseByteRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseByteRangeError(s.to_string());
        let (start, end) = s.split_once('-').ok_or_else(err)?;
        let start: u64 = start.trim().parse().map_err(|_| err())?;
        let end: u64 = end.trim().parse().map_err(|_| err())?;
        if end < start {
            return Err(err());
        }
        Ok(Self { start, end })
    }
}
