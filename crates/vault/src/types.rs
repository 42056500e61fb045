//! Shared types for vault workflows.

use std::path::PathBuf;

use icebox_protocol::{ArchiveCreated, ByteRange};
use icebox_treehash::TreeHash;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Stage;

/// Progress notification emitted by the workflows.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    JobInitiated { job_id: String },
    JobPending { job_id: String, polls: u32 },
    JobCompleted { job_id: String, size: Option<u64> },
    WindowVerified {
        range: ByteRange,
        downloaded: u64,
        total: u64,
        bytes_per_second: f64,
    },
    PartPlanned { index: usize, total: usize },
    PartUploaded {
        index: usize,
        uploaded: usize,
        total: usize,
        bytes_per_second: f64,
    },
    Retrying {
        stage: Stage,
        attempt: u32,
        error: String,
    },
    /// Whole-archive fingerprint confirmed.
    Verified { tree_hash: TreeHash },
    Completed,
}

/// Optional, non-blocking destination for [`TransferEvent`]s.
///
/// Events are dropped when no receiver is attached or the channel is full;
/// a slow observer never stalls a transfer.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<TransferEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<TransferEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink that discards every event.
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.tx
            && let Err(e) = tx.try_send(event)
        {
            debug!(error = %e, "progress event dropped");
        }
    }
}

/// Result of a verified archive download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadReport {
    pub job_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub windows: usize,
    pub tree_hash: TreeHash,
}

/// Result of a completed multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub archive: ArchiveCreated,
    pub bytes: u64,
    pub parts: usize,
    /// Parts sent during this run; resumed parts are not counted.
    pub parts_sent: usize,
    pub tree_hash: TreeHash,
}
