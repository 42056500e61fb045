//! Verified, windowed download of a completed job's output.

use std::fmt;
use std::path::Path;

use futures_util::StreamExt;
use icebox_protocol::{ByteRange, Job, StatusCode};
use icebox_transfer::{ArchiveWriter, RetryPolicy, SpeedCalculator};
use icebox_treehash::{TreeHash, TreeHasher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::connection::VaultConnection;
use crate::error::{RemoteError, Stage, VaultError};
use crate::retry::{Retryable, back_off, check_cancelled};
use crate::types::{DownloadReport, EventSink, TransferEvent};

/// Why a window could not be committed.
#[derive(Debug)]
enum WindowError {
    Remote(RemoteError),
    Mismatch {
        range: ByteRange,
        expected: TreeHash,
        actual: TreeHash,
    },
    Empty(ByteRange),
    Oversized { range: ByteRange, received: u64 },
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowError::Remote(e) => e.fmt(f),
            WindowError::Mismatch {
                range,
                expected,
                actual,
            } => write!(
                f,
                "tree hash mismatch for bytes {range}: expected {expected}, computed {actual}"
            ),
            WindowError::Empty(range) => write!(f, "empty response for bytes {range}"),
            WindowError::Oversized { range, received } => {
                write!(f, "received {received} bytes for range {range}")
            }
        }
    }
}

impl Retryable for WindowError {
    fn is_retryable(&self) -> bool {
        match self {
            WindowError::Remote(e) => e.is_retryable(),
            WindowError::Mismatch { .. } | WindowError::Empty(_) => true,
            WindowError::Oversized { .. } => false,
        }
    }

    fn into_fatal(self, stage: Stage) -> VaultError {
        match self {
            WindowError::Remote(e) => e.into_fatal(stage),
            WindowError::Oversized { range, received } => VaultError::SizeMismatch {
                stage,
                expected: range.len(),
                actual: received,
            },
            other => VaultError::RetriesExhausted {
                stage,
                attempts: 0,
                last_error: other.to_string(),
            },
        }
    }
}

/// Downloads a completed job's output window by window.
///
/// Each window is fetched, its tree hash compared with the one the service
/// asserts, and only then appended to the destination. After the last window
/// the whole file is re-read and checked against the job's tree hash.
pub struct ChunkedDownloader<'a> {
    conn: &'a dyn VaultConnection,
    policy: RetryPolicy,
    window_size: u64,
    cancel: CancellationToken,
    events: EventSink,
}

impl<'a> ChunkedDownloader<'a> {
    pub fn new(
        conn: &'a dyn VaultConnection,
        policy: RetryPolicy,
        window_size: u64,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Self {
        Self {
            conn,
            policy,
            window_size,
            cancel,
            events,
        }
    }

    /// Downloads `job`'s output into `dest`, truncating any existing file.
    pub async fn download(
        &self,
        vault: &str,
        job: &Job,
        dest: &Path,
    ) -> Result<DownloadReport, VaultError> {
        let (total, expected) = ready_payload(job)?;
        if self.window_size == 0 {
            return Err(VaultError::Config("window size must be positive".into()));
        }

        let mut writer = tokio::task::spawn_blocking({
            let dest = dest.to_path_buf();
            move || ArchiveWriter::create(&dest)
        })
        .await
        .map_err(VaultError::join)??;

        info!(
            vault,
            job_id = %job.job_id,
            total_bytes = total,
            window = self.window_size,
            dest = %dest.display(),
            "download started"
        );

        let mut ctx = self.policy.context(format!("fetch job {}", job.job_id));
        let mut hasher = TreeHasher::new();
        let mut speed = SpeedCalculator::default();
        speed.add_sample(0);
        let mut offset = 0u64;
        let mut windows = 0usize;

        while let Some(range) = ByteRange::window(offset, self.window_size, total) {
            check_cancelled(&self.cancel)?;

            let data = match self.fetch_window(vault, &job.job_id, range, &mut hasher).await {
                Ok(data) => data,
                Err(e) => {
                    back_off(&mut ctx, Stage::Fetch, e, &self.cancel, &self.events).await?;
                    continue;
                }
            };

            let received = data.len() as u64;
            writer = tokio::task::spawn_blocking(move || {
                writer.append(&data)?;
                Ok::<_, VaultError>(writer)
            })
            .await
            .map_err(VaultError::join)??;

            offset += received;
            windows += 1;
            ctx.record_success();
            speed.add_sample(received);

            debug!(
                job_id = %job.job_id,
                range = %range,
                downloaded = offset,
                total_bytes = total,
                "window verified"
            );
            self.events.emit(TransferEvent::WindowVerified {
                range,
                downloaded: offset,
                total,
                bytes_per_second: speed.bytes_per_second(),
            });
        }

        if writer.written() != total {
            return Err(VaultError::SizeMismatch {
                stage: Stage::Verification,
                expected: total,
                actual: writer.written(),
            });
        }

        let summary = tokio::task::spawn_blocking(move || writer.verify())
            .await
            .map_err(VaultError::join)??;
        if summary.tree_hash != expected {
            error!(
                job_id = %job.job_id,
                expected = %expected,
                actual = %summary.tree_hash,
                dest = %dest.display(),
                "downloaded archive failed verification"
            );
            return Err(VaultError::IntegrityMismatch {
                expected,
                actual: summary.tree_hash,
            });
        }

        info!(
            job_id = %job.job_id,
            bytes = total,
            windows,
            tree_hash = %expected,
            "download verified"
        );
        self.events.emit(TransferEvent::Verified {
            tree_hash: expected,
        });
        self.events.emit(TransferEvent::Completed);

        Ok(DownloadReport {
            job_id: job.job_id.clone(),
            path: dest.to_path_buf(),
            bytes: total,
            windows,
            tree_hash: expected,
        })
    }

    /// Fetches one window and checks it against the asserted tree hash.
    async fn fetch_window(
        &self,
        vault: &str,
        job_id: &str,
        range: ByteRange,
        hasher: &mut TreeHasher,
    ) -> Result<Vec<u8>, WindowError> {
        hasher.reset();
        let output = self
            .conn
            .get_job_output(vault, job_id, Some(range))
            .await
            .map_err(WindowError::Remote)?;

        let mut body = output.body;
        let mut data = Vec::with_capacity(range.len() as usize);
        while let Some(piece) = body.next().await {
            let piece = piece.map_err(WindowError::Remote)?;
            hasher.write(&piece);
            data.extend_from_slice(&piece);
        }

        if data.is_empty() {
            return Err(WindowError::Empty(range));
        }
        if data.len() as u64 > range.len() {
            return Err(WindowError::Oversized {
                range,
                received: data.len() as u64,
            });
        }

        let actual = hasher.close();
        match output.tree_hash {
            Some(expected) if expected != actual => {
                return Err(WindowError::Mismatch {
                    range,
                    expected,
                    actual,
                });
            }
            Some(_) => {}
            None => debug!(job_id, range = %range, "no tree hash for window"),
        }
        hasher.reset();
        Ok(data)
    }
}

/// Size and tree hash of a job that can be downloaded.
fn ready_payload(job: &Job) -> Result<(u64, TreeHash), VaultError> {
    let not_ready = |reason: &str| VaultError::JobNotReady {
        job_id: job.job_id.clone(),
        reason: reason.to_string(),
    };
    if !job.completed {
        return Err(not_ready("job has not completed"));
    }
    if job.status_code != StatusCode::Succeeded {
        return Err(not_ready("job did not succeed"));
    }
    let size = job
        .payload_size()
        .ok_or_else(|| not_ready("payload size unknown"))?;
    let tree_hash = job
        .sha256_tree_hash
        .ok_or_else(|| not_ready("payload tree hash unknown"))?;
    Ok((size, tree_hash))
}
