//! Remote-service boundary.
//!
//! `VaultConnection` is implemented by the embedding application on top of
//! its signed HTTP client. Keeping the boundary a trait lets the workflows
//! run against [`MemoryVault`](crate::MemoryVault) or a test mock.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use icebox_protocol::{ArchiveCreated, ByteRange, Job, JobList, JobParameters, ListJobsFilter};
use icebox_treehash::TreeHash;

use crate::error::RemoteError;

/// Boxed future returned by every remote call.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Body and asserted fingerprint of a job's output (or a range of it).
pub struct JobOutput {
    /// Payload bytes, delivered in arbitrary-sized pieces.
    pub body: BoxStream<'static, Result<Vec<u8>, RemoteError>>,
    /// Tree hash the service asserts for the returned bytes, if it sent one.
    pub tree_hash: Option<TreeHash>,
}

impl JobOutput {
    /// Output backed by an in-memory buffer, split into `piece` sized items.
    pub fn from_bytes(data: Vec<u8>, tree_hash: Option<TreeHash>, piece: usize) -> Self {
        let piece = piece.max(1);
        let pieces: Vec<Result<Vec<u8>, RemoteError>> =
            data.chunks(piece).map(|c| Ok(c.to_vec())).collect();
        Self {
            body: stream::iter(pieces).boxed(),
            tree_hash,
        }
    }

    /// Reads the whole body into memory.
    pub async fn collect(mut self) -> Result<Vec<u8>, RemoteError> {
        let mut data = Vec::new();
        while let Some(piece) = self.body.next().await {
            data.extend_from_slice(&piece?);
        }
        Ok(data)
    }
}

impl fmt::Debug for JobOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOutput")
            .field("tree_hash", &self.tree_hash)
            .finish_non_exhaustive()
    }
}

/// One part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    /// Inclusive byte range of the part within the archive.
    pub range: ByteRange,
    pub body: Vec<u8>,
    pub tree_hash: TreeHash,
    /// Plain SHA-256 of `body`.
    pub linear_hash: TreeHash,
}

/// Abstract connection to the cold-storage service.
///
/// One connection serves one workflow at a time. Implementations report
/// network failures as [`RemoteError::Transport`] so callers can retry them.
pub trait VaultConnection: Send + Sync {
    /// Starts an archive or inventory retrieval job. Returns the job id.
    fn initiate_job<'a>(&'a self, vault: &'a str, params: JobParameters)
    -> RemoteFuture<'a, String>;

    fn describe_job<'a>(&'a self, vault: &'a str, job_id: &'a str) -> RemoteFuture<'a, Job>;

    fn list_jobs<'a>(&'a self, vault: &'a str, filter: ListJobsFilter)
    -> RemoteFuture<'a, JobList>;

    /// Fetches a completed job's output. `None` requests the whole payload.
    fn get_job_output<'a>(
        &'a self,
        vault: &'a str,
        job_id: &'a str,
        range: Option<ByteRange>,
    ) -> RemoteFuture<'a, JobOutput>;

    /// Starts a multipart upload. Returns the upload id.
    fn initiate_multipart_upload<'a>(
        &'a self,
        vault: &'a str,
        part_size: u64,
        description: Option<String>,
    ) -> RemoteFuture<'a, String>;

    fn upload_part<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        part: UploadPart,
    ) -> RemoteFuture<'a, ()>;

    /// Finishes a multipart upload. The service recomputes the archive's
    /// tree hash and size and rejects the call if either disagrees.
    fn complete_multipart_upload<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        tree_hash: TreeHash,
        archive_size: u64,
    ) -> RemoteFuture<'a, ArchiveCreated>;

    fn abort_multipart_upload<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
    ) -> RemoteFuture<'a, ()>;
}
