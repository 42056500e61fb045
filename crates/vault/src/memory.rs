//! In-process vault service.
//!
//! `MemoryVault` keeps archives, jobs and multipart uploads in memory and
//! enforces the same checks as the real service: part checksums, range
//! alignment, and the final tree hash and size on completion. Faults can be
//! queued per operation to exercise retry paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use icebox_protocol::{
    ArchiveCreated, ByteRange, Inventory, InventoryArchive, Job, JobAction, JobList,
    JobParameters, ListJobsFilter, StatusCode,
};
use icebox_treehash::{BLOCK_SIZE, TreeHash, TreeHasher};
use tracing::debug;
use uuid::Uuid;

use crate::connection::{JobOutput, RemoteFuture, UploadPart, VaultConnection};
use crate::error::RemoteError;

const DEFAULT_PIECE_SIZE: usize = 256 * 1024;

/// Remote operation, used to target injected faults and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    InitiateJob,
    DescribeJob,
    ListJobs,
    GetJobOutput,
    InitiateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
}

struct StoredArchive {
    data: Vec<u8>,
    description: Option<String>,
    created: DateTime<Utc>,
    tree_hash: TreeHash,
}

struct JobRecord {
    job: Job,
    pending_polls: u32,
    output: Vec<u8>,
}

struct MultipartUpload {
    part_size: u64,
    description: Option<String>,
    parts: BTreeMap<u64, Vec<u8>>,
}

struct VaultState {
    arn: String,
    archives: BTreeMap<String, StoredArchive>,
    jobs: Vec<JobRecord>,
    uploads: HashMap<String, MultipartUpload>,
}

impl VaultState {
    fn new(name: &str) -> Self {
        Self {
            arn: format!("arn:memory:vaults/{name}"),
            archives: BTreeMap::new(),
            jobs: Vec::new(),
            uploads: HashMap::new(),
        }
    }

    fn job_mut(&mut self, job_id: &str) -> Result<&mut JobRecord, RemoteError> {
        self.jobs
            .iter_mut()
            .find(|r| r.job.job_id == job_id)
            .ok_or_else(|| RemoteError::NotFound(format!("job {job_id}")))
    }

    fn upload_mut(&mut self, upload_id: &str) -> Result<&mut MultipartUpload, RemoteError> {
        self.uploads
            .get_mut(upload_id)
            .ok_or_else(|| RemoteError::NotFound(format!("multipart upload {upload_id}")))
    }

    fn inventory(&self) -> Inventory {
        Inventory {
            vault_arn: self.arn.clone(),
            inventory_date: Utc::now(),
            archive_list: self
                .archives
                .iter()
                .map(|(id, a)| InventoryArchive {
                    archive_id: id.clone(),
                    archive_description: a.description.clone().unwrap_or_default(),
                    creation_date: a.created,
                    size: a.data.len() as u64,
                    sha256_tree_hash: a.tree_hash,
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct State {
    vaults: HashMap<String, VaultState>,
    faults: HashMap<Operation, VecDeque<RemoteError>>,
    calls: HashMap<Operation, usize>,
    job_delay: u32,
    job_failure: Option<String>,
    corrupt_outputs: u32,
    received_parts: Vec<ByteRange>,
    requested_ranges: Vec<Option<ByteRange>>,
}

impl State {
    fn vault_mut(&mut self, name: &str) -> Result<&mut VaultState, RemoteError> {
        self.vaults
            .get_mut(name)
            .ok_or_else(|| RemoteError::NotFound(format!("vault {name}")))
    }
}

/// In-memory implementation of [`VaultConnection`].
pub struct MemoryVault {
    state: Mutex<State>,
    piece_size: usize,
}

impl Default for MemoryVault {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVault {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            piece_size: DEFAULT_PIECE_SIZE,
        }
    }

    /// Size of the pieces job output is streamed in.
    pub fn with_piece_size(mut self, piece_size: usize) -> Self {
        self.piece_size = piece_size.max(1);
        self
    }

    pub fn create_vault(&self, name: &str) {
        self.lock()
            .vaults
            .entry(name.to_string())
            .or_insert_with(|| VaultState::new(name));
    }

    /// Stores an archive directly, creating the vault if needed. Returns the
    /// archive id.
    pub fn put_archive(&self, vault: &str, data: Vec<u8>, description: Option<String>) -> String {
        let mut state = self.lock();
        let vault = state
            .vaults
            .entry(vault.to_string())
            .or_insert_with(|| VaultState::new(vault));
        let id = Uuid::new_v4().simple().to_string();
        vault.archives.insert(
            id.clone(),
            StoredArchive {
                tree_hash: tree_hash_of(&data),
                data,
                description,
                created: Utc::now(),
            },
        );
        id
    }

    pub fn archive(&self, vault: &str, archive_id: &str) -> Option<Vec<u8>> {
        self.lock()
            .vaults
            .get(vault)?
            .archives
            .get(archive_id)
            .map(|a| a.data.clone())
    }

    /// Number of multipart uploads still open in `vault`.
    pub fn open_uploads(&self, vault: &str) -> usize {
        self.lock().vaults.get(vault).map_or(0, |v| v.uploads.len())
    }

    /// Queues a failure for the next call to `op`.
    pub fn fail_next(&self, op: Operation, err: RemoteError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Number of `describe_job` calls it takes a new job to complete. Zero
    /// completes jobs on creation.
    pub fn set_job_delay(&self, polls: u32) {
        self.lock().job_delay = polls;
    }

    /// Makes new jobs complete with a failure status and `message`.
    pub fn set_job_failure(&self, message: Option<String>) {
        self.lock().job_failure = message;
    }

    /// Flips a byte in the next `count` job output responses while still
    /// asserting the correct tree hash.
    pub fn corrupt_outputs(&self, count: u32) {
        self.lock().corrupt_outputs = count;
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Byte ranges of every part accepted so far, in arrival order.
    pub fn received_parts(&self) -> Vec<ByteRange> {
        self.lock().received_parts.clone()
    }

    /// Ranges requested from `get_job_output`, in order.
    pub fn requested_ranges(&self) -> Vec<Option<ByteRange>> {
        self.lock().requested_ranges.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call, consumes a queued fault if any, then runs `f`.
    fn call<T>(
        &self,
        op: Operation,
        f: impl FnOnce(&mut State) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(err) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            debug!(operation = ?op, error = %err, "injected fault");
            return Err(err);
        }
        f(&mut state)
    }
}

fn ready<'a, T: Send + 'a>(result: Result<T, RemoteError>) -> RemoteFuture<'a, T> {
    Box::pin(async move { result })
}

fn tree_hash_of(data: &[u8]) -> TreeHash {
    let mut hasher = TreeHasher::new();
    hasher.write(data);
    hasher.close()
}

/// The service only asserts a range's tree hash when the range is aligned
/// to the tree: it starts on a block boundary and ends on one or at the end
/// of the payload.
fn is_tree_aligned(range: ByteRange, total: u64) -> bool {
    let block = BLOCK_SIZE as u64;
    range.start % block == 0 && ((range.end + 1) % block == 0 || range.end + 1 == total)
}

fn complete_job(record: &mut JobRecord, failure: Option<&str>) {
    let job = &mut record.job;
    job.completed = true;
    job.completion_date = Some(Utc::now());
    match failure {
        Some(message) => {
            job.status_code = StatusCode::Failed;
            job.status_message = Some(message.to_string());
            record.output.clear();
        }
        None => {
            job.status_code = StatusCode::Succeeded;
            job.status_message = Some("Succeeded".into());
        }
    }
}

impl VaultConnection for MemoryVault {
    fn initiate_job<'a>(&'a self, vault: &'a str, params: JobParameters) -> RemoteFuture<'a, String> {
        ready(self.call(Operation::InitiateJob, |state| {
            let delay = state.job_delay;
            let failure = state.job_failure.clone();
            let v = state.vault_mut(vault)?;

            let action = params.action().ok_or_else(|| {
                RemoteError::Rejected(format!("unknown job type {:?}", params.kind))
            })?;
            let (output, archive_id, tree_hash) = match action {
                JobAction::ArchiveRetrieval => {
                    let id = params.archive_id.clone().ok_or_else(|| {
                        RemoteError::Rejected("archive retrieval without archive id".into())
                    })?;
                    let archive = v
                        .archives
                        .get(&id)
                        .ok_or_else(|| RemoteError::NotFound(format!("archive {id}")))?;
                    (archive.data.clone(), Some(id), Some(archive.tree_hash))
                }
                JobAction::InventoryRetrieval => {
                    let json = serde_json::to_vec(&v.inventory())
                        .map_err(|e| RemoteError::Transport(e.to_string()))?;
                    (json, None, None)
                }
            };

            let size = output.len() as u64;
            let job_id = Uuid::new_v4().simple().to_string();
            let mut record = JobRecord {
                job: Job {
                    job_id: job_id.clone(),
                    action,
                    completed: false,
                    creation_date: Utc::now(),
                    completion_date: None,
                    status_code: StatusCode::InProgress,
                    status_message: None,
                    archive_size_in_bytes: archive_id.as_ref().map(|_| size),
                    inventory_size_in_bytes: archive_id.is_none().then_some(size),
                    archive_id,
                    sha256_tree_hash: tree_hash,
                    job_description: params.description.clone(),
                    sns_topic: params.sns_topic.clone(),
                    vault_arn: v.arn.clone(),
                },
                pending_polls: delay,
                output,
            };
            if delay == 0 {
                complete_job(&mut record, failure.as_deref());
            }
            debug!(vault, job_id = %job_id, kind = %params.kind, "job created");
            v.jobs.push(record);
            Ok(job_id)
        }))
    }

    fn describe_job<'a>(&'a self, vault: &'a str, job_id: &'a str) -> RemoteFuture<'a, Job> {
        ready(self.call(Operation::DescribeJob, |state| {
            let failure = state.job_failure.clone();
            let record = state.vault_mut(vault)?.job_mut(job_id)?;
            if !record.job.completed {
                record.pending_polls = record.pending_polls.saturating_sub(1);
                if record.pending_polls == 0 {
                    complete_job(record, failure.as_deref());
                }
            }
            Ok(record.job.clone())
        }))
    }

    fn list_jobs<'a>(&'a self, vault: &'a str, filter: ListJobsFilter) -> RemoteFuture<'a, JobList> {
        ready(self.call(Operation::ListJobs, |state| {
            let v = state.vault_mut(vault)?;
            let start = match &filter.marker {
                Some(marker) => {
                    v.jobs
                        .iter()
                        .position(|r| &r.job.job_id == marker)
                        .ok_or_else(|| RemoteError::Rejected(format!("invalid marker {marker}")))?
                        + 1
                }
                None => 0,
            };
            let limit = filter.limit.unwrap_or(usize::MAX);

            let mut matching = v.jobs[start..]
                .iter()
                .map(|r| &r.job)
                .filter(|job| filter.matches(job));
            let jobs: Vec<Job> = matching.by_ref().take(limit).cloned().collect();
            let marker = match (matching.next(), jobs.last()) {
                (Some(_), Some(last)) => Some(last.job_id.clone()),
                _ => None,
            };
            Ok(JobList { jobs, marker })
        }))
    }

    fn get_job_output<'a>(
        &'a self,
        vault: &'a str,
        job_id: &'a str,
        range: Option<ByteRange>,
    ) -> RemoteFuture<'a, JobOutput> {
        let piece_size = self.piece_size;
        ready(self.call(Operation::GetJobOutput, |state| {
            state.requested_ranges.push(range);
            let corrupt = state.corrupt_outputs > 0;
            if corrupt {
                state.corrupt_outputs -= 1;
            }

            let record = state.vault_mut(vault)?.job_mut(job_id)?;
            if !record.job.completed || record.job.status_code != StatusCode::Succeeded {
                return Err(RemoteError::Rejected(format!(
                    "job {job_id} has no output available"
                )));
            }

            let total = record.output.len() as u64;
            let (mut data, tree_hash) = match range {
                None => (record.output.clone(), record.job.sha256_tree_hash),
                Some(r) if r.end < total => {
                    let data = record.output[r.start as usize..=r.end as usize].to_vec();
                    let hash = is_tree_aligned(r, total).then(|| tree_hash_of(&data));
                    (data, hash)
                }
                Some(r) => {
                    return Err(RemoteError::Rejected(format!(
                        "range {r} outside job output of {total} bytes"
                    )));
                }
            };
            if corrupt && let Some(byte) = data.first_mut() {
                *byte ^= 0xff;
            }
            Ok(JobOutput::from_bytes(data, tree_hash, piece_size))
        }))
    }

    fn initiate_multipart_upload<'a>(
        &'a self,
        vault: &'a str,
        part_size: u64,
        description: Option<String>,
    ) -> RemoteFuture<'a, String> {
        ready(self.call(Operation::InitiateMultipartUpload, |state| {
            icebox_transfer::validate_part_size(part_size)
                .map_err(|e| RemoteError::Rejected(e.to_string()))?;
            let v = state.vault_mut(vault)?;
            let upload_id = Uuid::new_v4().simple().to_string();
            v.uploads.insert(
                upload_id.clone(),
                MultipartUpload {
                    part_size,
                    description,
                    parts: BTreeMap::new(),
                },
            );
            debug!(vault, upload_id = %upload_id, part_size, "multipart upload created");
            Ok(upload_id)
        }))
    }

    fn upload_part<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        part: UploadPart,
    ) -> RemoteFuture<'a, ()> {
        ready(self.call(Operation::UploadPart, |state| {
            let upload = state.vault_mut(vault)?.upload_mut(upload_id)?;
            let len = part.body.len() as u64;

            if part.range.start % upload.part_size != 0 {
                return Err(RemoteError::Rejected(format!(
                    "range {} not aligned to part size {}",
                    part.range, upload.part_size
                )));
            }
            if len != part.range.len() || len > upload.part_size {
                return Err(RemoteError::Rejected(format!(
                    "body of {len} bytes does not fit range {}",
                    part.range
                )));
            }
            if TreeHash::of(&part.body) != part.linear_hash {
                return Err(RemoteError::Rejected("linear hash mismatch".into()));
            }
            let actual = tree_hash_of(&part.body);
            if actual != part.tree_hash {
                return Err(RemoteError::Rejected(format!(
                    "tree hash mismatch for range {}: computed {actual}",
                    part.range
                )));
            }

            upload.parts.insert(part.range.start, part.body);
            state.received_parts.push(part.range);
            Ok(())
        }))
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        tree_hash: TreeHash,
        archive_size: u64,
    ) -> RemoteFuture<'a, ArchiveCreated> {
        ready(self.call(Operation::CompleteMultipartUpload, |state| {
            let v = state.vault_mut(vault)?;
            let upload = v.upload_mut(upload_id)?;

            let mut data = Vec::new();
            for (&start, body) in &upload.parts {
                if start != data.len() as u64 {
                    return Err(RemoteError::Rejected(format!(
                        "missing part at offset {}",
                        data.len()
                    )));
                }
                data.extend_from_slice(body);
            }
            if data.len() as u64 != archive_size {
                return Err(RemoteError::Rejected(format!(
                    "archive size {archive_size} does not match {} uploaded bytes",
                    data.len()
                )));
            }
            let actual = tree_hash_of(&data);
            if actual != tree_hash {
                return Err(RemoteError::Rejected(format!(
                    "tree hash {tree_hash} does not match uploaded parts ({actual})"
                )));
            }

            let description = upload.description.clone();
            v.uploads.remove(upload_id);
            let archive_id = Uuid::new_v4().simple().to_string();
            v.archives.insert(
                archive_id.clone(),
                StoredArchive {
                    data,
                    description,
                    created: Utc::now(),
                    tree_hash: actual,
                },
            );
            debug!(vault, upload_id, archive_id = %archive_id, "archive assembled");
            Ok(ArchiveCreated {
                location: format!("/vaults/{vault}/archives/{archive_id}"),
                archive_id,
                checksum: actual,
            })
        }))
    }

    fn abort_multipart_upload<'a>(&'a self, vault: &'a str, upload_id: &'a str) -> RemoteFuture<'a, ()> {
        ready(self.call(Operation::AbortMultipartUpload, |state| {
            state
                .vault_mut(vault)?
                .uploads
                .remove(upload_id)
                .map(|_| ())
                .ok_or_else(|| RemoteError::NotFound(format!("multipart upload {upload_id}")))
        }))
    }
}
