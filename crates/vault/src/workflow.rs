//! Workflow entry points: retrieve an archive, list a vault, upload a file.

use std::path::Path;
use std::sync::Arc;

use icebox_protocol::{Inventory, Job, JobAction, JobList, JobParameters, ListJobsFilter, StatusCode};
use icebox_transfer::{SessionStore, SessionSummary, UploadSession};
use icebox_treehash::TreeHasher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::TransferConfig;
use crate::connection::VaultConnection;
use crate::downloader::ChunkedDownloader;
use crate::error::{RemoteError, Stage, VaultError};
use crate::poller::JobPoller;
use crate::retry::with_retry;
use crate::types::{DownloadReport, EventSink, TransferEvent, UploadReport};
use crate::uploader::ChunkedUploader;

/// Runs retrieval and upload workflows against one connection.
///
/// Progress is published as [`TransferEvent`]s on a bounded channel; take
/// the receiver with [`take_events`](Self::take_events) before starting a
/// workflow. Every wait is interrupted by [`cancel_token`](Self::cancel_token).
pub struct VaultClient {
    conn: Arc<dyn VaultConnection>,
    config: TransferConfig,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    cancel: CancellationToken,
}

impl VaultClient {
    pub fn new(conn: Arc<dyn VaultConnection>, config: TransferConfig) -> Result<Self, VaultError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(256);
        Ok(Self {
            conn,
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn events(&self) -> EventSink {
        EventSink::new(self.events_tx.clone())
    }

    fn poller(&self) -> JobPoller<'_> {
        JobPoller::new(
            &*self.conn,
            self.config.retry_policy(),
            self.config.poll_schedule(),
            self.cancel.clone(),
            self.events(),
        )
    }

    fn uploader(&self) -> ChunkedUploader<'_> {
        ChunkedUploader::new(
            &*self.conn,
            self.config.retry_policy(),
            self.cancel.clone(),
            self.events(),
        )
        .abort_on_rejection(self.config.abort_on_rejection)
    }

    // -- Jobs -----------------------------------------------------------

    pub async fn initiate_job(&self, vault: &str, params: JobParameters) -> Result<String, VaultError> {
        self.poller().initiate(vault, params).await
    }

    /// Starts an archive-retrieval job. Returns the job id.
    pub async fn initiate_retrieval(
        &self,
        vault: &str,
        archive_id: &str,
        description: Option<String>,
    ) -> Result<String, VaultError> {
        let mut params = JobParameters::archive_retrieval(archive_id);
        params.description = description;
        self.initiate_job(vault, params).await
    }

    /// Starts an inventory-retrieval job. Returns the job id.
    pub async fn initiate_inventory(
        &self,
        vault: &str,
        description: Option<String>,
    ) -> Result<String, VaultError> {
        let mut params = JobParameters::inventory_retrieval();
        params.description = description;
        self.initiate_job(vault, params).await
    }

    pub async fn describe_job(&self, vault: &str, job_id: &str) -> Result<Job, VaultError> {
        self.poller().describe(vault, job_id).await
    }

    pub async fn list_jobs(&self, vault: &str, filter: ListJobsFilter) -> Result<JobList, VaultError> {
        let mut ctx = self.config.retry_policy().context(format!("list jobs in {vault}"));
        with_retry(&mut ctx, Stage::Polling, &self.cancel, &self.events(), || {
            self.conn.list_jobs(vault, filter.clone())
        })
        .await
    }

    /// Waits for a job to complete, following the configured poll schedule.
    pub async fn poll_until_complete(&self, vault: &str, job_id: &str) -> Result<Job, VaultError> {
        self.poller().wait(vault, job_id).await
    }

    // -- Retrieval ------------------------------------------------------

    /// Downloads a completed retrieval job's archive to `dest`, verifying
    /// every window and the whole file.
    pub async fn download_verified(
        &self,
        vault: &str,
        job: &Job,
        dest: &Path,
    ) -> Result<DownloadReport, VaultError> {
        let downloader = ChunkedDownloader::new(
            &*self.conn,
            self.config.retry_policy(),
            self.config.window_size(),
            self.cancel.clone(),
            self.events(),
        );
        let result = downloader.download(vault, job, dest).await;
        if let Err(e) = &result {
            error!(job_id = %job.job_id, stage = ?e.stage(), error = %e, "download failed");
        }
        result
    }

    /// Initiates, waits for and downloads an archive retrieval.
    pub async fn retrieve_archive(
        &self,
        vault: &str,
        archive_id: &str,
        dest: &Path,
    ) -> Result<DownloadReport, VaultError> {
        let job_id = self.initiate_retrieval(vault, archive_id, None).await?;
        let job = self.poll_until_complete(vault, &job_id).await?;
        self.download_verified(vault, &job, dest).await
    }

    /// Reads and parses a completed inventory job's output.
    ///
    /// The output is fetched whole. If the service asserts a tree hash for
    /// it, a disagreeing body is fetched again.
    pub async fn fetch_inventory(&self, vault: &str, job: &Job) -> Result<Inventory, VaultError> {
        if job.action != JobAction::InventoryRetrieval {
            return Err(VaultError::JobNotReady {
                job_id: job.job_id.clone(),
                reason: "not an inventory retrieval".into(),
            });
        }
        if !job.completed || job.status_code != StatusCode::Succeeded {
            return Err(VaultError::JobNotReady {
                job_id: job.job_id.clone(),
                reason: format!("status {:?}", job.status_code),
            });
        }

        let conn = &*self.conn;
        let job_id = job.job_id.as_str();
        let mut ctx = self.config.retry_policy().context(format!("fetch inventory {job_id}"));
        let body = with_retry(&mut ctx, Stage::Fetch, &self.cancel, &self.events(), move || async move {
            let output = conn.get_job_output(vault, job_id, None).await?;
            let asserted = output.tree_hash;
            let body = output.collect().await?;
            if let Some(expected) = asserted {
                let mut hasher = TreeHasher::new();
                hasher.write(&body);
                let actual = hasher.close();
                if actual != expected {
                    // Retried like a transport failure.
                    return Err(RemoteError::Transport(format!(
                        "inventory tree hash mismatch: expected {expected}, computed {actual}"
                    )));
                }
            }
            Ok(body)
        })
        .await?;

        let inventory: Inventory = serde_json::from_slice(&body)?;
        info!(
            vault,
            job_id,
            archives = inventory.archive_list.len(),
            bytes = inventory.total_size(),
            "inventory retrieved"
        );
        Ok(inventory)
    }

    /// Initiates, waits for and parses an inventory retrieval.
    pub async fn retrieve_inventory(&self, vault: &str) -> Result<Inventory, VaultError> {
        let job_id = self.initiate_inventory(vault, None).await?;
        let job = self.poll_until_complete(vault, &job_id).await?;
        self.fetch_inventory(vault, &job).await
    }

    // -- Upload ---------------------------------------------------------

    /// Computes (or resumes computing) the upload plan for `source`.
    ///
    /// The session record lives next to the source file.
    pub async fn plan_upload(
        &self,
        vault: &str,
        source: &Path,
        description: Option<String>,
    ) -> Result<UploadSession, VaultError> {
        let store = SessionStore::for_source(source);
        self.uploader()
            .plan(vault, source, self.config.part_size(), description, &store)
            .await
    }

    /// Executes or resumes the planned upload of `source`.
    pub async fn upload(&self, source: &Path) -> Result<UploadReport, VaultError> {
        let store = SessionStore::for_source(source);
        let session = load_session(&store)?;
        let result = self.uploader().upload(session, &store).await;
        if let Err(e) = &result {
            error!(source = %source.display(), stage = ?e.stage(), error = %e, "upload failed");
        }
        result
    }

    /// Plans and uploads `source` in one call.
    pub async fn upload_archive(
        &self,
        vault: &str,
        source: &Path,
        description: Option<String>,
    ) -> Result<UploadReport, VaultError> {
        self.plan_upload(vault, source, description).await?;
        self.upload(source).await
    }

    /// Abandons the recorded upload of `source`, remotely and locally.
    pub async fn abort_upload(&self, source: &Path) -> Result<(), VaultError> {
        let store = SessionStore::for_source(source);
        let session = load_session(&store)?;
        self.uploader().abort(&session, &store).await
    }

    /// Describes the recorded upload of `source`, if any.
    pub fn session_summary(&self, source: &Path) -> Result<Option<SessionSummary>, VaultError> {
        let store = SessionStore::for_source(source);
        Ok(store.load()?.map(|s| s.summary()))
    }
}

fn load_session(store: &SessionStore) -> Result<UploadSession, VaultError> {
    store
        .load()?
        .ok_or_else(|| VaultError::NoSession(store.path().to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryVault, Operation};

    fn client(vault: Arc<MemoryVault>) -> VaultClient {
        let config = TransferConfig {
            window_size_mib: 1,
            part_size_mib: 1,
            initial_poll_delay_secs: 60,
            poll_interval_secs: 60,
            ..Default::default()
        };
        VaultClient::new(vault, config).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let config = TransferConfig {
            part_size_mib: 5,
            ..Default::default()
        };
        assert!(matches!(
            VaultClient::new(Arc::new(MemoryVault::new()), config),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn take_events_once() {
        let mut client = client(Arc::new(MemoryVault::new()));
        assert!(client.take_events().is_some());
        assert!(client.take_events().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn inventory_round_trip() {
        let vault = Arc::new(MemoryVault::new());
        let id = vault.put_archive("photos", vec![7u8; 1000], Some("raw".into()));
        vault.set_job_delay(2);
        let client = client(vault.clone());

        let inventory = client.retrieve_inventory("photos").await.unwrap();
        assert_eq!(inventory.archive_list.len(), 1);
        assert_eq!(inventory.find(&id).unwrap().size, 1000);
    }

    #[tokio::test]
    async fn fetch_inventory_requires_inventory_job() {
        let vault = Arc::new(MemoryVault::new());
        let id = vault.put_archive("v", vec![1u8; 10], None);
        let client = client(vault.clone());
        let job_id = client.initiate_retrieval("v", &id, None).await.unwrap();
        let job = client.describe_job("v", &job_id).await.unwrap();

        assert!(matches!(
            client.fetch_inventory("v", &job).await,
            Err(VaultError::JobNotReady { .. })
        ));
    }

    #[tokio::test]
    async fn upload_without_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(Arc::new(MemoryVault::new()));
        let err = client.upload(&dir.path().join("data.bin")).await.unwrap_err();
        assert!(matches!(err, VaultError::NoSession(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn list_jobs_retries_transport_errors() {
        let vault = Arc::new(MemoryVault::new());
        vault.create_vault("v");
        let client = client(vault.clone());
        client.initiate_inventory("v", Some("weekly".into())).await.unwrap();
        vault.fail_next(Operation::ListJobs, RemoteError::Transport("503".into()));

        let list = client.list_jobs("v", ListJobsFilter::default()).await.unwrap();
        assert_eq!(list.jobs.len(), 1);
        assert_eq!(list.jobs[0].job_description.as_deref(), Some("weekly"));
    }
}
