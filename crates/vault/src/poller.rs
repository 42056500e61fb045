//! Job initiation and completion polling.

use std::time::Duration;

use icebox_protocol::{Job, JobParameters, StatusCode};
use icebox_transfer::RetryPolicy;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::VaultConnection;
use crate::error::{Stage, VaultError};
use crate::retry::{pause, with_retry};
use crate::types::{EventSink, TransferEvent};

/// Observed state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initiated,
    Pending,
    Completed,
    Failed,
}

impl JobState {
    /// Classifies a polled snapshot.
    pub fn of(job: &Job) -> Self {
        match (job.completed, job.status_code) {
            (false, _) => JobState::Pending,
            (true, StatusCode::Failed) => JobState::Failed,
            (true, _) => JobState::Completed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Timing for [`JobPoller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Wait before the first status check.
    pub initial_delay: Duration,
    /// Wait between subsequent checks.
    pub interval: Duration,
    /// Overall limit on time spent waiting, if any.
    pub deadline: Option<Duration>,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3 * 60 * 60),
            interval: Duration::from_secs(15 * 60),
            deadline: None,
        }
    }
}

/// Drives a job from initiation to a terminal state.
pub struct JobPoller<'a> {
    conn: &'a dyn VaultConnection,
    policy: RetryPolicy,
    schedule: PollSchedule,
    cancel: CancellationToken,
    events: EventSink,
}

impl<'a> JobPoller<'a> {
    pub fn new(
        conn: &'a dyn VaultConnection,
        policy: RetryPolicy,
        schedule: PollSchedule,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Self {
        Self {
            conn,
            policy,
            schedule,
            cancel,
            events,
        }
    }

    /// Starts a job and returns its id.
    pub async fn initiate(&self, vault: &str, params: JobParameters) -> Result<String, VaultError> {
        let mut ctx = self.policy.context(format!("initiate {} job", params.kind));
        let job_id = with_retry(&mut ctx, Stage::Initiation, &self.cancel, &self.events, || {
            self.conn.initiate_job(vault, params.clone())
        })
        .await?;

        info!(vault, job_id = %job_id, kind = %params.kind, "job initiated");
        self.events.emit(TransferEvent::JobInitiated {
            job_id: job_id.clone(),
        });
        Ok(job_id)
    }

    /// Fetches one snapshot, retrying transport failures.
    pub async fn describe(&self, vault: &str, job_id: &str) -> Result<Job, VaultError> {
        let mut ctx = self.policy.context(format!("describe job {job_id}"));
        with_retry(&mut ctx, Stage::Polling, &self.cancel, &self.events, || {
            self.conn.describe_job(vault, job_id)
        })
        .await
    }

    /// Polls until the job completes.
    ///
    /// Sleeps `initial_delay` first, then checks every `interval`. A job
    /// that completes with a failure status is a fatal error. Poll failures
    /// share one retry budget that resets after each successful poll.
    ///
    /// With a deadline, no sleep runs past it: the last check happens at
    /// the deadline and a job still pending then ends with `PollDeadline`.
    pub async fn wait(&self, vault: &str, job_id: &str) -> Result<Job, VaultError> {
        let started = Instant::now();
        let mut ctx = self.policy.context(format!("describe job {job_id}"));
        let mut delay = self.schedule.initial_delay;
        let mut polls = 0u32;

        loop {
            let mut final_poll = false;
            if let Some(deadline) = self.schedule.deadline {
                let remaining = deadline.saturating_sub(started.elapsed());
                if delay >= remaining {
                    delay = remaining;
                    final_poll = true;
                }
            }
            debug!(job_id, delay_secs = delay.as_secs(), "waiting before next poll");
            pause(&self.cancel, delay).await?;

            let job = with_retry(&mut ctx, Stage::Polling, &self.cancel, &self.events, || {
                self.conn.describe_job(vault, job_id)
            })
            .await?;
            polls += 1;

            match JobState::of(&job) {
                JobState::Completed => {
                    info!(
                        job_id,
                        polls,
                        size = job.payload_size(),
                        "job completed"
                    );
                    self.events.emit(TransferEvent::JobCompleted {
                        job_id: job_id.to_string(),
                        size: job.payload_size(),
                    });
                    return Ok(job);
                }
                JobState::Failed => {
                    let message = job
                        .status_message
                        .clone()
                        .unwrap_or_else(|| "job failed".into());
                    warn!(job_id, message = %message, "job failed");
                    return Err(VaultError::JobFailed {
                        job_id: job_id.to_string(),
                        message,
                    });
                }
                JobState::Pending | JobState::Initiated => {
                    debug!(job_id, polls, "job pending");
                    self.events.emit(TransferEvent::JobPending {
                        job_id: job_id.to_string(),
                        polls,
                    });
                    if final_poll {
                        let waited = started.elapsed();
                        warn!(job_id, polls, waited = ?waited, "poll deadline reached");
                        return Err(VaultError::PollDeadline {
                            job_id: job_id.to_string(),
                            waited,
                        });
                    }
                    delay = self.schedule.interval;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{JobOutput, RemoteFuture, UploadPart};
    use crate::error::RemoteError;
    use icebox_protocol::{ArchiveCreated, ByteRange, JobAction, JobList, ListJobsFilter};
    use icebox_treehash::TreeHash;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Mock connection that replays scripted `describe_job` results.
    struct MockConn {
        describes: Mutex<Vec<Result<Job, RemoteError>>>,
        initiates: Mutex<Vec<Result<String, RemoteError>>>,
        describe_times: Mutex<Vec<Instant>>,
    }

    impl MockConn {
        fn new() -> Self {
            Self {
                describes: Mutex::new(Vec::new()),
                initiates: Mutex::new(Vec::new()),
                describe_times: Mutex::new(Vec::new()),
            }
        }

        fn push_describe(&self, result: Result<Job, RemoteError>) {
            self.describes.lock().unwrap().push(result);
        }

        fn push_initiate(&self, result: Result<String, RemoteError>) {
            self.initiates.lock().unwrap().push(result);
        }

        fn describe_count(&self) -> usize {
            self.describe_times.lock().unwrap().len()
        }
    }

    fn unused<T>() -> RemoteFuture<'static, T>
    where
        T: Send + 'static,
    {
        Box::pin(async { Err(RemoteError::Rejected("not scripted".into())) })
    }

    impl VaultConnection for MockConn {
        fn initiate_job<'a>(
            &'a self,
            _vault: &'a str,
            _params: JobParameters,
        ) -> RemoteFuture<'a, String> {
            Box::pin(async move {
                let mut queue = self.initiates.lock().unwrap();
                if queue.is_empty() {
                    Err(RemoteError::Rejected("no scripted response".into()))
                } else {
                    queue.remove(0)
                }
            })
        }

        fn describe_job<'a>(&'a self, _vault: &'a str, _job_id: &'a str) -> RemoteFuture<'a, Job> {
            self.describe_times.lock().unwrap().push(Instant::now());
            Box::pin(async move {
                let mut queue = self.describes.lock().unwrap();
                if queue.is_empty() {
                    Err(RemoteError::Rejected("no scripted response".into()))
                } else {
                    queue.remove(0)
                }
            })
        }

        fn list_jobs<'a>(&'a self, _: &'a str, _: ListJobsFilter) -> RemoteFuture<'a, JobList> {
            unused()
        }

        fn get_job_output<'a>(
            &'a self,
            _: &'a str,
            _: &'a str,
            _: Option<ByteRange>,
        ) -> RemoteFuture<'a, JobOutput> {
            unused()
        }

        fn initiate_multipart_upload<'a>(
            &'a self,
            _: &'a str,
            _: u64,
            _: Option<String>,
        ) -> RemoteFuture<'a, String> {
            unused()
        }

        fn upload_part<'a>(&'a self, _: &'a str, _: &'a str, _: UploadPart) -> RemoteFuture<'a, ()> {
            unused()
        }

        fn complete_multipart_upload<'a>(
            &'a self,
            _: &'a str,
            _: &'a str,
            _: TreeHash,
            _: u64,
        ) -> RemoteFuture<'a, ArchiveCreated> {
            unused()
        }

        fn abort_multipart_upload<'a>(&'a self, _: &'a str, _: &'a str) -> RemoteFuture<'a, ()> {
            unused()
        }
    }

    fn job(completed: bool, status: StatusCode) -> Job {
        Job {
            job_id: "job-1".into(),
            action: JobAction::ArchiveRetrieval,
            completed,
            creation_date: chrono::Utc::now(),
            completion_date: None,
            status_code: status,
            status_message: None,
            archive_id: Some("arch-1".into()),
            archive_size_in_bytes: Some(1024),
            inventory_size_in_bytes: None,
            sha256_tree_hash: Some(TreeHash::of(b"x")),
            job_description: None,
            sns_topic: None,
            vault_arn: "arn:vault".into(),
        }
    }

    fn schedule() -> PollSchedule {
        PollSchedule {
            initial_delay: Duration::from_secs(3 * 3600),
            interval: Duration::from_secs(900),
            deadline: None,
        }
    }

    fn poller<'a>(conn: &'a MockConn, schedule: PollSchedule) -> JobPoller<'a> {
        JobPoller::new(
            conn,
            RetryPolicy {
                max_retries: 2,
                ..Default::default()
            },
            schedule,
            CancellationToken::new(),
            EventSink::none(),
        )
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(diff < Duration::from_millis(10), "{actual:?} vs {expected:?}");
    }

    #[test]
    fn job_state_classification() {
        assert_eq!(JobState::of(&job(false, StatusCode::InProgress)), JobState::Pending);
        assert_eq!(JobState::of(&job(true, StatusCode::Succeeded)), JobState::Completed);
        assert_eq!(JobState::of(&job(true, StatusCode::Failed)), JobState::Failed);
        assert!(!JobState::Initiated.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_initial_delay_then_interval() {
        let conn = MockConn::new();
        conn.push_describe(Ok(job(false, StatusCode::InProgress)));
        conn.push_describe(Ok(job(false, StatusCode::InProgress)));
        conn.push_describe(Ok(job(true, StatusCode::Succeeded)));

        let start = Instant::now();
        let done = poller(&conn, schedule()).wait("vault", "job-1").await.unwrap();
        assert!(done.completed);

        let times = conn.describe_times.lock().unwrap().clone();
        assert_eq!(times.len(), 3);
        assert_close(times[0] - start, Duration::from_secs(3 * 3600));
        assert_close(times[1] - times[0], Duration::from_secs(900));
        assert_close(times[2] - times[1], Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried_without_state_change() {
        let conn = MockConn::new();
        conn.push_describe(Err(RemoteError::Transport("timeout".into())));
        conn.push_describe(Err(RemoteError::Transport("timeout".into())));
        conn.push_describe(Ok(job(false, StatusCode::InProgress)));
        conn.push_describe(Err(RemoteError::Transport("timeout".into())));
        conn.push_describe(Err(RemoteError::Transport("timeout".into())));
        conn.push_describe(Ok(job(true, StatusCode::Succeeded)));

        // Two failures either side of a success stay within a ceiling of two.
        let done = poller(&conn, schedule()).wait("vault", "job-1").await.unwrap();
        assert!(done.completed);
        assert_eq!(conn.describe_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failures_exhaust_budget() {
        let conn = MockConn::new();
        for _ in 0..3 {
            conn.push_describe(Err(RemoteError::Transport("timeout".into())));
        }
        let err = poller(&conn, schedule()).wait("vault", "job-1").await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::RetriesExhausted { stage: Stage::Polling, attempts: 3, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_is_fatal() {
        let conn = MockConn::new();
        let mut failed = job(true, StatusCode::Failed);
        failed.status_message = Some("archive unavailable".into());
        conn.push_describe(Ok(failed));

        let err = poller(&conn, schedule()).wait("vault", "job-1").await.unwrap_err();
        assert!(matches!(err, VaultError::JobFailed { ref message, .. } if message == "archive unavailable"));
        assert_eq!(err.stage(), Some(Stage::Polling));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_total_wait() {
        let conn = MockConn::new();
        for _ in 0..10 {
            conn.push_describe(Ok(job(false, StatusCode::InProgress)));
        }
        let mut sched = schedule();
        sched.deadline = Some(Duration::from_secs(4 * 3600 + 60));

        let start = Instant::now();
        let err = poller(&conn, sched).wait("vault", "job-1").await.unwrap_err();
        assert!(matches!(err, VaultError::PollDeadline { .. }));
        // 3 h, four 15 min intervals, then one last check at the deadline.
        let times = conn.describe_times.lock().unwrap().clone();
        assert_eq!(times.len(), 6);
        assert_close(times[4] - start, Duration::from_secs(4 * 3600));
        assert_close(times[5] - start, Duration::from_secs(4 * 3600 + 60));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_shorter_than_initial_delay_still_polls() {
        let conn = MockConn::new();
        conn.push_describe(Ok(job(true, StatusCode::Succeeded)));
        let mut sched = schedule();
        sched.deadline = Some(Duration::from_secs(3600));

        let start = Instant::now();
        let done = poller(&conn, sched).wait("vault", "job-1").await.unwrap();
        assert!(done.completed);
        let times = conn.describe_times.lock().unwrap().clone();
        assert_eq!(times.len(), 1);
        assert_close(times[0] - start, Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_at_short_deadline_gives_up_after_one_poll() {
        let conn = MockConn::new();
        conn.push_describe(Ok(job(false, StatusCode::InProgress)));
        let mut sched = schedule();
        sched.deadline = Some(Duration::from_secs(3600));

        let err = poller(&conn, sched).wait("vault", "job-1").await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::PollDeadline { waited, .. } if waited >= Duration::from_secs(3600)
        ));
        assert_eq!(conn.describe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let conn = MockConn::new();
        let cancel = CancellationToken::new();
        let p = JobPoller::new(
            &conn,
            RetryPolicy::default(),
            schedule(),
            cancel.clone(),
            EventSink::none(),
        );

        let handle = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(p.wait("vault", "job-1"), handle);
        assert!(matches!(result, Err(VaultError::Cancelled)));
        assert_eq!(conn.describe_count(), 0);
    }

    #[tokio::test]
    async fn initiate_emits_event() {
        let conn = MockConn::new();
        conn.push_initiate(Err(RemoteError::Transport("busy".into())));
        conn.push_initiate(Ok("job-9".into()));

        let (tx, mut rx) = mpsc::channel(8);
        let p = JobPoller::new(
            &conn,
            RetryPolicy {
                initial_delay: Duration::ZERO,
                ..Default::default()
            },
            schedule(),
            CancellationToken::new(),
            EventSink::new(tx),
        );
        let id = p
            .initiate("vault", JobParameters::archive_retrieval("arch-1"))
            .await
            .unwrap();
        assert_eq!(id, "job-9");
        assert!(matches!(rx.recv().await, Some(TransferEvent::Retrying { .. })));
        assert_eq!(
            rx.recv().await,
            Some(TransferEvent::JobInitiated {
                job_id: "job-9".into()
            })
        );
    }

    #[tokio::test]
    async fn initiate_rejection_is_fatal() {
        let conn = MockConn::new();
        conn.push_initiate(Err(RemoteError::NotFound("vault".into())));
        let err = poller(&conn, schedule())
            .initiate("vault", JobParameters::inventory_retrieval())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Rejected { stage: Stage::Initiation, .. }));
    }
}
