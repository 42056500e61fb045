//! Resumable multipart upload.

use std::path::Path;

use icebox_protocol::{ArchiveCreated, ByteRange};
use icebox_transfer::{
    PartReader, RetryPolicy, SessionStore, SourceIdentity, SpeedCalculator, TransferError,
    UploadSession, hash_file,
};
use icebox_treehash::TreeHash;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{UploadPart, VaultConnection};
use crate::error::{RemoteError, Stage, VaultError};
use crate::retry::{check_cancelled, with_retry};
use crate::types::{EventSink, TransferEvent, UploadReport};

/// Plans and executes multipart uploads backed by a [`SessionStore`].
///
/// Parts go out strictly in index order, one at a time. The session record
/// is saved after every part, so a rerun skips everything already uploaded.
pub struct ChunkedUploader<'a> {
    conn: &'a dyn VaultConnection,
    policy: RetryPolicy,
    cancel: CancellationToken,
    events: EventSink,
    abort_on_rejection: bool,
}

impl<'a> ChunkedUploader<'a> {
    pub fn new(
        conn: &'a dyn VaultConnection,
        policy: RetryPolicy,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Self {
        Self {
            conn,
            policy,
            cancel,
            events,
            abort_on_rejection: false,
        }
    }

    /// Aborts the remote upload and drops the session record when the
    /// service rejects completion.
    pub fn abort_on_rejection(mut self, enabled: bool) -> Self {
        self.abort_on_rejection = enabled;
        self
    }

    /// Creates or resumes the plan for uploading `source` to `vault`.
    ///
    /// An existing record in `store` is resumed if it targets the same vault
    /// and part size; hashing continues at the first unhashed part. A
    /// `description` of `None` keeps the recorded one, a different one is
    /// refused.
    pub async fn plan(
        &self,
        vault: &str,
        source: &Path,
        part_size: u64,
        description: Option<String>,
        store: &SessionStore,
    ) -> Result<UploadSession, VaultError> {
        let existing = run_blocking({
            let store = store.clone();
            move || store.load()
        })
        .await?;

        let mut session = match existing {
            Some(session) => {
                if session.vault != vault
                    || session.part_size != part_size
                    || session.source.path != source
                {
                    return Err(VaultError::SessionMismatch(format!(
                        "{} holds a session for {} to vault {} with {} byte parts",
                        store.path().display(),
                        session.source.path.display(),
                        session.vault,
                        session.part_size
                    )));
                }
                if let Some(wanted) = &description
                    && session.description.as_ref() != Some(wanted)
                {
                    return Err(VaultError::SessionMismatch(format!(
                        "{} was planned with description {:?}, not {wanted:?}",
                        store.path().display(),
                        session.description.as_deref().unwrap_or("")
                    )));
                }
                debug!(
                    path = %store.path().display(),
                    hashed = session.parts.len(),
                    parts = session.part_count,
                    "resuming session"
                );
                session
            }
            None => {
                let identity = run_blocking({
                    let source = source.to_path_buf();
                    move || SourceIdentity::of(&source)
                })
                .await?;
                UploadSession::new(vault, identity, part_size, description)?
            }
        };

        let events = self.events.clone();
        let store_for_plan = store.clone();
        session = run_blocking(move || {
            session.plan(|s| {
                events.emit(TransferEvent::PartPlanned {
                    index: s.parts.len() - 1,
                    total: s.part_count,
                });
                store_for_plan.save(s)
            })?;
            // Saved even when already fully planned.
            store_for_plan.save(&session)?;
            Ok::<_, TransferError>(session)
        })
        .await?;

        Ok(session)
    }

    /// Uploads every pending part of `session` and completes the archive.
    ///
    /// Requires a fully planned session. On success the session record is
    /// removed.
    pub async fn upload(
        &self,
        mut session: UploadSession,
        store: &SessionStore,
    ) -> Result<UploadReport, VaultError> {
        session.ensure_planned()?;
        session = run_blocking(move || {
            session.verify_source()?;
            Ok::<_, TransferError>(session)
        })
        .await?;

        let vault = session.vault.clone();
        let upload_id = match session.upload_id.clone() {
            Some(id) => {
                info!(vault = %vault, upload_id = %id, "resuming multipart upload");
                id
            }
            None => {
                let mut ctx = self.policy.context("initiate multipart upload");
                let id = with_retry(&mut ctx, Stage::Initiation, &self.cancel, &self.events, || {
                    self.conn.initiate_multipart_upload(
                        &vault,
                        session.part_size,
                        session.description.clone(),
                    )
                })
                .await?;
                info!(vault = %vault, upload_id = %id, parts = session.part_count, "multipart upload initiated");
                session.upload_id = Some(id.clone());
                session = save_session(store, session).await?;
                id
            }
        };

        let parts_sent = self.send_parts(&mut session, &upload_id, store).await?;

        let uploaded = session.uploaded_bytes();
        if uploaded != session.source.size {
            return Err(VaultError::SizeMismatch {
                stage: Stage::Upload,
                expected: session.source.size,
                actual: uploaded,
            });
        }

        let tree_hash = self.whole_file_hash(&session).await?;
        let archive = self
            .complete(&mut session, &upload_id, tree_hash, store)
            .await?;

        run_blocking({
            let store = store.clone();
            move || store.remove()
        })
        .await?;

        self.events.emit(TransferEvent::Completed);
        Ok(UploadReport {
            archive,
            bytes: session.source.size,
            parts: session.part_count,
            parts_sent,
            tree_hash,
        })
    }

    /// Cancels the remote upload, if one was started, and deletes the
    /// session record.
    ///
    /// An upload the service no longer knows is treated as already aborted.
    pub async fn abort(&self, session: &UploadSession, store: &SessionStore) -> Result<(), VaultError> {
        if let Some(upload_id) = &session.upload_id {
            let mut ctx = self.policy.context("abort multipart upload");
            let result = with_retry(&mut ctx, Stage::Abort, &self.cancel, &self.events, || {
                self.conn.abort_multipart_upload(&session.vault, upload_id)
            })
            .await;
            match result {
                Ok(()) => {
                    info!(vault = %session.vault, upload_id = %upload_id, "multipart upload aborted")
                }
                Err(VaultError::Rejected {
                    source: RemoteError::NotFound(reason),
                    ..
                }) => {
                    warn!(
                        vault = %session.vault,
                        upload_id = %upload_id,
                        reason = %reason,
                        "multipart upload already gone, dropping session record"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        run_blocking({
            let store = store.clone();
            move || store.remove()
        })
        .await
    }

    async fn send_parts(
        &self,
        session: &mut UploadSession,
        upload_id: &str,
        store: &SessionStore,
    ) -> Result<usize, VaultError> {
        let pending: Vec<usize> = session.pending_parts().collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut reader = run_blocking({
            let path = session.source.path.clone();
            let part_size = session.part_size;
            move || PartReader::open(&path, part_size)
        })
        .await?;

        let mut ctx = self.policy.context(format!("upload parts of {upload_id}"));
        let mut speed = SpeedCalculator::default();
        speed.add_sample(0);
        let vault = session.vault.clone();

        for &index in &pending {
            check_cancelled(&self.cancel)?;

            let (returned, body) = run_blocking(move || {
                let body = reader.read_part(index)?;
                Ok::<_, TransferError>((reader, body))
            })
            .await?;
            reader = returned;

            let range = session.part_range(index)?;
            let planned = session.part(index)?;
            if TreeHash::of(&body) != planned.hash {
                return Err(TransferError::SourceChanged(format!(
                    "{}: part {index} no longer matches its planned hash {}",
                    session.source.path.display(),
                    planned.hash
                ))
                .into());
            }
            let part = UploadPart {
                range: ByteRange {
                    start: range.start,
                    end: range.end - 1,
                },
                linear_hash: planned.hash,
                tree_hash: planned.tree_hash,
                body,
            };
            let len = part.body.len() as u64;

            with_retry(&mut ctx, Stage::Upload, &self.cancel, &self.events, || {
                self.conn.upload_part(&vault, upload_id, part.clone())
            })
            .await?;

            session.mark_uploaded(index)?;
            *session = save_session(store, session.clone()).await?;
            speed.add_sample(len);

            debug!(
                upload_id,
                part = index + 1,
                total = session.part_count,
                range = %part.range,
                "part uploaded"
            );
            self.events.emit(TransferEvent::PartUploaded {
                index,
                uploaded: session.uploaded_count(),
                total: session.part_count,
                bytes_per_second: speed.bytes_per_second(),
            });
        }

        info!(upload_id, parts = pending.len(), "all parts uploaded");
        Ok(pending.len())
    }

    /// Re-hashes the whole source and cross-checks it with the stored part
    /// roots.
    async fn whole_file_hash(&self, session: &UploadSession) -> Result<TreeHash, VaultError> {
        let summary = run_blocking({
            let path = session.source.path.clone();
            move || hash_file(&path)
        })
        .await?;

        if summary.len != session.source.size {
            return Err(VaultError::SizeMismatch {
                stage: Stage::Completion,
                expected: session.source.size,
                actual: summary.len,
            });
        }
        if let Some(combined) = session.combined_tree_hash()
            && combined != summary.tree_hash
        {
            return Err(TransferError::SourceChanged(format!(
                "{}: tree hash {} no longer matches planned parts ({combined})",
                session.source.path.display(),
                summary.tree_hash
            ))
            .into());
        }
        Ok(summary.tree_hash)
    }

    async fn complete(
        &self,
        session: &mut UploadSession,
        upload_id: &str,
        tree_hash: TreeHash,
        store: &SessionStore,
    ) -> Result<ArchiveCreated, VaultError> {
        info!(
            upload_id,
            tree_hash = %tree_hash,
            size = session.source.size,
            "completing multipart upload"
        );
        let mut ctx = self.policy.context("complete multipart upload");
        let result = with_retry(&mut ctx, Stage::Completion, &self.cancel, &self.events, || {
            self.conn.complete_multipart_upload(
                &session.vault,
                upload_id,
                tree_hash,
                session.source.size,
            )
        })
        .await;

        match result {
            Ok(archive) => {
                info!(archive_id = %archive.archive_id, location = %archive.location, "archive created");
                Ok(archive)
            }
            Err(err @ VaultError::Rejected { .. }) if self.abort_on_rejection => {
                warn!(upload_id, error = %err, "completion rejected, aborting upload");
                if let Err(abort_err) = self.abort(session, store).await {
                    warn!(upload_id, error = %abort_err, "abort after rejection failed");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

async fn save_session(
    store: &SessionStore,
    session: UploadSession,
) -> Result<UploadSession, VaultError> {
    let store = store.clone();
    run_blocking(move || {
        store.save(&session)?;
        Ok::<_, TransferError>(session)
    })
    .await
}

/// Runs blocking file work off the async runtime.
async fn run_blocking<T, E, F>(f: F) -> Result<T, VaultError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<VaultError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(VaultError::join)?
        .map_err(Into::into)
}
