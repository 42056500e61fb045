use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use icebox_treehash::{TreeHash, TreeHasher, combine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunked::PartReader;
use crate::{TransferError, validate_part_size, validate_vault_name};

/// Number of `part_size` parts needed to cover `file_size` bytes.
pub fn part_count(file_size: u64, part_size: u64) -> usize {
    if part_size == 0 {
        return 0;
    }
    file_size.div_ceil(part_size) as usize
}

/// Fingerprints and upload state of one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Plain SHA-256 of the part, sent with it as the payload checksum.
    pub hash: TreeHash,
    /// Root fingerprint of the whole part.
    pub tree_hash: TreeHash,
    pub uploaded: bool,
}

/// Identity of the source file a session was planned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub path: PathBuf,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl SourceIdentity {
    /// Reads size and modification time of `path`.
    pub fn of(path: &Path) -> Result<Self, TransferError> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

// ---------------------------------------------------------------------------
// UploadSession
// ---------------------------------------------------------------------------

/// Durable plan and progress of one multipart upload.
///
/// `parts` grows during planning until it holds `part_count` entries. After
/// that, the only mutation is an `uploaded` flag going from false to true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub vault: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub part_size: u64,
    pub source: SourceIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub part_count: usize,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl UploadSession {
    /// Starts an unplanned session for `source`.
    pub fn new(
        vault: impl Into<String>,
        source: SourceIdentity,
        part_size: u64,
        description: Option<String>,
    ) -> Result<Self, TransferError> {
        let vault = vault.into();
        validate_vault_name(&vault)?;
        validate_part_size(part_size)?;
        Ok(Self {
            vault,
            description,
            part_size,
            part_count: part_count(source.size, part_size),
            source,
            upload_id: None,
            parts: Vec::new(),
        })
    }

    /// Hashes every part not yet hashed, calling `checkpoint` after each one.
    ///
    /// Planning resumes at the first unhashed part, so an interrupted run
    /// that persisted its checkpoints continues where it stopped.
    pub fn plan<F>(&mut self, mut checkpoint: F) -> Result<(), TransferError>
    where
        F: FnMut(&UploadSession) -> Result<(), TransferError>,
    {
        self.verify_source()?;
        if self.is_planned() {
            return Ok(());
        }

        let mut reader = PartReader::open(&self.source.path, self.part_size)?;
        let mut hasher = TreeHasher::new();
        for index in self.parts.len()..self.part_count {
            let part = reader.hash_part(index, &mut hasher)?;
            debug!(
                vault = %self.vault,
                part = index + 1,
                total = self.part_count,
                tree_hash = %part.tree_hash,
                "hashed part"
            );
            self.parts.push(part);
            checkpoint(self)?;
        }

        info!(
            vault = %self.vault,
            file = %self.source.path.display(),
            parts = self.part_count,
            "upload planned"
        );
        Ok(())
    }

    /// Fails with `SourceChanged` if the file differs from the recorded
    /// identity.
    pub fn verify_source(&self) -> Result<(), TransferError> {
        let current = SourceIdentity::of(&self.source.path)?;
        if current.size != self.source.size || current.modified != self.source.modified {
            return Err(TransferError::SourceChanged(format!(
                "{}: size {} -> {}",
                self.source.path.display(),
                self.source.size,
                current.size
            )));
        }
        Ok(())
    }

    /// `true` once every part has been hashed.
    pub fn is_planned(&self) -> bool {
        self.parts.len() == self.part_count
    }

    /// Errors unless planning finished.
    pub fn ensure_planned(&self) -> Result<(), TransferError> {
        if self.is_planned() {
            Ok(())
        } else {
            Err(TransferError::SessionIncomplete {
                hashed: self.parts.len(),
                count: self.part_count,
            })
        }
    }

    /// Byte range of part `index` in the source file.
    pub fn part_range(&self, index: usize) -> Result<Range<u64>, TransferError> {
        if index >= self.part_count {
            return Err(TransferError::PartOutOfRange {
                index,
                count: self.part_count,
            });
        }
        let start = index as u64 * self.part_size;
        Ok(start..(start + self.part_size).min(self.source.size))
    }

    pub fn part(&self, index: usize) -> Result<&Part, TransferError> {
        self.parts.get(index).ok_or(TransferError::PartOutOfRange {
            index,
            count: self.parts.len(),
        })
    }

    /// Marks part `index` uploaded. Returns `false` if it already was.
    pub fn mark_uploaded(&mut self, index: usize) -> Result<bool, TransferError> {
        let count = self.parts.len();
        let part = self
            .parts
            .get_mut(index)
            .ok_or(TransferError::PartOutOfRange { index, count })?;
        if part.uploaded {
            return Ok(false);
        }
        part.uploaded = true;
        Ok(true)
    }

    /// Indices of parts not yet uploaded, in increasing order.
    pub fn pending_parts(&self) -> impl Iterator<Item = usize> + '_ {
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.uploaded)
            .map(|(i, _)| i)
    }

    pub fn next_pending(&self) -> Option<usize> {
        self.pending_parts().next()
    }

    pub fn uploaded_count(&self) -> usize {
        self.parts.iter().filter(|p| p.uploaded).count()
    }

    /// Bytes covered by uploaded parts.
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.uploaded)
            .filter_map(|(i, _)| self.part_range(i).ok())
            .map(|r| r.end - r.start)
            .sum()
    }

    /// `true` once planned and every part is uploaded.
    pub fn is_complete(&self) -> bool {
        self.is_planned() && self.parts.iter().all(|p| p.uploaded)
    }

    /// Whole-file root derived from the per-part roots.
    pub fn combined_tree_hash(&self) -> Option<TreeHash> {
        if !self.is_planned() {
            return None;
        }
        let roots: Vec<TreeHash> = self.parts.iter().map(|p| p.tree_hash).collect();
        combine(&roots)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            vault: self.vault.clone(),
            description: self.description.clone(),
            part_size: self.part_size,
            upload_id: self.upload_id.clone(),
            parts_hashed: self.parts.len(),
            parts_uploaded: self.uploaded_count(),
            part_count: self.part_count,
        }
    }
}

/// Human-oriented snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub vault: String,
    pub description: Option<String>,
    pub part_size: u64,
    pub upload_id: Option<String>,
    pub parts_hashed: usize,
    pub parts_uploaded: usize,
    pub part_count: usize,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Vault: {}", self.vault)?;
        writeln!(f, "Description: {}", self.description.as_deref().unwrap_or(""))?;
        writeln!(f, "Part Size: {} MiB", self.part_size / crate::MIB)?;
        writeln!(f, "Upload ID: {}", self.upload_id.as_deref().unwrap_or(""))?;
        if self.parts_hashed < self.part_count {
            writeln!(f, "Parts Hashed: {} / {}", self.parts_hashed, self.part_count)?;
        }
        write!(f, "Parts Uploaded: {} / {}", self.parts_uploaded, self.part_count)
    }
}
