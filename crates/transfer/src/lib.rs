//! Resumable multipart upload planning, bounded retries and local
//! archive I/O for cold-storage transfers.

mod chunked;
mod progress;
mod retry;
mod session;
mod store;
mod validation;

pub use chunked::{ArchiveWriter, PartReader, hash_file, hash_file_range};
pub use progress::SpeedCalculator;
pub use retry::{RetryContext, RetryDecision, RetryPolicy};
pub use session::{Part, SessionSummary, SourceIdentity, UploadSession, part_count};
pub use store::{SESSION_VERSION, SessionStore};
pub use validation::{validate_part_size, validate_vault_name};

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Largest part size the service accepts: 4 GiB.
pub const MAX_PART_SIZE: u64 = 4 * 1024 * MIB;

/// Default multipart part size: 8 MiB.
pub const DEFAULT_PART_SIZE: u64 = 8 * MIB;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported session record version {found} (expected {expected})")]
    UnsupportedSessionVersion { found: u32, expected: u32 },

    #[error("invalid part size {0}: must be 1 MiB times a power of two, at most 4 GiB")]
    InvalidPartSize(u64),

    #[error("invalid vault name: {0}")]
    InvalidVaultName(String),

    #[error("source file changed since the session was planned: {0}")]
    SourceChanged(String),

    #[error("part {index} out of range (session has {count} parts)")]
    PartOutOfRange { index: usize, count: usize },

    #[error("session is incomplete: {hashed} of {count} parts hashed")]
    SessionIncomplete { hashed: usize, count: usize },
}
