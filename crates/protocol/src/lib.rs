//! Wire types for the cold-storage service's job and archive API.
//!
//! Field names follow the service's PascalCase JSON so that job
//! descriptions, job listings and inventories deserialize directly.

pub mod messages;
pub mod types;

pub use messages::{
    ArchiveCreated, Inventory, InventoryArchive, JobList, JobParameters, ListJobsFilter,
};
pub use types::{ByteRange, Job, JobAction, ParseByteRangeError, StatusCode};

pub use icebox_treehash::TreeHash;
