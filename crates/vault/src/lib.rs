//! Reliable transfer of large archives to and from a cold-storage vault.
//!
//! This crate holds the **workflow logic** only. The embedding application
//! supplies a [`VaultConnection`] on top of its signed HTTP client;
//! [`MemoryVault`] stands in for the service in tests.
//!
//! # Retrieval
//!
//! 1. **Initiate** a retrieval job
//! 2. **Poll** until the job completes ([`JobPoller`])
//! 3. **Download** the output in verified windows ([`ChunkedDownloader`])
//!
//! # Upload
//!
//! 1. **Plan** the session: hash every part, persisting after each one
//! 2. **Upload** pending parts in order ([`ChunkedUploader`])
//! 3. **Complete** with the whole-file tree hash and size

pub mod config;
pub mod connection;
pub mod downloader;
pub mod error;
pub mod memory;
pub mod poller;
mod retry;
pub mod types;
pub mod uploader;
pub mod workflow;

pub use config::TransferConfig;
pub use connection::{JobOutput, RemoteFuture, UploadPart, VaultConnection};
pub use downloader::ChunkedDownloader;
pub use error::{RemoteError, Stage, VaultError};
pub use memory::{MemoryVault, Operation};
pub use poller::{JobPoller, JobState, PollSchedule};
pub use types::{DownloadReport, EventSink, TransferEvent, UploadReport};
pub use uploader::ChunkedUploader;
pub use workflow::VaultClient;
