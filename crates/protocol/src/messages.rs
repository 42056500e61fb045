use chrono::{DateTime, Utc};
use icebox_treehash::TreeHash;
use serde::{Deserialize, Serialize};

use crate::types::{Job, JobAction, StatusCode};

/// Body of an initiate-job request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobParameters {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "SNSTopic", default, skip_serializing_if = "Option::is_none")]
    pub sns_topic: Option<String>,
}

impl JobParameters {
    pub fn archive_retrieval(archive_id: impl Into<String>) -> Self {
        Self {
            kind: JobAction::ArchiveRetrieval.request_type().to_string(),
            archive_id: Some(archive_id.into()),
            description: None,
            sns_topic: None,
        }
    }

    pub fn inventory_retrieval() -> Self {
        Self {
            kind: JobAction::InventoryRetrieval.request_type().to_string(),
            archive_id: None,
            description: None,
            sns_topic: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Topic notified when the job completes.
    pub fn with_sns_topic(mut self, topic: impl Into<String>) -> Self {
        self.sns_topic = Some(topic.into());
        self
    }

    /// Action these parameters request, if the `Type` is recognised.
    pub fn action(&self) -> Option<JobAction> {
        match self.kind.as_str() {
            "archive-retrieval" => Some(JobAction::ArchiveRetrieval),
            "inventory-retrieval" => Some(JobAction::InventoryRetrieval),
            _ => None,
        }
    }
}

/// One page of a job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobList {
    #[serde(rename = "JobList")]
    pub jobs: Vec<Job>,
    #[serde(rename = "Marker", default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

/// Filters applied when listing jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListJobsFilter {
    pub completed: Option<bool>,
    pub status_code: Option<StatusCode>,
    pub limit: Option<usize>,
    pub marker: Option<String>,
}

impl ListJobsFilter {
    /// `true` if `job` passes the completion and status filters.
    pub fn matches(&self, job: &Job) -> bool {
        self.completed.is_none_or(|c| c == job.completed)
            && self.status_code.is_none_or(|s| s == job.status_code)
    }
}

/// Output of a completed inventory-retrieval job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Inventory {
    #[serde(rename = "VaultARN")]
    pub vault_arn: String,
    pub inventory_date: DateTime<Utc>,
    pub archive_list: Vec<InventoryArchive>,
}

impl Inventory {
    /// Sum of all archive sizes.
    pub fn total_size(&self) -> u64 {
        self.archive_list.iter().map(|a| a.size).sum()
    }

    pub fn find(&self, archive_id: &str) -> Option<&InventoryArchive> {
        self.archive_list.iter().find(|a| a.archive_id == archive_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InventoryArchive {
    pub archive_id: String,
    #[serde(default)]
    pub archive_description: String,
    pub creation_date: DateTime<Utc>,
    pub size: u64,
    #[serde(rename = "SHA256TreeHash")]
    pub sha256_tree_hash: TreeHash,
}

/// Result of completing a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveCreated {
    pub location: String,
    pub archive_id: String,
    pub checksum: TreeHash,
}
