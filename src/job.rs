//! Job identity and the per-job state machine.
//!
//! ```text
//! PENDING ──dispatch──▶ RUNNING ──success──▶ SUCCEEDED
//! RUNNING ──transient──▶ FAILED_RETRYABLE ──requeue──▶ PENDING
//! RUNNING ──transient, attempts == max──▶ FAILED_PERMANENT
//! RUNNING ──permanent──▶ FAILED_PERMANENT
//! RUNNING ──heartbeat lost / abandoned──▶ PENDING
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One PDF in the corpus. Identity is `content_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub path: PathBuf,
    /// Path relative to the corpus root; decides where the clean output lands.
    pub relative_path: PathBuf,
    /// Lowercase hex SHA-256 of the file bytes.
    pub content_hash: String,
    pub byte_size: u64,
}

impl SourceDocument {
    /// Stable job id derived from the content hash, so the same bytes map to
    /// the same ledger history on every run.
    pub fn job_id(&self) -> String {
        job_id_for_hash(&self.content_hash)
    }
}

pub fn job_id_for_hash(content_hash: &str) -> String {
    let prefix: String = content_hash.chars().take(16).collect();
    format!("job-{prefix}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    FailedRetryable,
    Succeeded,
    FailedPermanent,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::FailedRetryable,
        JobStatus::Succeeded,
        JobStatus::FailedPermanent,
    ];

    /// No further automatic transition happens from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::FailedPermanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::FailedRetryable => "FAILED_RETRYABLE",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::FailedPermanent => "FAILED_PERMANENT",
        }
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, FailedRetryable)
                | (Running, FailedPermanent)
                | (Running, Pending)
                | (FailedRetryable, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current view of one job, reduced from its ledger entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub job_id: String,
    pub source: Option<PathBuf>,
    pub content_hash: Option<String>,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub assigned_worker: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
