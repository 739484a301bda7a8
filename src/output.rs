//! Result types returned by the library, plus the atomic file write used for
//! every document the pipeline produces.

use crate::error::{ErrorCategory, RefineryError};
use crate::job::JobStatus;
use crate::pipeline::classify::ArtifactCategory;
use crate::provenance::CatalogLink;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Accounting for one repair call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairResult {
    pub job_id: Option<String>,
    /// Exact fix counts; every category is present, zero when untouched.
    pub fixes_by_category: BTreeMap<ArtifactCategory, usize>,
    /// Lowercase hex SHA-256 of the clean text.
    pub output_hash: String,
    /// One line per skipped pass (or non-settling repair).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detail: Vec<String>,
}

impl RepairResult {
    pub fn total_fixes(&self) -> usize {
        self.fixes_by_category.values().sum()
    }

    pub fn fixes(&self, category: ArtifactCategory) -> usize {
        self.fixes_by_category.get(&category).copied().unwrap_or(0)
    }

    /// True when at least one pass was skipped.
    pub fn has_pass_errors(&self) -> bool {
        !self.detail.is_empty()
    }
}

/// Result of converting one document outside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutput {
    pub source: PathBuf,
    pub job_id: String,
    /// Clean Markdown.
    #[serde(skip)]
    pub markdown: String,
    pub repair: RepairResult,
    /// `None` when no catalog is configured.
    pub link: Option<CatalogLink>,
    pub attempts: u32,
}

impl ConversionOutput {
    /// False when a repair pass was skipped or the document went to review.
    pub fn is_clean(&self) -> bool {
        !self.repair.has_pass_errors() && self.link.as_ref().map_or(true, CatalogLink::is_linked)
    }
}

/// What a worker reports for a job that reached SUCCEEDED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub clean_path: PathBuf,
    pub raw_path: Option<PathBuf>,
    pub repair: RepairResult,
    pub link: Option<CatalogLink>,
    pub attempts: u32,
}

/// End-of-run report. Counts cover the jobs of this batch only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Latest ledger status per job.
    pub by_status: BTreeMap<JobStatus, usize>,
    /// Errors observed during this run, one count per occurrence.
    pub by_error: BTreeMap<ErrorCategory, usize>,
    pub linked: usize,
    pub unmatched: usize,
    /// Jobs already terminal before this run started.
    pub skipped: usize,
    /// Corpus files whose bytes duplicate an earlier file.
    pub duplicates: usize,
    pub dispatched: usize,
    /// True when the run ended because of a stop request.
    pub stopped: bool,
    pub duration_ms: u64,
}

impl BatchSummary {
    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn errors(&self, category: ErrorCategory) -> usize {
        self.by_error.get(&category).copied().unwrap_or(0)
    }

    /// Jobs not yet terminal (resume will pick them up).
    pub fn incomplete(&self) -> usize {
        self.by_status
            .iter()
            .filter(|(s, _)| !s.is_terminal())
            .map(|(_, n)| n)
            .sum()
    }
}

/// Write `contents` to `path` via a sibling temp file and rename, so readers
/// never see a partially written document.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), RefineryError> {
    let fail = |e: std::io::Error| RefineryError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp_path, contents).await.map_err(fail)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(fail)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repair_result(detail: Vec<String>) -> RepairResult {
        RepairResult {
            job_id: None,
            fixes_by_category: ArtifactCategory::ALL.iter().map(|c| (*c, 1)).collect(),
            output_hash: "00".into(),
            detail,
        }
    }

    #[test]
    fn totals() {
        let r = repair_result(vec![]);
        assert_eq!(r.total_fixes(), 5);
        assert_eq!(r.fixes(ArtifactCategory::BrokenUrl), 1);
        assert!(!r.has_pass_errors());
    }

    #[test]
    fn repair_result_json_uses_category_names() {
        let json = serde_json::to_string(&repair_result(vec![])).unwrap();
        assert!(json.contains("\"MISSING_SPACE\":1"), "got: {json}");
        assert!(!json.contains("detail"));
    }

    #[test]
    fn summary_incomplete_counts_non_terminal() {
        let mut s = BatchSummary::default();
        s.by_status.insert(JobStatus::Succeeded, 4);
        s.by_status.insert(JobStatus::Pending, 2);
        s.by_status.insert(JobStatus::FailedPermanent, 1);
        assert_eq!(s.incomplete(), 2);
        assert_eq!(s.count(JobStatus::Succeeded), 4);
        assert_eq!(s.count(JobStatus::Running), 0);
    }

    #[tokio::test]
    async fn write_atomic_creates_parents_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean/sub/doc.md");
        write_atomic(&path, "hello").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert!(!dir.path().join("clean/sub/doc.md.tmp").exists());
    }
}
