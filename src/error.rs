//! Error types for the pdf-refinery library.
//!
//! The error types follow the blast radius of each failure:
//!
//! * [`RefineryError`]: **Fatal to the call**: the requested operation
//!   cannot proceed (bad input file, converter missing, ledger unwritable).
//!   Returned as `Err(RefineryError)` from the top-level entry points.
//!
//! * [`ConverterError`]: **Job-local**: one Converter invocation failed.
//!   Transient failures are retried with backoff; permanent ones end the job.
//!   Inside a batch they only ever show up in that job's ledger entries.
//!
//! * [`RepairPassError`]: **Document-local**: one repair pass failed on one
//!   document. The pass is skipped and the error is recorded in
//!   [`crate::output::RepairResult::detail`]; it never fails the job.
//!
//! * [`LedgerError`]: the only batch-fatal class. Resumability depends on
//!   the ledger, so a ledger that cannot be written stops the run.
//!
//! Ambiguous catalog matches are not errors at all: they are recorded as an
//! [`crate::provenance::UnmatchedReason`] and routed to manual review.

use crate::pipeline::classify::ArtifactCategory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf-refinery library.
#[derive(Debug, Error)]
pub enum RefineryError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The corpus directory does not exist or is not a directory.
    #[error("Corpus directory not found: '{path}'")]
    CorpusNotFound { path: PathBuf },

    /// Reading a corpus file failed while hashing it.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Converter errors ──────────────────────────────────────────────────
    /// The configured Converter program could not be resolved.
    #[error("Converter '{program}' is not available: {detail}\nSet --converter or [converter].program.")]
    ConverterUnavailable { program: String, detail: String },

    /// Single-document mode: the Converter failed after all retries.
    #[error(transparent)]
    Converter(#[from] ConverterError),

    // ── Ledger errors ─────────────────────────────────────────────────────
    /// The run ledger could not be read or written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A batch was started without `--resume` on top of existing history.
    #[error("Ledger '{path}' already holds {entries} entries.\nPass --resume to continue that run, or choose a fresh --out directory.")]
    LedgerExists { path: PathBuf, entries: usize },

    /// Another scheduler refreshed the ledger lock recently.
    #[error("Ledger '{path}' is owned by a running scheduler (pid {pid}, heartbeat {age_secs}s ago)")]
    SchedulerBusy {
        path: PathBuf,
        pid: u32,
        age_secs: u64,
    },

    // ── Catalog errors ────────────────────────────────────────────────────
    /// The catalog could not be loaded.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or config-file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failed Converter invocation, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConverterError {
    /// Timeout, resource exhaustion, or an unrecognised failure: retried.
    #[error("transient converter failure: {detail}")]
    Transient { detail: String },

    /// Malformed, unsupported, or corrupt source PDF: never retried.
    #[error("permanent converter failure: {detail}")]
    Permanent { detail: String },
}

impl ConverterError {
    pub fn transient(detail: impl Into<String>) -> Self {
        ConverterError::Transient {
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        ConverterError::Permanent {
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ConverterError::Transient { .. })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ConverterError::Transient { .. } => ErrorCategory::TransientConverter,
            ConverterError::Permanent { .. } => ErrorCategory::PermanentConverter,
        }
    }
}

/// A single repair pass failed on one document.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{category} pass skipped: {detail}")]
pub struct RepairPassError {
    pub category: ArtifactCategory,
    pub detail: String,
}

/// Failures of the append-only run ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialise ledger entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("ledger lock '{path}' is unusable: {detail}")]
    Lock { path: PathBuf, detail: String },
}

/// Failures loading or querying the external catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog '{path}' line {line}: {detail}")]
    Parse {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    #[error("catalog query failed: {0}")]
    Query(String),
}

/// Error taxonomy used by the batch summary report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TransientConverter,
    PermanentConverter,
    RepairPass,
    MatchAmbiguous,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::TransientConverter => "transient_converter",
            ErrorCategory::PermanentConverter => "permanent_converter",
            ErrorCategory::RepairPass => "repair_pass",
            ErrorCategory::MatchAmbiguous => "match_ambiguous",
        };
        f.write_str(s)
    }
}
