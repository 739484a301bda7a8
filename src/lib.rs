//! # pdf-refinery
//!
//! Batch PDF-to-text conversion with deterministic artifact repair, a
//! crash-resumable run ledger and catalog provenance matching.
//!
//! ## Why this crate?
//!
//! PDF-to-Markdown converters leave predictable damage behind: mojibake from
//! the wrong code page, sentences broken across blank lines, words glued
//! together after punctuation, URLs split across lines. On a corpus of
//! thousands of documents the converter itself also crashes, times out or
//! chokes on corrupt input. This crate wraps any external converter binary
//! in a scheduler that records every job transition in an append-only ledger,
//! retries what is worth retrying, repairs the text with idempotent rule-based
//! passes, and links each output back to its catalog record.
//!
//! ## Pipeline Overview
//!
//! ```text
//! corpus/
//!  │
//!  ├─ 1. Scan      walk, hash (SHA-256), dedupe → one job per distinct PDF
//!  ├─ 2. Ledger    lock, reclaim dead RUNNING jobs, register new jobs
//!  ├─ 3. Convert   external Converter, ≤ N concurrent, retry with backoff
//!  ├─ 4. Repair    MOJIBAKE → SENTENCE_BREAK → MISSING_SPACE → CAMELCASE → URL
//!  ├─ 5. Match     score catalog candidates; below threshold → review.jsonl
//!  └─ 6. Output    clean/<path>.md + links.jsonl + SUCCEEDED ledger entry
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_refinery::{BatchScheduler, RefineryConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RefineryConfig::builder()
//!         .converter_program("marker_single")
//!         .workers(4)
//!         .output_dir("refinery-out")
//!         .build()?;
//!     let scheduler = BatchScheduler::from_config(config)?;
//!     let summary = scheduler.run(Path::new("corpus"), true).await?;
//!     eprintln!("{} incomplete", summary.incomplete());
//!     Ok(())
//! }
//! ```
//!
//! Repair alone needs no Converter:
//!
//! ```rust
//! use pdf_refinery::RepairEngine;
//!
//! let repaired = RepairEngine::default().repair("Hello.World", None);
//! assert_eq!(repaired.text, "Hello. World");
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `refinery` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! pdf-refinery = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod converter;
pub mod corpus;
pub mod error;
pub mod job;
pub mod ledger;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod provenance;
pub mod scheduler;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ConverterConfig, FailureKind, FailureRule, FileConfig, MatcherConfig, RefineryConfig,
    RefineryConfigBuilder, RepairConfig,
};
pub use convert::{convert, convert_document, convert_sync, convert_to_file, repair_file};
pub use converter::{CommandConverter, Converter, FailureClassifier};
pub use corpus::{scan_corpus, CorpusScan};
pub use error::{CatalogError, ConverterError, ErrorCategory, LedgerError, RefineryError, RepairPassError};
pub use job::{ConversionJob, JobStatus, SourceDocument};
pub use ledger::{LedgerEntry, LedgerState, RunLedger};
pub use output::{BatchSummary, ConversionOutput, JobOutcome, RepairResult};
pub use pipeline::classify::{ArtifactCategory, ArtifactClassifier, ArtifactSpan};
pub use pipeline::dictionary::Dictionary;
pub use pipeline::repair::{RepairEngine, RepairPass, Repaired};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use provenance::{
    Catalog, CatalogLink, CatalogRecord, JsonlCatalog, LinkTarget, ProvenanceMatcher,
    UnmatchedReason,
};
pub use scheduler::{BatchScheduler, DryRunReport, PlannedJob, StopHandle};
