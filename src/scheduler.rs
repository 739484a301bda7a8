//! Batch orchestration: drive every corpus document to a terminal ledger state.
//!
//! ## Run sequence
//!
//! ```text
//! preflight ──▶ scan corpus ──▶ lock ledger ──▶ reclaim ──▶ register jobs
//!     ──▶ dispatch (≤ N concurrent) ──▶ summary
//! ```
//!
//! Each dispatched job runs its own retry loop: append RUNNING, invoke the
//! Converter into a scratch directory, repair, match, write outputs, append
//! the outcome. Every transition is committed to the ledger before the job
//! moves on, so a crash at any point leaves a ledger a resumed run can finish.
//!
//! ## Stopping
//!
//! [`StopHandle::stop`] ends dispatch at once. Jobs waiting out a backoff stay
//! PENDING. In-flight jobs get `hard_stop_timeout` to finish; after that their
//! futures are dropped (killing the Converter child) and each receives a
//! PENDING entry so the next run picks it up. An abandoned attempt is not
//! charged to the job's retry budget.

use crate::config::RefineryConfig;
use crate::converter::{CommandConverter, Converter};
use crate::corpus::{scan_corpus, CorpusScan};
use crate::error::{ConverterError, ErrorCategory, RefineryError};
use crate::job::{JobStatus, SourceDocument};
use crate::ledger::{JsonlAppender, LedgerEntry, LedgerLock, LedgerState, RunLedger};
use crate::output::{write_atomic, BatchSummary, JobOutcome};
use crate::pipeline::classify::{ArtifactCategory, ArtifactClassifier};
use crate::pipeline::repair::RepairEngine;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::provenance::{CatalogLink, ProvenanceMatcher};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

// ── Stop handle ──────────────────────────────────────────────────────────────

/// Cloneable stop signal. The CLI wires Ctrl-C to it.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

// ── Dry run report ───────────────────────────────────────────────────────────

/// One document in a dry-run plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedJob {
    pub job_id: String,
    pub source: PathBuf,
    /// Latest ledger status; `None` for a document never seen before.
    pub status: Option<JobStatus>,
    pub attempts: u32,
    pub would_dispatch: bool,
    /// Artifact counts in the stored raw output, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<BTreeMap<ArtifactCategory, usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<CatalogLink>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunReport {
    pub jobs: Vec<PlannedJob>,
    pub would_dispatch: usize,
    pub skipped: usize,
    pub duplicates: usize,
}

// ── Per-run shared state ─────────────────────────────────────────────────────

struct JobTicket {
    doc: SourceDocument,
    /// Failed attempts already charged in the ledger.
    attempts: u32,
}

enum JobResult {
    Succeeded(JobOutcome),
    Failed,
    /// Left PENDING because a stop arrived during backoff.
    Deferred,
}

struct JobReport {
    result: JobResult,
    errors: Vec<ErrorCategory>,
}

enum AttemptError {
    Converter(ConverterError),
    Fatal(RefineryError),
}

impl From<RefineryError> for AttemptError {
    fn from(e: RefineryError) -> Self {
        AttemptError::Fatal(e)
    }
}

struct RunContext {
    ledger: RunLedger,
    links: Option<JsonlAppender>,
    review: Option<JsonlAppender>,
    slots: Mutex<Vec<usize>>,
    callback: ProgressCallback,
}

impl RunContext {
    fn acquire_slot(&self) -> SlotGuard<'_> {
        let id = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or(0);
        SlotGuard {
            slots: &self.slots,
            id,
        }
    }
}

/// A borrowed worker id, returned to the pool on drop.
struct SlotGuard<'a> {
    slots: &'a Mutex<Vec<usize>>,
    id: usize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.id);
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────────

pub struct BatchScheduler {
    config: RefineryConfig,
    converter: Arc<dyn Converter>,
    classifier: ArtifactClassifier,
    engine: Arc<RepairEngine>,
    matcher: Option<Arc<ProvenanceMatcher>>,
    stop: StopHandle,
}

impl BatchScheduler {
    /// Scheduler using `converter`, with the repair dictionary and catalog
    /// taken from `config`.
    pub fn new(config: RefineryConfig, converter: Arc<dyn Converter>) -> Result<Self, RefineryError> {
        let classifier = ArtifactClassifier::new(config.repair.dictionary()?);
        let engine = Arc::new(RepairEngine::new(classifier.clone()));
        let matcher = ProvenanceMatcher::from_config(&config.matcher)?.map(Arc::new);
        Ok(Self {
            config,
            converter,
            classifier,
            engine,
            matcher,
            stop: StopHandle::new(),
        })
    }

    /// Scheduler invoking the configured Converter program.
    pub fn from_config(config: RefineryConfig) -> Result<Self, RefineryError> {
        let converter = CommandConverter::from_config(&config.converter)?;
        Self::new(config, Arc::new(converter))
    }

    pub fn with_matcher(mut self, matcher: ProvenanceMatcher) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    pub fn with_engine(mut self, engine: RepairEngine) -> Self {
        self.engine = Arc::new(engine);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn config(&self) -> &RefineryConfig {
        &self.config
    }

    /// Run the batch over `corpus`. Without `resume`, an existing non-empty
    /// ledger is refused.
    pub async fn run(&self, corpus: &Path, resume: bool) -> Result<BatchSummary, RefineryError> {
        let started = Instant::now();
        let config = &self.config;

        self.converter.preflight()?;
        let scan = scan(corpus).await?;

        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|e| RefineryError::OutputWriteFailed {
                path: config.output_dir.clone(),
                source: e,
            })?;
        let ledger_path = config.ledger_path();
        let mut lock = LedgerLock::acquire(&ledger_path, config.heartbeat_timeout())?;
        lock.start_heartbeat(config.heartbeat_interval());

        let mut state = RunLedger::read_state(&ledger_path)?;
        if !resume && state.entry_count() > 0 {
            return Err(RefineryError::LedgerExists {
                path: ledger_path,
                entries: state.entry_count(),
            });
        }

        let ledger = RunLedger::open(&ledger_path)?;
        let reclaimed = ledger.reclaim(&mut state)?;
        if reclaimed > 0 {
            info!("Returned {reclaimed} interrupted jobs to PENDING");
        }

        let mut summary = BatchSummary {
            duplicates: scan.duplicates.len(),
            ..Default::default()
        };
        let mut batch_ids = Vec::with_capacity(scan.documents.len());
        let mut tickets = Vec::new();
        for doc in scan.documents {
            let job_id = doc.job_id();
            batch_ids.push(job_id.clone());
            match state.job(&job_id).map(|j| (j.status, j.attempt_count)) {
                None => {
                    ledger.commit(&mut state, LedgerEntry::created(&doc))?;
                    tickets.push(JobTicket { doc, attempts: 0 });
                }
                Some((status, _)) if status.is_terminal() => {
                    debug!("{job_id} already {status}, skipping");
                    summary.skipped += 1;
                }
                Some((_, attempts)) => tickets.push(JobTicket { doc, attempts }),
            }
        }

        let (links, review) = if self.matcher.is_some() {
            (
                Some(JsonlAppender::open(&config.links_path())?),
                Some(JsonlAppender::open(&config.review_path())?),
            )
        } else {
            (None, None)
        };
        let workers = config.workers.max(1);
        let ctx = RunContext {
            ledger,
            links,
            review,
            slots: Mutex::new((0..workers).rev().collect()),
            callback: config
                .progress_callback
                .clone()
                .unwrap_or_else(|| Arc::new(NoopProgressCallback)),
        };

        info!(
            "Dispatching {} jobs on {} workers ({} already terminal)",
            tickets.len(),
            workers,
            summary.skipped
        );
        ctx.callback.on_batch_start(tickets.len());

        let fatal = self.dispatch(&ctx, tickets, &mut summary).await;

        // Writes from dropped jobs may still be in flight; the ledger decides
        // which jobs were left RUNNING.
        ctx.ledger.settle().await;
        let mut final_state = RunLedger::read_state(&ledger_path)?;
        let mut fatal = fatal;
        let abandoned: Vec<(String, u32)> = batch_ids
            .iter()
            .filter_map(|id| final_state.job(id))
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| (j.job_id.clone(), j.attempt_count))
            .collect();
        for (job_id, attempt) in abandoned {
            warn!("{job_id}: abandoned after hard stop, returning to PENDING");
            let entry = LedgerEntry::new(job_id, JobStatus::Pending, attempt.saturating_sub(1))
                .with_detail("abandoned after hard stop");
            if let Err(e) = ctx.ledger.commit(&mut final_state, entry) {
                error!("Could not record abandoned job: {e}");
                fatal.get_or_insert(e.into());
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        for id in &batch_ids {
            if let Some(status) = final_state.status(id) {
                *summary.by_status.entry(status).or_insert(0) += 1;
            }
        }
        summary.stopped = self.stop.is_stopped();
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Batch finished: {} succeeded, {} failed, {} incomplete in {:.1}s",
            summary.count(JobStatus::Succeeded),
            summary.count(JobStatus::FailedPermanent),
            summary.incomplete(),
            started.elapsed().as_secs_f64()
        );
        ctx.callback.on_batch_complete(&summary);
        drop(lock);
        Ok(summary)
    }

    /// Drive all tickets; returns the first fatal error, if any.
    async fn dispatch(
        &self,
        ctx: &RunContext,
        tickets: Vec<JobTicket>,
        summary: &mut BatchSummary,
    ) -> Option<RefineryError> {
        let stop = self.stop.clone();
        let results = stream::iter(tickets)
            .take_while(move |_| futures::future::ready(!stop.is_stopped()))
            .map(|ticket| self.run_job(ctx, ticket))
            .buffer_unordered(self.config.workers.max(1));
        tokio::pin!(results);

        let hard_stop = async {
            self.stop.stopped().await;
            info!(
                "Stop requested: waiting up to {}s for in-flight jobs",
                self.config.hard_stop_timeout_secs
            );
            tokio::time::sleep(self.config.hard_stop_timeout()).await;
        };
        tokio::pin!(hard_stop);

        let mut fatal = None;
        loop {
            tokio::select! {
                next = results.next() => match next {
                    None => break,
                    Some(Ok(report)) => tally(summary, report),
                    Some(Err(e)) => {
                        error!("Fatal error, stopping batch: {e}");
                        self.stop.stop();
                        fatal.get_or_insert(e);
                    }
                },
                _ = &mut hard_stop => {
                    warn!("Hard stop timeout elapsed; abandoning in-flight jobs");
                    break;
                }
            }
        }
        fatal
    }

    async fn run_job(&self, ctx: &RunContext, ticket: JobTicket) -> Result<JobReport, RefineryError> {
        let slot = ctx.acquire_slot();
        let doc = &ticket.doc;
        let job_id = doc.job_id();
        let max = self.config.max_attempts;
        let mut attempts = ticket.attempts;
        let mut errors = Vec::new();

        // A PENDING job always gets its attempt: only a failed attempt can end
        // in FAILED_PERMANENT. If `max_attempts` was lowered since the job
        // was charged, this attempt is its last.
        loop {
            attempts += 1;
            ctx.ledger
                .record(&LedgerEntry::new(&job_id, JobStatus::Running, attempts).with_worker(slot.id))
                .await?;
            debug!("{job_id}: attempt {attempts}/{max} on worker {}", slot.id);
            ctx.callback.on_job_start(&job_id, &doc.path, attempts);

            match self.attempt(ctx, doc, &job_id, attempts).await {
                Ok(outcome) => {
                    let mut entry = LedgerEntry::new(&job_id, JobStatus::Succeeded, attempts)
                        .with_output_hash(outcome.repair.output_hash.clone());
                    if outcome.repair.has_pass_errors() {
                        entry = entry.with_detail(outcome.repair.detail.join("; "));
                    }
                    ctx.ledger.record(&entry).await?;

                    if outcome.repair.has_pass_errors() {
                        errors.extend(
                            outcome.repair.detail.iter().map(|_| ErrorCategory::RepairPass),
                        );
                    }
                    if outcome.link.as_ref().is_some_and(|l| !l.is_linked()) {
                        errors.push(ErrorCategory::MatchAmbiguous);
                    }
                    ctx.callback.on_job_complete(&job_id, &doc.path, &outcome);
                    return Ok(JobReport {
                        result: JobResult::Succeeded(outcome),
                        errors,
                    });
                }
                Err(AttemptError::Converter(e)) if e.is_transient() && attempts < max => {
                    let detail = e.to_string();
                    warn!("{job_id}: attempt {attempts}/{max} failed: {detail}");
                    ctx.ledger
                        .record(
                            &LedgerEntry::new(&job_id, JobStatus::FailedRetryable, attempts)
                                .with_error(e.category())
                                .with_detail(&detail),
                        )
                        .await?;
                    ctx.ledger
                        .record(
                            &LedgerEntry::new(&job_id, JobStatus::Pending, attempts)
                                .with_detail("requeued for retry"),
                        )
                        .await?;
                    errors.push(e.category());
                    ctx.callback.on_job_retry(&job_id, &doc.path, attempts, &detail);

                    let delay = self.config.backoff(attempts);
                    debug!("{job_id}: backing off {}ms", delay.as_millis());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.stopped() => {
                            info!("{job_id}: stop requested during backoff, left PENDING");
                            return Ok(JobReport { result: JobResult::Deferred, errors });
                        }
                    }
                }
                Err(AttemptError::Converter(e)) => {
                    let detail = e.to_string();
                    warn!("{job_id}: giving up after attempt {attempts}: {detail}");
                    ctx.ledger
                        .record(
                            &LedgerEntry::new(&job_id, JobStatus::FailedPermanent, attempts)
                                .with_error(e.category())
                                .with_detail(&detail),
                        )
                        .await?;
                    errors.push(e.category());
                    ctx.callback.on_job_failed(&job_id, &doc.path, &detail);
                    return Ok(JobReport {
                        result: JobResult::Failed,
                        errors,
                    });
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
            }
        }
    }

    /// One Converter invocation plus repair, matching and output writes.
    async fn attempt(
        &self,
        ctx: &RunContext,
        doc: &SourceDocument,
        job_id: &str,
        attempt: u32,
    ) -> Result<JobOutcome, AttemptError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| RefineryError::Internal(format!("cannot create scratch dir: {e}")))?;
        let raw_path = scratch.path().join(format!("{job_id}.md"));

        self.converter
            .convert(&doc.path, &raw_path)
            .await
            .map_err(AttemptError::Converter)?;

        let bytes = tokio::fs::read(&raw_path).await.map_err(|e| {
            AttemptError::Converter(ConverterError::transient(format!(
                "cannot read converter output: {e}"
            )))
        })?;
        let raw = String::from_utf8_lossy(&bytes);

        let repaired = self.engine.repair(&raw, Some(job_id));
        let link = self
            .matcher
            .as_ref()
            .map(|m| m.match_document(job_id, &doc.path, &repaired.text));

        let clean_path = self
            .config
            .clean_dir()
            .join(doc.relative_path.with_extension("md"));
        write_atomic(&clean_path, &repaired.text).await?;

        let raw_kept = if self.config.keep_raw {
            let dest = self.config.raw_dir().join(format!("{job_id}.md"));
            write_atomic(&dest, &raw).await?;
            Some(dest)
        } else {
            None
        };

        if let Some(link) = &link {
            if let Some(links) = &ctx.links {
                links.append_async(link).await.map_err(RefineryError::from)?;
            }
            if !link.is_linked() {
                if let Some(review) = &ctx.review {
                    review.append_async(link).await.map_err(RefineryError::from)?;
                }
            }
        }

        Ok(JobOutcome {
            job_id: job_id.to_string(),
            clean_path,
            raw_path: raw_kept,
            repair: repaired.result,
            link,
            attempts: attempt,
        })
    }

    /// Report what a run would do without invoking the Converter or writing
    /// anything.
    pub async fn dry_run(&self, corpus: &Path) -> Result<DryRunReport, RefineryError> {
        let scan = scan(corpus).await?;
        let state = RunLedger::read_state(&self.config.ledger_path())?;
        let mut report = DryRunReport {
            duplicates: scan.duplicates.len(),
            ..Default::default()
        };

        for doc in scan.documents {
            let job_id = doc.job_id();
            let job = state.job(&job_id);
            let status = job.map(|j| j.status);
            let would_dispatch = !status.is_some_and(JobStatus::is_terminal);
            if would_dispatch {
                report.would_dispatch += 1;
            } else {
                report.skipped += 1;
            }

            let raw_path = self.config.raw_dir().join(format!("{job_id}.md"));
            let (artifacts, link) = match tokio::fs::read(&raw_path).await {
                Ok(bytes) => {
                    let raw = String::from_utf8_lossy(&bytes);
                    let mut counts: BTreeMap<ArtifactCategory, usize> =
                        ArtifactCategory::ALL.iter().map(|c| (*c, 0)).collect();
                    for span in self.classifier.classify(&raw) {
                        *counts.entry(span.category).or_insert(0) += 1;
                    }
                    let link = self.matcher.as_ref().map(|m| {
                        let clean = self.engine.repair(&raw, Some(&job_id)).text;
                        m.match_document(&job_id, &doc.path, &clean)
                    });
                    (Some(counts), link)
                }
                Err(_) => (None, None),
            };

            report.jobs.push(PlannedJob {
                job_id,
                source: doc.path,
                status,
                attempts: job.map_or(0, |j| j.attempt_count),
                would_dispatch,
                artifacts,
                link,
            });
        }
        Ok(report)
    }
}

async fn scan(corpus: &Path) -> Result<CorpusScan, RefineryError> {
    let root = corpus.to_path_buf();
    tokio::task::spawn_blocking(move || scan_corpus(&root))
        .await
        .map_err(|e| RefineryError::Internal(format!("corpus scan panicked: {e}")))?
}

fn tally(summary: &mut BatchSummary, report: JobReport) {
    summary.dispatched += 1;
    for e in report.errors {
        *summary.by_error.entry(e).or_insert(0) += 1;
    }
    match report.result {
        JobResult::Succeeded(outcome) => match &outcome.link {
            Some(link) if link.is_linked() => summary.linked += 1,
            Some(_) => summary.unmatched += 1,
            None => {}
        },
        JobResult::Failed | JobResult::Deferred => {}
    }
}
