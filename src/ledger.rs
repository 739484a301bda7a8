//! The append-only run ledger.
//!
//! `ledger.jsonl` holds one [`LedgerEntry`] per line, one line per state
//! transition. Nothing is ever rewritten: the current state of a job is the
//! status of its most recent entry, computed by [`LedgerState`]. That makes
//! the file safe to `tail -f`, safe to read while a batch is running, and the
//! only thing a resumed run needs.
//!
//! ## Durability
//!
//! Each entry is serialised to a complete line first and then written with a
//! single `write_all` under a mutex, followed by `sync_data`. Concurrent
//! workers therefore never interleave partial records. A crash can at worst
//! leave a torn final line, which readers skip.
//!
//! Workers append through [`RunLedger::record`], which moves the write and
//! the fsync onto tokio's blocking pool. A write outlives a dropped caller;
//! [`RunLedger::settle`] waits for all of them.
//!
//! ## Ownership
//!
//! A running scheduler holds `ledger.jsonl.lock` and refreshes its mtime every
//! heartbeat interval. A lock whose mtime is older than the heartbeat timeout
//! belongs to a dead scheduler: the next scheduler takes it over and moves
//! every job still marked RUNNING back to PENDING.
//!
//! ## Attempts
//!
//! `attempt` counts Converter invocations that count against the retry
//! budget. A RUNNING entry carries the number of the attempt it starts. When
//! that attempt never finishes (reclaimed after a crash, abandoned after a
//! hard stop) the PENDING entry that follows carries one less, so the
//! interrupted attempt is retried rather than charged.

use crate::error::{ErrorCategory, LedgerError, RefineryError};
use crate::job::{ConversionJob, JobStatus, SourceDocument};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One state transition of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub job_id: String,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    /// Attempts charged to the retry budget; on RUNNING, the attempt being
    /// started.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LedgerEntry {
    pub fn new(job_id: impl Into<String>, status: JobStatus, attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            timestamp: Utc::now(),
            attempt,
            worker: None,
            source: None,
            content_hash: None,
            error: None,
            output_hash: None,
            detail: None,
        }
    }

    /// The PENDING entry that creates a job.
    pub fn created(doc: &SourceDocument) -> Self {
        let mut e = Self::new(doc.job_id(), JobStatus::Pending, 0);
        e.source = Some(doc.path.clone());
        e.content_hash = Some(doc.content_hash.clone());
        e
    }

    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_error(mut self, error: ErrorCategory) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_output_hash(mut self, hash: impl Into<String>) -> Self {
        self.output_hash = Some(hash.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ── JSONL append/read ────────────────────────────────────────────────────────

/// Line-atomic JSONL appender shared by the ledger, links and review files.
#[derive(Debug)]
pub struct JsonlAppender {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    pending: Arc<PendingWrites>,
}

/// Writes handed to the blocking pool and not yet on disk.
#[derive(Debug, Default)]
struct PendingWrites {
    count: AtomicUsize,
    idle: Notify,
}

struct PendingGuard(Arc<PendingWrites>);

impl PendingGuard {
    fn new(pending: &Arc<PendingWrites>) -> Self {
        pending.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(pending))
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl JsonlAppender {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let io = |e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
            pending: Arc::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append on the calling thread. For startup and shutdown bookkeeping,
    /// when no worker is running.
    pub fn append<T: Serialize>(&self, value: &T) -> Result<(), LedgerError> {
        write_line(&self.file, &self.path, &encode_line(value)?)
    }

    /// Append from the blocking pool so the fsync does not stall a runtime
    /// worker. The write completes even if this future is dropped.
    pub async fn append_async<T: Serialize>(&self, value: &T) -> Result<(), LedgerError> {
        let line = encode_line(value)?;
        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        let guard = PendingGuard::new(&self.pending);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            write_line(&file, &path, &line)
        })
        .await
        .map_err(|e| LedgerError::Io {
            path: self.path.clone(),
            source: std::io::Error::other(format!("writer task failed: {e}")),
        })?
    }

    /// Wait until every [`append_async`](Self::append_async) write has
    /// reached the file, including writes whose caller was dropped.
    pub async fn settle(&self) {
        loop {
            let idle = self.pending.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, LedgerError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

fn write_line(file: &Mutex<File>, path: &Path, line: &[u8]) -> Result<(), LedgerError> {
    let mut file = file.lock().map_err(|_| LedgerError::Lock {
        path: path.to_path_buf(),
        detail: "writer mutex poisoned".into(),
    })?;
    let io = |e| LedgerError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    file.write_all(line).map_err(io)?;
    file.sync_data().map_err(io)?;
    Ok(())
}

/// Read every parseable record. Returns the records and the number of
/// malformed lines skipped. A missing file reads as empty.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize), LedgerError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => {
            return Err(LedgerError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()
        .map_err(|e| LedgerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    let mut records = Vec::with_capacity(lines.len());
    let mut skipped = 0;
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(r) => records.push(r),
            Err(e) if Some(i) == last => {
                warn!("{}: ignoring torn final line: {e}", path.display());
                skipped += 1;
            }
            Err(e) => {
                warn!("{}:{}: skipping malformed line: {e}", path.display(), i + 1);
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}

// ── State reducer ────────────────────────────────────────────────────────────

/// Current state of every job, last entry per job wins.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    jobs: HashMap<String, ConversionJob>,
    order: Vec<String>,
    entries: usize,
    skipped_lines: usize,
    illegal_transitions: usize,
}

impl LedgerState {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut state = Self::default();
        for e in entries {
            state.apply(e);
        }
        state
    }

    /// Fold one entry into the state. A transition the state machine does not
    /// allow is still applied, last entry wins, but logged.
    pub fn apply(&mut self, entry: &LedgerEntry) {
        self.entries += 1;
        if let Some(prev) = self.status(&entry.job_id) {
            if !prev.can_transition_to(entry.status) {
                warn!(
                    job_id = %entry.job_id,
                    "unexpected ledger transition {prev} -> {}",
                    entry.status
                );
                self.illegal_transitions += 1;
            }
        }
        let job = self
            .jobs
            .entry(entry.job_id.clone())
            .or_insert_with(|| {
                self.order.push(entry.job_id.clone());
                ConversionJob {
                    job_id: entry.job_id.clone(),
                    source: None,
                    content_hash: None,
                    status: entry.status,
                    attempt_count: 0,
                    assigned_worker: None,
                    created_at: entry.timestamp,
                    updated_at: entry.timestamp,
                }
            });
        job.status = entry.status;
        job.attempt_count = entry.attempt;
        job.updated_at = entry.timestamp;
        job.assigned_worker = match entry.status {
            JobStatus::Running => entry.worker,
            _ => entry.worker.or(job.assigned_worker),
        };
        if entry.source.is_some() {
            job.source = entry.source.clone();
        }
        if entry.content_hash.is_some() {
            job.content_hash = entry.content_hash.clone();
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|j| j.status)
    }

    pub fn job(&self, job_id: &str) -> Option<&ConversionJob> {
        self.jobs.get(job_id)
    }

    /// Jobs in the order they first appeared in the ledger.
    pub fn jobs(&self) -> impl Iterator<Item = &ConversionJob> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    pub fn running(&self) -> Vec<&ConversionJob> {
        self.with_status(JobStatus::Running)
    }

    pub fn with_status(&self, status: JobStatus) -> Vec<&ConversionJob> {
        self.jobs().filter(|j| j.status == status).collect()
    }

    pub fn counts(&self) -> BTreeMap<JobStatus, usize> {
        let mut counts = BTreeMap::new();
        for job in self.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn terminal_count(&self) -> usize {
        self.jobs.values().filter(|j| j.status.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Entries folded so far.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Malformed lines skipped while reading.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Entries whose transition the state machine does not allow.
    pub fn illegal_transitions(&self) -> usize {
        self.illegal_transitions
    }
}

// ── Ledger ───────────────────────────────────────────────────────────────────

/// Writer handle on `ledger.jsonl`.
#[derive(Debug)]
pub struct RunLedger {
    log: JsonlAppender,
}

impl RunLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        Ok(Self {
            log: JsonlAppender::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        debug!(
            job_id = %entry.job_id,
            status = %entry.status,
            attempt = entry.attempt,
            "ledger append"
        );
        self.log.append(entry)
    }

    /// [`append`](Self::append) from a worker: the write runs on the
    /// blocking pool.
    pub async fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        debug!(
            job_id = %entry.job_id,
            status = %entry.status,
            attempt = entry.attempt,
            "ledger append"
        );
        self.log.append_async(entry).await
    }

    /// Wait for every [`record`](Self::record) write to land.
    pub async fn settle(&self) {
        self.log.settle().await
    }

    pub fn read_entries(path: &Path) -> Result<(Vec<LedgerEntry>, usize), LedgerError> {
        read_jsonl(path)
    }

    /// Reduce the ledger at `path`. A missing ledger is an empty state.
    pub fn read_state(path: &Path) -> Result<LedgerState, LedgerError> {
        let (entries, skipped) = Self::read_entries(path)?;
        let mut state = LedgerState::from_entries(&entries);
        state.skipped_lines = skipped;
        Ok(state)
    }

    /// Append `entry` and fold it into `state`.
    pub fn commit(&self, state: &mut LedgerState, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.append(&entry)?;
        state.apply(&entry);
        Ok(())
    }

    /// Return every job left RUNNING by a dead scheduler to PENDING, and
    /// requeue every job whose last entry is FAILED_RETRYABLE. The interrupted
    /// attempt of a RUNNING job is not charged. Only call this while holding
    /// the [`LedgerLock`].
    pub fn reclaim(&self, state: &mut LedgerState) -> Result<usize, LedgerError> {
        let stale: Vec<(String, JobStatus, u32)> = state
            .jobs()
            .filter(|j| matches!(j.status, JobStatus::Running | JobStatus::FailedRetryable))
            .map(|j| (j.job_id.clone(), j.status, j.attempt_count))
            .collect();

        for (job_id, status, attempt) in &stale {
            let (detail, charged) = if *status == JobStatus::Running {
                warn!("Reclaiming {job_id}: RUNNING with no live heartbeat");
                ("reclaimed: no heartbeat", attempt.saturating_sub(1))
            } else {
                info!("Requeueing {job_id} after restart");
                ("requeued after restart", *attempt)
            };
            self.commit(
                state,
                LedgerEntry::new(job_id.clone(), JobStatus::Pending, charged).with_detail(detail),
            )?;
        }
        Ok(stale.len())
    }
}

// ── Ownership lock ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: DateTime<Utc>,
}

pub fn lock_path(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    ledger_path.with_file_name(name)
}

/// Exclusive ownership of a ledger, kept alive by a heartbeat.
/// Dropping it stops the heartbeat and removes the lock file.
#[derive(Debug)]
pub struct LedgerLock {
    path: PathBuf,
    heartbeat: Option<JoinHandle<()>>,
}

impl LedgerLock {
    /// Take the lock for `ledger_path`. A lock refreshed within `timeout`
    /// means another scheduler is alive.
    pub fn acquire(ledger_path: &Path, timeout: Duration) -> Result<Self, RefineryError> {
        let path = lock_path(ledger_path);
        let lock_err = |detail: String| {
            RefineryError::Ledger(LedgerError::Lock {
                path: path.clone(),
                detail,
            })
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| lock_err(e.to_string()))?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        started_at: Utc::now(),
                    };
                    let body = serde_json::to_vec(&info).map_err(|e| lock_err(e.to_string()))?;
                    file.write_all(&body)
                        .and_then(|_| file.sync_all())
                        .map_err(|e| lock_err(e.to_string()))?;
                    debug!("Acquired ledger lock {}", path.display());
                    return Ok(Self {
                        path,
                        heartbeat: None,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let age = lock_age(&path).unwrap_or_default();
                    let holder = std::fs::read(&path)
                        .ok()
                        .and_then(|b| serde_json::from_slice::<LockInfo>(&b).ok());
                    if age < timeout {
                        return Err(RefineryError::SchedulerBusy {
                            path: ledger_path.to_path_buf(),
                            pid: holder.map_or(0, |h| h.pid),
                            age_secs: age.as_secs(),
                        });
                    }
                    warn!(
                        "Taking over stale ledger lock {} (last heartbeat {}s ago)",
                        path.display(),
                        age.as_secs()
                    );
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(lock_err(e.to_string())),
                    }
                }
                Err(e) => return Err(lock_err(e.to_string())),
            }
        }
        Err(lock_err("lock was re-created while taking it over".into()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refresh the lock's mtime.
    pub fn touch(&self) -> std::io::Result<()> {
        touch(&self.path)
    }

    /// Spawn a task that refreshes the lock every `interval`.
    pub fn start_heartbeat(&mut self, interval: Duration) {
        let path = self.path.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = touch(&path) {
                    warn!("Ledger heartbeat failed on {}: {e}", path.display());
                }
            }
        }));
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove ledger lock {}: {e}", self.path.display());
            }
        }
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job: &str, status: JobStatus, attempt: u32) -> LedgerEntry {
        LedgerEntry::new(job, status, attempt)
    }

    #[test]
    fn entry_json_omits_empty_fields() {
        let json = serde_json::to_string(&entry("job-1", JobStatus::Running, 1).with_worker(2))
            .unwrap();
        assert!(json.contains("\"status\":\"RUNNING\""));
        assert!(json.contains("\"worker\":2"));
        assert!(!json.contains("output_hash"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/ledger.jsonl");
        let ledger = RunLedger::open(&path).unwrap();
        ledger.append(&entry("job-1", JobStatus::Pending, 0)).unwrap();
        ledger.append(&entry("job-1", JobStatus::Running, 1)).unwrap();

        let (entries, skipped) = RunLedger::read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(skipped, 0);
        assert_eq!(entries[1].status, JobStatus::Running);
    }

    #[test]
    fn missing_ledger_is_empty() {
        let state = RunLedger::read_state(Path::new("/no/such/ledger.jsonl")).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn last_entry_wins() {
        let entries = vec![
            entry("a", JobStatus::Pending, 0),
            entry("b", JobStatus::Pending, 0),
            entry("a", JobStatus::Running, 1).with_worker(0),
            entry("a", JobStatus::Succeeded, 1),
            entry("a", JobStatus::Succeeded, 1),
        ];
        let state = LedgerState::from_entries(&entries);
        assert_eq!(state.len(), 2);
        assert_eq!(state.status("a"), Some(JobStatus::Succeeded));
        assert_eq!(state.status("b"), Some(JobStatus::Pending));
        assert_eq!(state.terminal_count(), 1);
        assert_eq!(state.counts()[&JobStatus::Succeeded], 1);
        let a = state.job("a").unwrap();
        assert_eq!(a.attempt_count, 1);
        assert_eq!(a.assigned_worker, Some(0));
        let ids: Vec<_> = state.jobs().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        // The duplicate SUCCEEDED is folded but flagged.
        assert_eq!(state.illegal_transitions(), 1);
    }

    #[test]
    fn legal_history_has_no_illegal_transitions() {
        let entries = vec![
            entry("a", JobStatus::Pending, 0),
            entry("a", JobStatus::Running, 1),
            entry("a", JobStatus::FailedRetryable, 1),
            entry("a", JobStatus::Pending, 1),
            entry("a", JobStatus::Running, 2),
            entry("a", JobStatus::Pending, 1),
            entry("a", JobStatus::Running, 2),
            entry("a", JobStatus::Succeeded, 2),
        ];
        let state = LedgerState::from_entries(&entries);
        assert_eq!(state.illegal_transitions(), 0);
        assert_eq!(state.job("a").unwrap().attempt_count, 2);

        let skipped = LedgerState::from_entries(&[
            entry("b", JobStatus::Pending, 0),
            entry("b", JobStatus::Succeeded, 1),
        ]);
        assert_eq!(skipped.illegal_transitions(), 1);
        assert_eq!(skipped.status("b"), Some(JobStatus::Succeeded));
    }

    #[tokio::test]
    async fn recorded_entries_land_after_settle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = Arc::new(RunLedger::open(&path).unwrap());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let ledger = Arc::clone(&ledger);
            tasks.push(tokio::spawn(async move {
                ledger
                    .record(&entry(&format!("job-{i}"), JobStatus::Pending, 0))
                    .await
            }));
        }
        // Once started, a write survives its caller being dropped.
        let late = entry("job-dropped", JobStatus::Pending, 0);
        let mut dropped = Box::pin(ledger.record(&late));
        let _ = futures::poll!(&mut dropped);
        drop(dropped);

        for t in tasks {
            t.await.unwrap().unwrap();
        }
        ledger.settle().await;

        let (entries, skipped) = RunLedger::read_entries(&path).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(entries.len(), 17);
        assert!(entries.iter().any(|e| e.job_id == "job-dropped"));
    }

    #[test]
    fn torn_and_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let good = serde_json::to_string(&entry("a", JobStatus::Pending, 0)).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n{good}\n{{\"job_id\":\"a\",\"sta")).unwrap();
        let state = RunLedger::read_state(&path).unwrap();
        assert_eq!(state.entry_count(), 2);
        assert_eq!(state.skipped_lines(), 2);
    }

    #[test]
    fn reclaim_requeues_running_and_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = RunLedger::open(&path).unwrap();
        let mut state = LedgerState::default();
        for e in [
            entry("a", JobStatus::Running, 1),
            entry("b", JobStatus::FailedRetryable, 2),
            entry("c", JobStatus::Succeeded, 1),
        ] {
            ledger.commit(&mut state, e).unwrap();
        }

        assert_eq!(ledger.reclaim(&mut state).unwrap(), 2);
        assert_eq!(state.status("a"), Some(JobStatus::Pending));
        assert_eq!(state.status("b"), Some(JobStatus::Pending));
        assert_eq!(state.job("b").unwrap().attempt_count, 2);
        // The interrupted attempt of a RUNNING job is not charged.
        assert_eq!(state.job("a").unwrap().attempt_count, 0);
        assert_eq!(state.status("c"), Some(JobStatus::Succeeded));

        let reread = RunLedger::read_state(&path).unwrap();
        assert_eq!(reread.status("a"), Some(JobStatus::Pending));
        assert!(reread.running().is_empty());
    }

    #[test]
    fn fresh_lock_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        let _held = LedgerLock::acquire(&ledger, Duration::from_secs(60)).unwrap();
        let err = LedgerLock::acquire(&ledger, Duration::from_secs(60)).unwrap_err();
        match err {
            RefineryError::SchedulerBusy { pid, .. } => assert_eq!(pid, std::process::id()),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.jsonl");
        let lock = lock_path(&ledger);
        std::fs::write(&lock, br#"{"pid":1,"started_at":"2020-01-01T00:00:00Z"}"#).unwrap();
        let old = SystemTime::now() - Duration::from_secs(600);
        File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let held = LedgerLock::acquire(&ledger, Duration::from_secs(60)).unwrap();
        assert!(lock.exists());
        drop(held);
        assert!(!lock.exists());
    }
}
