//! Progress-callback trait for batch and per-job events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::RefineryConfigBuilder::progress_callback`] to receive
//! events as the scheduler moves jobs through their states. The CLI renders
//! these as an `indicatif` progress bar; a service could forward them to a
//! channel or a database instead.
//!
//! # Example
//!
//! ```rust
//! use pdf_refinery::{BatchProgressCallback, RefineryConfig};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct FailureCounter {
//!     failed: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for FailureCounter {
//!     fn on_job_failed(&self, job_id: &str, path: &Path, error: &str) {
//!         self.failed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{job_id} ({}) failed: {error}", path.display());
//!     }
//! }
//!
//! let counter = Arc::new(FailureCounter { failed: AtomicUsize::new(0) });
//! let config = RefineryConfig::builder()
//!     .progress_callback(counter as Arc<dyn BatchProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::output::{BatchSummary, JobOutcome};
use std::path::Path;
use std::sync::Arc;

/// Called by the scheduler as jobs progress.
///
/// Workers run concurrently, so every method except `on_batch_start` and
/// `on_batch_complete` may be called from several tasks at once. All methods
/// default to no-ops.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once, after the ledger has been reconciled.
    ///
    /// # Arguments
    /// * `total`: jobs that will be dispatched in this run
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called after the RUNNING entry for an attempt is committed.
    fn on_job_start(&self, job_id: &str, path: &Path, attempt: u32) {
        let _ = (job_id, path, attempt);
    }

    /// Called when a transient failure is requeued for another attempt.
    fn on_job_retry(&self, job_id: &str, path: &Path, attempt: u32, error: &str) {
        let _ = (job_id, path, attempt, error);
    }

    /// Called after the SUCCEEDED entry is committed.
    fn on_job_complete(&self, job_id: &str, path: &Path, outcome: &JobOutcome) {
        let _ = (job_id, path, outcome);
    }

    /// Called after the FAILED_PERMANENT entry is committed.
    fn on_job_failed(&self, job_id: &str, path: &Path, error: &str) {
        let _ = (job_id, path, error);
    }

    /// Called once with the final report.
    fn on_batch_complete(&self, summary: &BatchSummary) {
        let _ = summary;
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::RefineryConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        started_total: AtomicUsize,
        starts: AtomicUsize,
        retries: AtomicUsize,
        failures: AtomicUsize,
        completed: AtomicUsize,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_batch_start(&self, total: usize) {
            self.started_total.store(total, Ordering::SeqCst);
        }

        fn on_job_start(&self, _job_id: &str, _path: &Path, _attempt: u32) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_retry(&self, _job_id: &str, _path: &Path, _attempt: u32, _error: &str) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_failed(&self, _job_id: &str, _path: &Path, _error: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, summary: &BatchSummary) {
            self.completed.store(summary.dispatched, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        let p = Path::new("a.pdf");
        cb.on_batch_start(2);
        cb.on_job_start("job-1", p, 1);
        cb.on_job_retry("job-1", p, 1, "timeout");
        cb.on_job_failed("job-1", p, "corrupt");
        cb.on_batch_complete(&BatchSummary::default());
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        let p = Path::new("a.pdf");
        tracker.on_batch_start(3);
        tracker.on_job_start("job-1", p, 1);
        tracker.on_job_retry("job-1", p, 1, "timeout");
        tracker.on_job_start("job-1", p, 2);
        tracker.on_job_failed("job-2", p, "corrupt");
        tracker.on_batch_complete(&BatchSummary {
            dispatched: 3,
            ..Default::default()
        });

        assert_eq!(tracker.started_total.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.retries.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.failures.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
    }
}
