//! Ledger observability counters.
//!
//! One `LedgerMetrics` instance is owned by the ledger and shared with the
//! reconciliation passes. Conditions that are not errors (a stale head link,
//! a deferred index write) are only visible here and in the logs.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct LedgerMetrics {
    revisions_created: AtomicUsize,
    revisions_deleted: AtomicUsize,

    /// Submits whose `prev_revision_id` was no longer the live head
    stale_head_links: AtomicUsize,

    index_failures: AtomicUsize,
    index_replays: AtomicUsize,

    spellcheck_calls: AtomicUsize,
    spellcheck_failures: AtomicUsize,
    spellcheck_rejected: AtomicUsize,

    aggregate_failures: AtomicUsize,

    references_written: AtomicUsize,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_revision_created(&self) {
        self.revisions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revision_deleted(&self) {
        self.revisions_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_head_link(&self) {
        self.stale_head_links.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_failure(&self) {
        self.index_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_replay(&self) {
        self.index_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spellcheck_call(&self) {
        self.spellcheck_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spellcheck_failure(&self) {
        self.spellcheck_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Call refused because the breaker was open
    pub fn record_spellcheck_rejected(&self) {
        self.spellcheck_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregate_failure(&self) {
        self.aggregate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reference_written(&self) {
        self.references_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_head_links(&self) -> usize {
        self.stale_head_links.load(Ordering::Relaxed)
    }

    pub fn index_failures(&self) -> usize {
        self.index_failures.load(Ordering::Relaxed)
    }

    pub fn spellcheck_calls(&self) -> usize {
        self.spellcheck_calls.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> MetricsReport {
        let calls = self.spellcheck_calls.load(Ordering::Relaxed);
        let failures = self.spellcheck_failures.load(Ordering::Relaxed);
        let spellcheck_success_rate = if calls > 0 {
            (calls.saturating_sub(failures) as f64 / calls as f64) * 100.0
        } else {
            0.0
        };

        MetricsReport {
            revisions_created: self.revisions_created.load(Ordering::Relaxed),
            revisions_deleted: self.revisions_deleted.load(Ordering::Relaxed),
            stale_head_links: self.stale_head_links(),
            index_failures: self.index_failures(),
            index_replays: self.index_replays.load(Ordering::Relaxed),
            spellcheck_calls: calls,
            spellcheck_failures: failures,
            spellcheck_rejected: self.spellcheck_rejected.load(Ordering::Relaxed),
            spellcheck_success_rate,
            aggregate_failures: self.aggregate_failures.load(Ordering::Relaxed),
            references_written: self.references_written.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the ledger counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub revisions_created: usize,
    pub revisions_deleted: usize,
    pub stale_head_links: usize,
    pub index_failures: usize,
    pub index_replays: usize,
    pub spellcheck_calls: usize,
    pub spellcheck_failures: usize,
    pub spellcheck_rejected: usize,
    /// Percentage (0-100) of spellcheck calls that succeeded
    pub spellcheck_success_rate: f64,
    pub aggregate_failures: usize,
    pub references_written: usize,
}
