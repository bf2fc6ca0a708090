//! Video frame references attached to text units.
//!
//! Pending video texts are matched against unit source strings through the
//! fuzzy index. Each unit keeps at most one reference per video, and any
//! reference scoring below `eviction_ratio` times the unit's best score is
//! dropped.

use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::ledger::RevisionLedger;
use crate::models::{PendingVideoText, ScoredReference, UnitKey, VideoTextCandidate};
use crate::search::{FuzzyQuery, IndexQuery};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Merge `candidate` into a unit's references.
///
/// Returns true when the list changed and the candidate is still in it
/// afterwards; only then does the list need to be persisted.
pub fn merge_reference(
    references: &mut Vec<ScoredReference>,
    candidate: ScoredReference,
    eviction_ratio: f64,
) -> bool {
    match references
        .iter_mut()
        .find(|r| r.video_id == candidate.video_id)
    {
        Some(existing) if existing.score >= candidate.score => return false,
        Some(existing) => *existing = candidate.clone(),
        None => references.push(candidate.clone()),
    }

    let max = references
        .iter()
        .map(|r| r.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let threshold = eviction_ratio * max;
    references.retain(|r| r.score >= threshold);

    references.iter().any(|r| *r == candidate)
}

/// Outcome of one pass over a page of the pending set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassOutcome {
    pub processed: usize,
    pub failed: usize,
    pub references_written: usize,
    /// Highest candidate id in the page; `None` when nothing was pending past the cursor
    pub last_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolverReport {
    pub passes: usize,
    pub processed: usize,
    /// Failed attempts, a candidate retried in a later sweep counts again
    pub failed: usize,
    pub references_written: usize,
    /// Candidates still pending when the driver stopped
    pub remaining: usize,
}

pub struct ScoredReferenceResolver {
    ledger: Arc<RevisionLedger>,
    top_k: usize,
    min_score: f64,
    eviction_ratio: f64,
    concurrency: usize,
    batch_size: usize,
}

impl ScoredReferenceResolver {
    pub fn new(ledger: Arc<RevisionLedger>, config: &Config) -> Self {
        Self {
            ledger,
            top_k: config.fuzzy_top_k,
            min_score: config.reference_min_score,
            eviction_ratio: config.reference_eviction_ratio,
            concurrency: config.resolver_concurrency.max(1),
            batch_size: config.resolver_batch_size.max(1),
        }
    }

    pub fn enqueue(&self, project: &str, candidate: &VideoTextCandidate) -> Result<i64> {
        self.ledger.db().enqueue_video_text(project, candidate)
    }

    pub fn references(&self, key: &UnitKey) -> Result<Vec<ScoredReference>> {
        let unit = self
            .ledger
            .db()
            .get_unit(key)?
            .ok_or_else(|| LedgerError::UnitNotFound(key.clone()))?;
        Ok(unit.references)
    }

    /// Resolve the page of pending candidates after `after_id` concurrently
    pub async fn run_pass(&self, after_id: i64) -> Result<PassOutcome> {
        let pending = self.ledger.db().pending_video_texts(after_id, self.batch_size)?;
        let mut outcome = PassOutcome {
            last_id: pending.iter().map(|p| p.id).max(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(outcome);
        }
        debug!("Resolving {} pending video texts", pending.len());

        let results: Vec<(i64, Result<usize>)> = stream::iter(pending)
            .map(|candidate| async move {
                let result = self.resolve(&candidate).await;
                (candidate.id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(written) => {
                    outcome.processed += 1;
                    outcome.references_written += written;
                }
                Err(e) if e.is_transient() => {
                    outcome.failed += 1;
                    warn!("Video text {} stays pending until the next pass: {}", id, e);
                }
                Err(e) => {
                    outcome.failed += 1;
                    error!("Video text {} failed and stays pending: {}", id, e);
                }
            }
        }
        Ok(outcome)
    }

    /// Sweep the whole pending set page by page, so failing candidates do not
    /// hide newer ones. Sweeps repeat while they make progress, which picks up
    /// candidates that arrived mid-sweep.
    pub async fn run_until_drained(&self) -> Result<ResolverReport> {
        let mut report = ResolverReport::default();
        loop {
            let mut cursor = 0;
            let mut sweep_processed = 0;
            loop {
                let outcome = self.run_pass(cursor).await?;
                let Some(last_id) = outcome.last_id else {
                    break;
                };
                cursor = last_id;
                report.passes += 1;
                report.processed += outcome.processed;
                report.failed += outcome.failed;
                report.references_written += outcome.references_written;
                sweep_processed += outcome.processed;
            }
            if sweep_processed == 0 {
                break;
            }
        }
        report.remaining = self.ledger.db().pending_video_text_count()?;

        if report.processed > 0 {
            info!(
                "✓ Resolved {} video texts in {} passes ({} references written, {} remaining)",
                report.processed, report.passes, report.references_written, report.remaining
            );
        }
        Ok(report)
    }

    /// Match one candidate and update every hit unit. The unit read and
    /// write are not guarded, so concurrent candidates on one unit can
    /// lose an update.
    async fn resolve(&self, pending: &PendingVideoText) -> Result<usize> {
        let candidate = &pending.candidate;
        let hits = self
            .ledger
            .index()
            .fuzzy_search(&FuzzyQuery {
                text: candidate.text.clone(),
                filter: IndexQuery::units(&pending.project, None),
                top_k: self.top_k,
                min_score: self.min_score,
            })
            .await?;

        let db = self.ledger.db();
        let mut written = 0;
        for hit in hits {
            let Some(unit) = db.get_unit(&hit.key)? else {
                continue;
            };
            let mut references = unit.references;
            let reference = ScoredReference {
                video_id: candidate.video_id.clone(),
                frame: candidate.frame,
                score: hit.score,
            };
            if merge_reference(&mut references, reference, self.eviction_ratio) {
                db.set_unit_references(&hit.key, &references)?;
                self.ledger.metrics().record_reference_written();
                written += 1;
            }
        }

        db.remove_video_text(pending.id)?;
        Ok(written)
    }
}
