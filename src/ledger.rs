use crate::aggregates::AggregateRecomputer;
use crate::approval;
use crate::config::Config;
use crate::db::{Database, DeleteOutcome, RevisionDraft};
use crate::error::{LedgerError, Result};
use crate::metrics::LedgerMetrics;
use crate::models::{count_letters, TextUnit, TranslationRevision, UnitKey};
use crate::retry::{with_retry, RetryConfig};
use crate::search::{DocKind, IndexDoc, IndexOp, IndexQuery, SearchIndex};
use crate::spellcheck::{HttpSpellChecker, SpellcheckGateway, SpellcheckTotals};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A translation to append to a unit's chain
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub key: UnitKey,
    pub text: String,
    pub author: String,
    /// Keep an existing approval even though the text changes
    pub approve_transfer: bool,
    /// Continue the chain from this revision, keeping its author (automated fixers)
    pub prev_revision_id: Option<i64>,
}

impl SubmitRequest {
    pub fn new(key: UnitKey, text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            key,
            text: text.into(),
            author: author.into(),
            approve_transfer: false,
            prev_revision_id: None,
        }
    }

    pub fn with_approve_transfer(mut self, approve_transfer: bool) -> Self {
        self.approve_transfer = approve_transfer;
        self
    }

    pub fn continuing(mut self, prev_revision_id: i64) -> Self {
        self.prev_revision_id = Some(prev_revision_id);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub revision: TranslationRevision,
    pub superseded_id: Option<i64>,
    pub has_translate: bool,
    pub translate_approved: bool,
    pub flags_changed: bool,
    /// `prev_revision_id` was no longer the live head; the revision was appended to the real tail
    pub stale_head_link: bool,
    /// At least one index write failed and was queued for replay
    pub index_deferred: bool,
    /// Aggregate refresh failed; the last stored aggregate is still in place
    pub aggregates_stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxReport {
    pub replayed: usize,
    /// Revision documents dropped because the revision is no longer the live head
    pub skipped: usize,
    pub pending: usize,
}

/// Append-only revision chains plus the side effects every change triggers
pub struct RevisionLedger {
    db: Database,
    index: Arc<dyn SearchIndex>,
    spellcheck: SpellcheckGateway,
    aggregates: AggregateRecomputer,
    totals: SpellcheckTotals,
    metrics: Arc<LedgerMetrics>,
}

impl RevisionLedger {
    pub fn new(
        db: Database,
        index: Arc<dyn SearchIndex>,
        spellcheck: SpellcheckGateway,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            aggregates: AggregateRecomputer::new(db.clone()),
            db,
            index,
            spellcheck,
            totals: SpellcheckTotals::new(),
            metrics,
        }
    }

    /// Open the configured database and talk to the HTTP spellchecker
    pub fn from_config(config: &Config, index: Arc<dyn SearchIndex>) -> Result<Self> {
        let db = Database::new(&config.database_path)?;
        let metrics = Arc::new(LedgerMetrics::new());
        let checker = HttpSpellChecker::from_config(reqwest::Client::new(), config);
        let spellcheck = SpellcheckGateway::from_config(Arc::new(checker), config, metrics.clone());
        Ok(Self::new(db, index, spellcheck, metrics))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn index(&self) -> &dyn SearchIndex {
        self.index.as_ref()
    }

    pub fn aggregates(&self) -> &AggregateRecomputer {
        &self.aggregates
    }

    pub fn metrics(&self) -> &LedgerMetrics {
        &self.metrics
    }

    /// Store extracted units and index their source text.
    /// Returns how many units were new.
    pub async fn register_units(&self, units: &[TextUnit]) -> Result<usize> {
        let inserted = self.db.insert_units(units)?;

        let mut touched = BTreeSet::new();
        for unit in units {
            self.apply_or_defer(IndexOp::Index(IndexDoc::unit(unit))).await;
            touched.insert((unit.key.project.clone(), unit.key.volume.clone()));
        }
        for (project, volume) in &touched {
            self.refresh_aggregates(project, volume);
        }

        info!("Registered {} new text units ({} submitted)", inserted, units.len());
        Ok(inserted)
    }

    /// Re-index every unit and live head, for indexes that start empty.
    /// Returns the number of documents written.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut written = 0;
        for project in self.db.projects()? {
            let volumes = self.db.volumes(&project)?;
            for unit in self.db.units_in_volumes(&project, &volumes)? {
                self.index.index(IndexDoc::unit(&unit)).await?;
                written += 1;
            }
            for revision in self.db.live_heads(&project)? {
                self.index.index(IndexDoc::revision(&revision)).await?;
                written += 1;
            }
        }
        info!("✓ Rebuilt search index ({} documents)", written);
        Ok(written)
    }

    /// Append a translation revision for a unit
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        let key = request.key.clone();
        let unit = self
            .db
            .get_unit(&key)?
            .ok_or_else(|| LedgerError::UnitNotFound(key.clone()))?;

        let is_translate = request.text != unit.source_text;
        let spell_issues = if is_translate {
            self.spellcheck.check(&request.text).await?
        } else {
            Vec::new()
        };

        let draft = RevisionDraft {
            key: key.clone(),
            text: request.text.clone(),
            submitter: request.author.clone(),
            prev_revision_id: request.prev_revision_id,
            created_at: Utc::now(),
            is_translate,
            letters: count_letters(&request.text),
            spell_issues,
        };
        let text = request.text.as_str();
        let approve_transfer = request.approve_transfer;
        let outcome = self.db.append_revision(&draft, |current| {
            approval::propagate(current, text, approve_transfer)
        })?;
        self.metrics.record_revision_created();

        if outcome.stale_head_link {
            self.metrics.record_stale_head_link();
            warn!(
                "Stale head link on {}: revision {:?} is not the live head, appended {} after {:?}",
                key,
                request.prev_revision_id,
                outcome.revision.id,
                outcome.superseded.as_ref().map(|r| r.id)
            );
        }

        let aggregates_stale =
            outcome.flags.changed && !self.refresh_aggregates(&key.project, &key.volume);

        if let Err(e) = self
            .db
            .touch_last_submit(&key.project, &key.volume, outcome.revision.created_at)
        {
            warn!("Failed to record last submit for {}: {}", key, e);
        }

        let mut index_deferred = false;
        if let Some(superseded) = &outcome.superseded {
            let op = IndexOp::DeleteByQuery(IndexQuery::revision(&key.project, superseded.id));
            index_deferred |= !self.apply_or_defer(op).await;
        }
        index_deferred |= !self
            .apply_or_defer(IndexOp::Index(IndexDoc::revision(&outcome.revision)))
            .await;

        self.totals.invalidate(&key.project);

        debug!(
            "Submitted revision {} for {} (approved: {}, flags changed: {})",
            outcome.revision.id, key, outcome.flags.translate_approved, outcome.flags.changed
        );

        Ok(SubmitReceipt {
            superseded_id: outcome.superseded.as_ref().map(|r| r.id),
            has_translate: outcome.flags.has_translate,
            translate_approved: outcome.flags.translate_approved,
            flags_changed: outcome.flags.changed,
            stale_head_link: outcome.stale_head_link,
            index_deferred,
            aggregates_stale,
            revision: outcome.revision,
        })
    }

    /// Soft-delete a revision. The chain is not relinked, so deleting the
    /// head leaves the unit without a live translation.
    pub async fn delete(&self, revision_id: i64) -> Result<DeleteOutcome> {
        let outcome = self.db.mark_deleted(revision_id)?;
        if outcome.already_deleted {
            return Ok(outcome);
        }
        self.metrics.record_revision_deleted();

        let key = &outcome.revision.key;
        self.apply_or_defer(IndexOp::DeleteByQuery(IndexQuery::revision(
            &key.project,
            revision_id,
        )))
        .await;
        if outcome.was_live_head {
            self.refresh_aggregates(&key.project, &key.volume);
        }
        self.totals.invalidate(&key.project);

        info!(
            "Deleted revision {} of {} (was live head: {})",
            revision_id, key, outcome.was_live_head
        );
        Ok(outcome)
    }

    pub fn revision(&self, id: i64) -> Result<Option<TranslationRevision>> {
        self.db.get_revision(id)
    }

    /// The live head of a unit, never a deleted one
    pub fn head(&self, key: &UnitKey) -> Result<Option<TranslationRevision>> {
        self.db.head_revision(key)
    }

    /// Full chain of a unit, first revision first
    pub fn history(&self, key: &UnitKey) -> Result<Vec<TranslationRevision>> {
        self.db.chain(key)
    }

    pub fn project_revisions(&self, project: &str) -> Result<Vec<TranslationRevision>> {
        self.db.live_heads(project)
    }

    /// Spelling issues across a project's live heads, cached until the next change
    pub fn spellcheck_total(&self, project: &str) -> Result<u64> {
        let generation = self.totals.generation(project);
        if let Some(total) = self.totals.get(project) {
            return Ok(total);
        }
        let total = self.db.spell_issue_total(project)?;
        // Skipped when a change invalidated the project while we were counting
        self.totals.store(project, generation, total);
        Ok(total)
    }

    /// Replay deferred index writes in order, stopping at the first one that still fails
    pub async fn flush_index_outbox(&self, limit: usize) -> Result<OutboxReport> {
        let ops = self.db.index_outbox(limit)?;
        let mut report = OutboxReport {
            pending: ops.len(),
            ..Default::default()
        };

        for (id, op) in ops {
            if self.is_superseded_revision(&op)? {
                self.db.remove_index_op(id)?;
                report.skipped += 1;
                report.pending -= 1;
                continue;
            }

            let result = with_retry(&RetryConfig::index_replay(), "Index replay", || {
                op.apply(self.index.as_ref())
            })
            .await;

            match result {
                Ok(()) => {
                    self.db.remove_index_op(id)?;
                    self.metrics.record_index_replay();
                    report.replayed += 1;
                    report.pending -= 1;
                }
                Err(e) => {
                    warn!("Index outbox replay stopped at entry {}: {}", id, e);
                    break;
                }
            }
        }

        if report.replayed > 0 {
            info!("✓ Replayed {} deferred index operations", report.replayed);
        }
        Ok(report)
    }

    /// Destroy a project's units, revisions and derived state
    pub async fn delete_project(&self, project: &str) -> Result<usize> {
        let removed = self.db.delete_project(project)?;
        self.apply_or_defer(IndexOp::DeleteByQuery(IndexQuery::project(project)))
            .await;
        self.totals.invalidate(project);
        info!("Deleted project {} ({} text units)", project, removed);
        Ok(removed)
    }

    /// Recompute a volume and its project; false when the refresh failed
    fn refresh_aggregates(&self, project: &str, volume: &str) -> bool {
        match self.aggregates.refresh_for_volume(project, volume) {
            Ok(_) => true,
            Err(e) => {
                self.metrics.record_aggregate_failure();
                warn!(
                    "Aggregate refresh failed for {}/{}, keeping last stored values: {}",
                    project, volume, e
                );
                false
            }
        }
    }

    /// Apply an index write, queueing it for replay on failure; false when deferred.
    /// While earlier writes are still queued, new ones queue behind them so
    /// replay keeps their order.
    async fn apply_or_defer(&self, op: IndexOp) -> bool {
        match self.db.index_outbox_len() {
            Ok(0) => {}
            Ok(queued) => {
                debug!("Index outbox holds {} writes, queueing behind them", queued);
                self.defer(&op);
                return false;
            }
            Err(e) => {
                warn!("Failed to read index outbox, queueing write: {}", e);
                self.defer(&op);
                return false;
            }
        }

        match op.apply(self.index.as_ref()).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.record_index_failure();
                warn!("Search index write failed, deferring: {}", e);
                self.defer(&op);
                false
            }
        }
    }

    fn defer(&self, op: &IndexOp) {
        if let Err(e) = self.db.push_index_op(op) {
            error!("Failed to persist deferred index write {:?}: {}", op, e);
        }
    }

    /// A queued revision document whose revision was superseded or deleted since
    fn is_superseded_revision(&self, op: &IndexOp) -> Result<bool> {
        let IndexOp::Index(IndexDoc {
            kind: DocKind::Revision,
            revision_id: Some(id),
            ..
        }) = op
        else {
            return Ok(false);
        };
        Ok(!self
            .db
            .get_revision(*id)?
            .is_some_and(|revision| revision.is_live_head()))
    }
}
