//! Cross-project import of existing translations.
//!
//! Batches are grouped by volume group. Inside a group each unique source
//! string is first matched exactly against destination units; strings with
//! no exact match go through the fuzzy index, and the pooled fuzzy
//! candidates are assigned greedily, best score first, at most one per
//! destination unit.

use crate::config::Config;
use crate::error::Result;
use crate::ledger::{RevisionLedger, SubmitRequest};
use crate::models::{volume_group, UnitKey};
use crate::search::{FuzzyQuery, IndexQuery};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportPair {
    pub source_text: String,
    pub translated_text: String,
}

/// Translations exported from another project, keyed by source volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub volumes: BTreeMap<String, Vec<ImportPair>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportFailure {
    pub key: UnitKey,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub destination: String,
    pub groups: usize,
    pub unique_sources: usize,
    pub duplicate_sources: usize,
    pub exact_applied: usize,
    pub fuzzy_applied: usize,
    /// Fuzzy candidates dropped because their key was already assigned
    pub discarded_candidates: usize,
    /// Sources with neither an exact nor a fuzzy match
    pub unmatched_sources: usize,
    pub failures: Vec<ImportFailure>,
}

#[derive(Debug, Clone)]
struct Candidate {
    key: UnitKey,
    translated_text: String,
    score: f64,
}

pub struct CrossProjectReconciler {
    ledger: Arc<RevisionLedger>,
    top_k: usize,
    min_score: f64,
    author: String,
}

impl CrossProjectReconciler {
    pub fn new(ledger: Arc<RevisionLedger>, config: &Config) -> Self {
        Self {
            ledger,
            top_k: config.fuzzy_top_k,
            min_score: config.import_min_score,
            author: config.import_author.clone(),
        }
    }

    pub async fn import(&self, destination: &str, batch: &ImportBatch) -> Result<ImportReport> {
        let mut report = ImportReport {
            destination: destination.to_string(),
            ..Default::default()
        };

        let mut destination_groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for volume in self.ledger.db().volumes(destination)? {
            destination_groups
                .entry(volume_group(&volume).to_string())
                .or_default()
                .push(volume);
        }

        let mut source_groups: BTreeMap<&str, Vec<&ImportPair>> = BTreeMap::new();
        for (volume, pairs) in &batch.volumes {
            source_groups
                .entry(volume_group(volume))
                .or_default()
                .extend(pairs.iter());
        }

        info!(
            "Importing {} source groups into {} ({} destination groups)",
            source_groups.len(),
            destination,
            destination_groups.len()
        );

        let mut assigned: HashSet<UnitKey> = HashSet::new();
        for (group, pairs) in source_groups {
            report.groups += 1;
            let volumes = destination_groups.get(group).cloned().unwrap_or_default();
            self.import_group(destination, group, &volumes, &pairs, &mut assigned, &mut report)
                .await?;
        }

        info!(
            "✓ Import into {} finished: {} exact, {} fuzzy, {} unmatched, {} failed",
            destination,
            report.exact_applied,
            report.fuzzy_applied,
            report.unmatched_sources,
            report.failures.len()
        );
        Ok(report)
    }

    async fn import_group(
        &self,
        destination: &str,
        group: &str,
        volumes: &[String],
        pairs: &[&ImportPair],
        assigned: &mut HashSet<UnitKey>,
        report: &mut ImportReport,
    ) -> Result<()> {
        let units = self.ledger.db().units_in_volumes(destination, volumes)?;
        let mut by_source: HashMap<&str, Vec<&UnitKey>> = HashMap::new();
        for unit in &units {
            by_source
                .entry(unit.source_text.as_str())
                .or_default()
                .push(&unit.key);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut pool: Vec<Candidate> = Vec::new();

        for pair in pairs {
            if !seen.insert(pair.source_text.as_str()) {
                report.duplicate_sources += 1;
                continue;
            }
            report.unique_sources += 1;

            if let Some(keys) = by_source.get(pair.source_text.as_str()) {
                for key in keys {
                    if assigned.contains(*key) {
                        continue;
                    }
                    assigned.insert((*key).clone());
                    if self.apply(key, &pair.translated_text, report).await {
                        report.exact_applied += 1;
                    }
                }
                continue;
            }

            if volumes.is_empty() {
                report.unmatched_sources += 1;
                continue;
            }

            let hits = self
                .ledger
                .index()
                .fuzzy_search(&FuzzyQuery {
                    text: pair.source_text.clone(),
                    filter: IndexQuery::units(destination, Some(volumes.to_vec())),
                    top_k: self.top_k,
                    min_score: self.min_score,
                })
                .await?;
            if hits.is_empty() {
                report.unmatched_sources += 1;
                continue;
            }
            pool.extend(hits.into_iter().map(|hit| Candidate {
                key: hit.key,
                translated_text: pair.translated_text.clone(),
                score: hit.score,
            }));
        }

        debug!("Group {}: resolving {} fuzzy candidates", group, pool.len());

        // Stable sort keeps source order among equal scores
        pool.sort_by(|a, b| b.score.total_cmp(&a.score));
        for candidate in pool {
            if !assigned.insert(candidate.key.clone()) {
                report.discarded_candidates += 1;
                continue;
            }
            if self
                .apply(&candidate.key, &candidate.translated_text, report)
                .await
            {
                report.fuzzy_applied += 1;
            }
        }
        Ok(())
    }

    /// Submit one imported translation; failures are recorded, not raised
    async fn apply(&self, key: &UnitKey, text: &str, report: &mut ImportReport) -> bool {
        let request = SubmitRequest::new(key.clone(), text, self.author.as_str());
        match self.ledger.submit(request).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Import submit failed for {}: {}", key, e);
                report.failures.push(ImportFailure {
                    key: key.clone(),
                    error: e.to_string(),
                });
                false
            }
        }
    }
}
