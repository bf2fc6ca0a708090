//! Shared doubles for unit tests.

use crate::db::Database;
use crate::error::Result;
use crate::ledger::RevisionLedger;
use crate::metrics::LedgerMetrics;
use crate::models::{SpellIssue, UnitKey};
use crate::retry::{CircuitBreaker, RetryConfig};
use crate::search::{FuzzyQuery, IndexDoc, IndexQuery, SearchHit, SearchIndex};
use crate::spellcheck::{SpellChecker, SpellcheckError, SpellcheckGateway};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct CleanChecker;

#[async_trait]
impl SpellChecker for CleanChecker {
    async fn check(&self, _text: &str) -> std::result::Result<Vec<SpellIssue>, SpellcheckError> {
        Ok(Vec::new())
    }
}

/// Index that answers fuzzy queries from a fixed table keyed by query text
#[derive(Default)]
pub struct ScriptedIndex {
    hits: Mutex<HashMap<String, Vec<SearchHit>>>,
    pub fuzzy_calls: AtomicU32,
}

impl ScriptedIndex {
    pub fn answer(&self, text: &str, hits: Vec<(UnitKey, f64)>) {
        let hits = hits
            .into_iter()
            .map(|(key, score)| SearchHit {
                key,
                revision_id: None,
                score,
            })
            .collect();
        self.hits.lock().unwrap().insert(text.to_string(), hits);
    }

    pub fn calls(&self) -> u32 {
        self.fuzzy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchIndex for ScriptedIndex {
    async fn index(&self, _doc: IndexDoc) -> Result<()> {
        Ok(())
    }

    async fn delete_by_query(&self, _query: &IndexQuery) -> Result<usize> {
        Ok(0)
    }

    async fn fuzzy_search(&self, query: &FuzzyQuery) -> Result<Vec<SearchHit>> {
        self.fuzzy_calls.fetch_add(1, Ordering::SeqCst);
        let hits = self.hits.lock().unwrap();
        Ok(hits
            .get(&query.text)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|hit| hit.score >= query.min_score)
            .take(query.top_k)
            .collect())
    }
}

pub fn ledger_over(index: Arc<dyn SearchIndex>) -> Arc<RevisionLedger> {
    let metrics = Arc::new(LedgerMetrics::new());
    let gateway = SpellcheckGateway::new(
        Arc::new(CleanChecker),
        RetryConfig::new(1, Duration::from_millis(1)),
        CircuitBreaker::new("test", 3, Duration::from_secs(60)),
        metrics.clone(),
    );
    Arc::new(RevisionLedger::new(
        Database::open_in_memory().unwrap(),
        index,
        gateway,
        metrics,
    ))
}
