//! Fuzzy text search over unit source strings and revision texts.
//!
//! `SearchIndex` is the seam to the external index. `MemoryIndex` keeps
//! documents in process and scores them with a character-diff similarity
//! ratio in `0.0..=1.0`.

use crate::error::Result;
use crate::models::{TextUnit, TranslationRevision, UnitKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    /// Source string of a text unit
    Unit,
    /// Text of a revision
    Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDoc {
    pub kind: DocKind,
    pub key: UnitKey,
    pub revision_id: Option<i64>,
    pub text: String,
}

impl IndexDoc {
    pub fn unit(unit: &TextUnit) -> Self {
        Self {
            kind: DocKind::Unit,
            key: unit.key.clone(),
            revision_id: None,
            text: unit.source_text.clone(),
        }
    }

    pub fn revision(revision: &TranslationRevision) -> Self {
        Self {
            kind: DocKind::Revision,
            key: revision.key.clone(),
            revision_id: Some(revision.id),
            text: revision.text.clone(),
        }
    }

    /// Stable document id; re-indexing the same unit or revision replaces it
    pub fn doc_id(&self) -> String {
        match (self.kind, self.revision_id) {
            (DocKind::Revision, Some(id)) => format!("rev:{}", id),
            _ => format!("unit:{}", self.key),
        }
    }
}

/// Equality predicate over indexed documents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexQuery {
    pub project: String,
    pub kind: Option<DocKind>,
    pub revision_id: Option<i64>,
    /// Restrict to these volumes; `None` means the whole project
    pub volumes: Option<Vec<String>>,
}

impl IndexQuery {
    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    /// Units of a project, optionally limited to some volumes
    pub fn units(project: impl Into<String>, volumes: Option<Vec<String>>) -> Self {
        Self {
            project: project.into(),
            kind: Some(DocKind::Unit),
            volumes,
            ..Default::default()
        }
    }

    pub fn revision(project: impl Into<String>, revision_id: i64) -> Self {
        Self {
            project: project.into(),
            kind: Some(DocKind::Revision),
            revision_id: Some(revision_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, doc: &IndexDoc) -> bool {
        doc.key.project == self.project
            && self.kind.map_or(true, |kind| kind == doc.kind)
            && self.revision_id.map_or(true, |id| doc.revision_id == Some(id))
            && self
                .volumes
                .as_ref()
                .map_or(true, |volumes| volumes.iter().any(|v| *v == doc.key.volume))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyQuery {
    pub text: String,
    pub filter: IndexQuery,
    pub top_k: usize,
    /// Hits scoring below this are dropped
    pub min_score: f64,
}

/// One fuzzy match returned by the index
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub key: UnitKey,
    pub revision_id: Option<i64>,
    pub score: f64,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index(&self, doc: IndexDoc) -> Result<()>;

    /// Remove every document matching `query`, returning how many were removed
    async fn delete_by_query(&self, query: &IndexQuery) -> Result<usize>;

    /// Best matches first, at most `query.top_k` of them
    async fn fuzzy_search(&self, query: &FuzzyQuery) -> Result<Vec<SearchHit>>;
}

/// An index write that can be persisted and replayed later
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IndexOp {
    Index(IndexDoc),
    DeleteByQuery(IndexQuery),
}

impl IndexOp {
    pub async fn apply(&self, index: &dyn SearchIndex) -> Result<()> {
        match self {
            IndexOp::Index(doc) => index.index(doc.clone()).await,
            IndexOp::DeleteByQuery(query) => index.delete_by_query(query).await.map(|_| ()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: RwLock<HashMap<String, IndexDoc>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Similarity between two strings, 1.0 for identical text
    pub fn similarity(a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        TextDiff::from_chars(a, b).ratio() as f64
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn index(&self, doc: IndexDoc) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(doc.doc_id(), doc);
        Ok(())
    }

    async fn delete_by_query(&self, query: &IndexQuery) -> Result<usize> {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        let before = docs.len();
        docs.retain(|_, doc| !query.matches(doc));
        Ok(before - docs.len())
    }

    async fn fuzzy_search(&self, query: &FuzzyQuery) -> Result<Vec<SearchHit>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<SearchHit> = docs
            .values()
            .filter(|doc| query.filter.matches(doc))
            .map(|doc| SearchHit {
                key: doc.key.clone(),
                revision_id: doc.revision_id,
                score: Self::similarity(&query.text, &doc.text),
            })
            .filter(|hit| hit.score >= query.min_score)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(query.top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(volume: &str, number: i64, text: &str) -> IndexDoc {
        IndexDoc::unit(&TextUnit::new(UnitKey::new("p", volume, number), text))
    }

    fn query(text: &str, filter: IndexQuery) -> FuzzyQuery {
        FuzzyQuery {
            text: text.to_string(),
            filter,
            top_k: 5,
            min_score: 0.0,
        }
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(MemoryIndex::similarity("abc", "abc"), 1.0);
        assert!(MemoryIndex::similarity("abc", "xyz") < 0.1);
        let close = MemoryIndex::similarity("Hello there", "Hello there!");
        assert!(close > 0.9, "got {}", close);
    }

    #[test]
    fn test_doc_id_distinguishes_kinds() {
        let u = unit("1", 3, "x");
        assert_eq!(u.doc_id(), "unit:p/1#3");
        let rev = IndexDoc {
            kind: DocKind::Revision,
            key: UnitKey::new("p", "1", 3),
            revision_id: Some(9),
            text: "x".into(),
        };
        assert_eq!(rev.doc_id(), "rev:9");
    }

    #[test]
    fn test_query_matches_volume_restriction() {
        let doc = unit("0001_a", 1, "x");
        assert!(IndexQuery::units("p", Some(vec!["0001_a".into()])).matches(&doc));
        assert!(!IndexQuery::units("p", Some(vec!["0002_a".into()])).matches(&doc));
        assert!(!IndexQuery::units("other", None).matches(&doc));
        assert!(!IndexQuery::revision("p", 1).matches(&doc));
    }

    #[tokio::test]
    async fn test_fuzzy_search_ranks_closest_first() {
        let index = MemoryIndex::new();
        index.index(unit("1", 1, "Open the door")).await.unwrap();
        index.index(unit("1", 2, "Close the window")).await.unwrap();
        index.index(unit("1", 3, "Open the doors")).await.unwrap();

        let hits = index
            .fuzzy_search(&query("Open the door!", IndexQuery::units("p", None)))
            .await
            .unwrap();

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].key.number, 1);
        assert_eq!(hits[1].key.number, 3);
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
    }

    #[tokio::test]
    async fn test_fuzzy_search_respects_top_k_and_min_score() {
        let index = MemoryIndex::new();
        for n in 0..10 {
            index.index(unit("1", n, &format!("line number {}", n))).await.unwrap();
        }
        index.index(unit("1", 99, "zzzz")).await.unwrap();

        let mut q = query("line number 4", IndexQuery::units("p", None));
        q.top_k = 3;
        q.min_score = 0.5;
        let hits = index.fuzzy_search(&q).await.unwrap();

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].key.number, 4);
        assert!(hits.iter().all(|h| h.key.number != 99));
    }

    #[tokio::test]
    async fn test_delete_by_query_and_reindex() {
        let index = MemoryIndex::new();
        index.index(unit("1", 1, "a")).await.unwrap();
        index.index(unit("2", 1, "b")).await.unwrap();
        index.index(unit("1", 1, "a2")).await.unwrap();
        assert_eq!(index.len(), 2);

        let removed = index
            .delete_by_query(&IndexQuery::units("p", Some(vec!["1".into()])))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_index_op_roundtrip_applies() {
        let index = MemoryIndex::new();
        let op = IndexOp::Index(unit("1", 1, "hello"));
        let json = serde_json::to_string(&op).unwrap();
        let restored: IndexOp = serde_json::from_str(&json).unwrap();
        restored.apply(&index).await.unwrap();
        assert_eq!(index.len(), 1);

        IndexOp::DeleteByQuery(IndexQuery::project("p"))
            .apply(&index)
            .await
            .unwrap();
        assert!(index.is_empty());
    }
}
