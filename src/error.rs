use crate::models::UnitKey;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors surfaced by the ledger and the reconciliation passes.
///
/// A stale head link is deliberately absent: it is reported through
/// `SubmitReceipt::stale_head_link` and the metrics, never as a failure.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// No text unit exists at the requested position
    #[error("Text unit not found: {0}")]
    UnitNotFound(UnitKey),

    #[error("Revision not found: {0}")]
    RevisionNotFound(i64),

    /// Search index call failed; callers treat this as best-effort
    #[error("Search index unavailable: {0}")]
    IndexUnavailable(String),

    /// Spellcheck provider failed after bounded retries, or the breaker is open
    #[error("Spellcheck unavailable: {0}")]
    SpellcheckUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Whether the error comes from an external collaborator that may recover on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::IndexUnavailable(_) | LedgerError::SpellcheckUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_not_found_message_includes_key() {
        let err = LedgerError::UnitNotFound(UnitKey::new("proj", "0001_main", 7));
        assert_eq!(err.to_string(), "Text unit not found: proj/0001_main#7");
    }

    #[test]
    fn test_transient_errors() {
        assert!(LedgerError::IndexUnavailable("down".into()).is_transient());
        assert!(LedgerError::SpellcheckUnavailable("open".into()).is_transient());
        assert!(!LedgerError::RevisionNotFound(3).is_transient());
        assert!(!LedgerError::Config("bad".into()).is_transient());
    }
}
