use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::metrics::LedgerMetrics;
use crate::models::SpellIssue;
use crate::retry::{with_retry_if, CircuitBreaker, RetryConfig};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpellcheckError {
    /// The provider refused the request; retrying will not help
    #[error("Spellcheck provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Spellcheck provider failed: {0}")]
    Transient(String),
}

impl SpellcheckError {
    /// Rate limits and server-side failures are retried, other client errors are not
    pub fn is_retryable(&self) -> bool {
        match self {
            SpellcheckError::Rejected { status, .. } => *status == 429 || *status >= 500,
            SpellcheckError::Transient(_) => true,
        }
    }
}

#[async_trait]
pub trait SpellChecker: Send + Sync {
    async fn check(&self, text: &str) -> std::result::Result<Vec<SpellIssue>, SpellcheckError>;
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    matches: Vec<CheckMatch>,
}

#[derive(Debug, Deserialize)]
struct CheckMatch {
    offset: usize,
    length: usize,
    #[serde(default)]
    replacements: Vec<Replacement>,
}

#[derive(Debug, Deserialize)]
struct Replacement {
    value: String,
}

/// Client for a LanguageTool-compatible `/v2/check` endpoint
#[derive(Debug, Clone)]
pub struct HttpSpellChecker {
    client: reqwest::Client,
    url: String,
    language: String,
}

impl HttpSpellChecker {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            language: language.into(),
        }
    }

    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        Self::new(client, &config.spellcheck_url, &config.spellcheck_language)
    }
}

#[async_trait]
impl SpellChecker for HttpSpellChecker {
    async fn check(&self, text: &str) -> std::result::Result<Vec<SpellIssue>, SpellcheckError> {
        let response = self
            .client
            .post(&self.url)
            .form(&[("text", text), ("language", self.language.as_str())])
            .send()
            .await
            .map_err(|e| SpellcheckError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            return Err(SpellcheckError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CheckResponse = response
            .json()
            .await
            .map_err(|e| SpellcheckError::Transient(format!("invalid response: {}", e)))?;

        Ok(issues_from_matches(text, parsed.matches))
    }
}

/// Turn provider matches into issues, dropping spans that fall outside the text
fn issues_from_matches(text: &str, matches: Vec<CheckMatch>) -> Vec<SpellIssue> {
    let chars: Vec<char> = text.chars().collect();
    matches
        .into_iter()
        .filter_map(|m| {
            let end = m.offset.checked_add(m.length)?;
            if end > chars.len() {
                return None;
            }
            Some(SpellIssue {
                word: chars[m.offset..end].iter().collect(),
                position: m.offset,
                suggestions: m.replacements.into_iter().map(|r| r.value).collect(),
            })
        })
        .collect()
}

/// Spellcheck calls as the ledger makes them: bounded retries behind a breaker
pub struct SpellcheckGateway {
    checker: Arc<dyn SpellChecker>,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    metrics: Arc<LedgerMetrics>,
}

impl SpellcheckGateway {
    pub fn new(
        checker: Arc<dyn SpellChecker>,
        retry: RetryConfig,
        breaker: CircuitBreaker,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            checker,
            retry,
            breaker,
            metrics,
        }
    }

    pub fn from_config(
        checker: Arc<dyn SpellChecker>,
        config: &Config,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        let retry = RetryConfig {
            max_attempts: config.spellcheck_max_attempts,
            initial_delay: config.spellcheck_initial_delay,
            max_delay: config.spellcheck_max_delay,
            ..RetryConfig::spellcheck()
        };
        let breaker = CircuitBreaker::new(
            "Spellcheck",
            config.breaker_failure_threshold,
            config.breaker_cooldown,
        );
        Self::new(checker, retry, breaker, metrics)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn check(&self, text: &str) -> Result<Vec<SpellIssue>> {
        if !self.breaker.allow() {
            self.metrics.record_spellcheck_rejected();
            return Err(LedgerError::SpellcheckUnavailable(
                "circuit breaker is open".to_string(),
            ));
        }

        self.metrics.record_spellcheck_call();
        let result = with_retry_if(
            &self.retry,
            "Spellcheck",
            || self.checker.check(text),
            SpellcheckError::is_retryable,
        )
        .await;

        match result {
            Ok(issues) => {
                self.breaker.record_success();
                debug!("Spellcheck found {} issues", issues.len());
                Ok(issues)
            }
            Err(e) => {
                self.metrics.record_spellcheck_failure();
                // Rejections are our fault, not the provider's
                if e.is_retryable() {
                    self.breaker.record_failure();
                }
                warn!("Spellcheck failed: {}", e);
                Err(LedgerError::SpellcheckUnavailable(e.to_string()))
            }
        }
    }
}

/// Per-project count of spelling issues across live heads.
///
/// Process-scoped; every mutating ledger operation on a project must call
/// `invalidate` for it. Each invalidation bumps the project's generation,
/// and `store` refuses totals computed under an older generation.
#[derive(Debug, Default)]
pub struct SpellcheckTotals {
    state: RwLock<TotalsState>,
}

#[derive(Debug, Default)]
struct TotalsState {
    totals: HashMap<String, u64>,
    generations: HashMap<String, u64>,
}

impl SpellcheckTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, project: &str) -> Option<u64> {
        self.read().totals.get(project).copied()
    }

    /// Read before counting and pass to `store`
    pub fn generation(&self, project: &str) -> u64 {
        self.read().generations.get(project).copied().unwrap_or(0)
    }

    /// Cache `total` unless the project was invalidated since `generation`.
    /// Returns whether it was stored.
    pub fn store(&self, project: &str, generation: u64, total: u64) -> bool {
        let mut state = self.write();
        if state.generations.get(project).copied().unwrap_or(0) != generation {
            return false;
        }
        state.totals.insert(project.to_string(), total);
        true
    }

    pub fn invalidate(&self, project: &str) {
        let mut state = self.write();
        state.totals.remove(project);
        *state.generations.entry(project.to_string()).or_insert(0) += 1;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TotalsState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TotalsState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use wiremock::{
        matchers::{body_string_contains, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn fast_gateway(checker: Arc<dyn SpellChecker>, threshold: u32) -> SpellcheckGateway {
        SpellcheckGateway::new(
            checker,
            RetryConfig::new(3, Duration::from_millis(5)),
            CircuitBreaker::new("test", threshold, Duration::from_secs(60)),
            Arc::new(LedgerMetrics::new()),
        )
    }

    struct FlakyChecker {
        calls: AtomicU32,
        fail_first: u32,
        error: SpellcheckError,
    }

    #[async_trait]
    impl SpellChecker for FlakyChecker {
        async fn check(
            &self,
            _text: &str,
        ) -> std::result::Result<Vec<SpellIssue>, SpellcheckError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(vec![])
            }
        }
    }

    // ==================== Response Mapping Tests ====================

    #[test]
    fn test_issues_from_matches_extracts_words() {
        let matches = vec![CheckMatch {
            offset: 4,
            length: 5,
            replacements: vec![Replacement {
                value: "quick".into(),
            }],
        }];
        let issues = issues_from_matches("the qiuck fox", matches);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].word, "qiuck");
        assert_eq!(issues[0].position, 4);
        assert_eq!(issues[0].suggestions, vec!["quick".to_string()]);
    }

    #[test]
    fn test_issues_from_matches_drops_out_of_range() {
        let matches = vec![CheckMatch {
            offset: 10,
            length: 5,
            replacements: vec![],
        }];
        assert!(issues_from_matches("short", matches).is_empty());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SpellcheckError::Transient("timeout".into()).is_retryable());
        assert!(SpellcheckError::Rejected { status: 503, body: String::new() }.is_retryable());
        assert!(SpellcheckError::Rejected { status: 429, body: String::new() }.is_retryable());
        assert!(!SpellcheckError::Rejected { status: 400, body: String::new() }.is_retryable());
    }

    // ==================== HTTP Client Tests ====================

    #[tokio::test]
    async fn test_http_spellchecker_parses_matches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/check"))
            .and(body_string_contains("language=fr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "matches": [
                    {"offset": 0, "length": 7, "replacements": [{"value": "Bonjour"}]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let checker = HttpSpellChecker::new(
            reqwest::Client::new(),
            format!("{}/v2/check", server.uri()),
            "fr",
        );
        let issues = checker.check("Bonjuor le monde").await.expect("should succeed");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].word, "Bonjuor");
    }

    #[tokio::test]
    async fn test_http_spellchecker_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad language"))
            .mount(&server)
            .await;

        let checker = HttpSpellChecker::new(reqwest::Client::new(), server.uri(), "xx");
        let err = checker.check("text").await.unwrap_err();
        assert_eq!(
            err,
            SpellcheckError::Rejected {
                status: 400,
                body: "bad language".into()
            }
        );
    }

    #[tokio::test]
    async fn test_gateway_retries_server_errors_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"matches": []})),
            )
            .mount(&server)
            .await;

        let checker = Arc::new(HttpSpellChecker::new(reqwest::Client::new(), server.uri(), "en"));
        let gateway = fast_gateway(checker, 5);
        assert!(gateway.check("fine text").await.unwrap().is_empty());
    }

    // ==================== Gateway Tests ====================

    #[tokio::test]
    async fn test_gateway_gives_up_after_bounded_attempts() {
        let checker = Arc::new(FlakyChecker {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            error: SpellcheckError::Transient("connection reset".into()),
        });
        let gateway = fast_gateway(checker.clone(), 10);

        let err = gateway.check("text").await.unwrap_err();
        assert!(matches!(err, LedgerError::SpellcheckUnavailable(_)));
        assert_eq!(checker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gateway_opens_breaker_and_fails_fast() {
        let checker = Arc::new(FlakyChecker {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            error: SpellcheckError::Transient("down".into()),
        });
        let gateway = fast_gateway(checker.clone(), 1);

        assert!(gateway.check("a").await.is_err());
        let calls_after_first = checker.calls.load(Ordering::SeqCst);

        let err = gateway.check("b").await.unwrap_err();
        assert!(err.to_string().contains("circuit breaker is open"));
        assert_eq!(checker.calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(gateway.metrics.report().spellcheck_rejected, 1);
    }

    #[tokio::test]
    async fn test_gateway_client_error_does_not_trip_breaker() {
        let checker = Arc::new(FlakyChecker {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            error: SpellcheckError::Rejected {
                status: 400,
                body: "bad".into(),
            },
        });
        let gateway = fast_gateway(checker.clone(), 1);

        assert!(gateway.check("a").await.is_err());
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
        assert!(gateway.breaker().allow());
    }

    // ==================== Totals Cache Tests ====================

    #[test]
    fn test_totals_store_and_invalidate() {
        let totals = SpellcheckTotals::new();
        assert_eq!(totals.get("p"), None);
        assert!(totals.store("p", totals.generation("p"), 4));
        assert!(totals.store("q", totals.generation("q"), 1));
        assert_eq!(totals.get("p"), Some(4));
        totals.invalidate("p");
        assert_eq!(totals.get("p"), None);
        assert_eq!(totals.get("q"), Some(1));
    }

    #[test]
    fn test_totals_reject_count_taken_before_invalidation() {
        let totals = SpellcheckTotals::new();
        let generation = totals.generation("p");

        // A submit commits and invalidates while the old count is in flight
        totals.invalidate("p");
        assert!(!totals.store("p", generation, 3));
        assert_eq!(totals.get("p"), None);

        assert!(totals.store("p", totals.generation("p"), 4));
        assert_eq!(totals.get("p"), Some(4));
        assert_eq!(totals.generation("q"), 0);
    }
}
