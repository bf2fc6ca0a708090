use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;

#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_path: String,

    // Spellcheck provider
    pub spellcheck_url: String,
    pub spellcheck_language: String,
    pub spellcheck_max_attempts: u32,
    pub spellcheck_initial_delay: Duration,
    pub spellcheck_max_delay: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,

    // Cross-project import
    pub fuzzy_top_k: usize,
    pub import_min_score: f64,
    pub import_author: String,

    // Video references
    pub reference_min_score: f64,
    pub reference_eviction_ratio: f64,
    pub resolver_concurrency: usize,
    pub resolver_batch_size: usize,

    // Background passes (cron, UTC)
    pub resolver_schedule: String,
    pub maintenance_schedule: String,
}

impl Default for Config {
    fn default() -> Self {
        let spellcheck_retry = RetryConfig::spellcheck();
        Self {
            database_path: "translation-ledger.db".to_string(),
            spellcheck_url: "http://localhost:8081/v2/check".to_string(),
            spellcheck_language: "en-US".to_string(),
            spellcheck_max_attempts: spellcheck_retry.max_attempts,
            spellcheck_initial_delay: spellcheck_retry.initial_delay,
            spellcheck_max_delay: spellcheck_retry.max_delay,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            fuzzy_top_k: 5,
            import_min_score: 0.5,
            import_author: "importer".to_string(),
            reference_min_score: 0.6,
            reference_eviction_ratio: 0.8,
            resolver_concurrency: 8,
            resolver_batch_size: 200,
            resolver_schedule: "0 */5 * * * *".to_string(),
            maintenance_schedule: "0 0 * * * *".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            database_path: std::env::var("LEDGER_DATABASE_PATH")
                .unwrap_or(defaults.database_path),

            spellcheck_url: std::env::var("SPELLCHECK_URL").unwrap_or(defaults.spellcheck_url),
            spellcheck_language: std::env::var("SPELLCHECK_LANGUAGE")
                .unwrap_or(defaults.spellcheck_language),
            spellcheck_max_attempts: parse_var("SPELLCHECK_MAX_ATTEMPTS")?
                .unwrap_or(defaults.spellcheck_max_attempts),
            spellcheck_initial_delay: parse_var("SPELLCHECK_INITIAL_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.spellcheck_initial_delay),
            spellcheck_max_delay: parse_var("SPELLCHECK_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.spellcheck_max_delay),
            breaker_failure_threshold: parse_var("SPELLCHECK_BREAKER_THRESHOLD")?
                .unwrap_or(defaults.breaker_failure_threshold),
            breaker_cooldown: parse_var("SPELLCHECK_BREAKER_COOLDOWN_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.breaker_cooldown),

            fuzzy_top_k: parse_var("FUZZY_TOP_K")?.unwrap_or(defaults.fuzzy_top_k),
            import_min_score: parse_var("IMPORT_MIN_SCORE")?.unwrap_or(defaults.import_min_score),
            import_author: std::env::var("IMPORT_AUTHOR").unwrap_or(defaults.import_author),

            reference_min_score: parse_var("REFERENCE_MIN_SCORE")?
                .unwrap_or(defaults.reference_min_score),
            reference_eviction_ratio: parse_var("REFERENCE_EVICTION_RATIO")?
                .unwrap_or(defaults.reference_eviction_ratio),
            resolver_concurrency: parse_var("RESOLVER_CONCURRENCY")?
                .unwrap_or(defaults.resolver_concurrency),
            resolver_batch_size: parse_var("RESOLVER_BATCH_SIZE")?
                .unwrap_or(defaults.resolver_batch_size),

            resolver_schedule: std::env::var("RESOLVER_SCHEDULE")
                .unwrap_or(defaults.resolver_schedule),
            maintenance_schedule: std::env::var("MAINTENANCE_SCHEDULE")
                .unwrap_or(defaults.maintenance_schedule),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the passes cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.spellcheck_max_attempts == 0 {
            anyhow::bail!("SPELLCHECK_MAX_ATTEMPTS must be at least 1");
        }
        if self.fuzzy_top_k == 0 {
            anyhow::bail!("FUZZY_TOP_K must be at least 1");
        }
        if self.resolver_concurrency == 0 || self.resolver_batch_size == 0 {
            anyhow::bail!("RESOLVER_CONCURRENCY and RESOLVER_BATCH_SIZE must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.reference_eviction_ratio) {
            anyhow::bail!(
                "REFERENCE_EVICTION_RATIO must be within 0.0..=1.0, got {}",
                self.reference_eviction_ratio
            );
        }
        Ok(())
    }
}

/// Parse an optional environment variable, failing loudly on malformed values
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        Err(_) => Ok(None),
    }
}
