//! Service configuration
//!
//! Loaded from JSON (every field optional, defaults below) and then
//! overridden by `MARKET_INGEST_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use types::ids::{MarketKind, SeriesId};
use types::timeframe::Timeframe;

use crate::guardrail::GuardrailConfig;
use crate::pipeline::PipelineConfig;

pub const ENV_PREFIX: &str = "MARKET_INGEST_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the network hot path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Timeframe physically subscribed at the exchange.
    pub base_timeframe: Timeframe,
    /// Timeframes rolled up locally from the base feed.
    pub derived_timeframes: Vec<Timeframe>,
    pub derived_enabled: bool,
    /// Quiet period after which buffered closed candles are flushed.
    pub flush_idle_ms: u64,
    /// Buffered closed candles that force a flush.
    pub batch_max: usize,
    /// Minimum spacing of derived forming updates per series.
    pub forming_min_interval_ms: u64,
    pub binance_spot_ws_url: String,
    pub binance_futures_ws_url: String,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            base_timeframe: Timeframe::M1,
            derived_timeframes: vec![Timeframe::M5, Timeframe::M15, Timeframe::H1],
            derived_enabled: false,
            flush_idle_ms: 1_000,
            batch_max: 50,
            forming_min_interval_ms: 250,
            binance_spot_ws_url: "wss://stream.binance.com:9443".to_string(),
            binance_futures_ws_url: "wss://fstream.binance.com".to_string(),
        }
    }
}

impl FeedSettings {
    pub fn flush_idle(&self) -> Duration {
        Duration::from_millis(self.flush_idle_ms)
    }

    pub fn forming_min_interval(&self) -> Duration {
        Duration::from_millis(self.forming_min_interval_ms)
    }

    /// Derived timeframes in effect (empty when disabled).
    pub fn active_derived(&self) -> Vec<Timeframe> {
        if !self.derived_enabled {
            return Vec::new();
        }
        let mut out: Vec<Timeframe> = self
            .derived_timeframes
            .iter()
            .copied()
            .filter(|tf| *tf != self.base_timeframe)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn binance_ws_url(&self, market: MarketKind) -> &str {
        match market {
            MarketKind::Spot => &self.binance_spot_ws_url,
            MarketKind::Futures => &self.binance_futures_ws_url,
        }
    }
}

/// Top-level supervisor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Series kept permanently running when `enable_whitelist` is set.
    pub whitelist: Vec<SeriesId>,
    pub enable_whitelist: bool,
    /// On-demand job limit; 0 disables it.
    pub max_jobs: usize,
    pub idle_ttl_ms: u64,
    pub reaper_tick_ms: u64,
    pub guardrail: GuardrailConfig,
    pub feed: FeedSettings,
    pub pipeline: PipelineConfig,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            enable_whitelist: false,
            max_jobs: 64,
            idle_ttl_ms: 60_000,
            reaper_tick_ms: 1_000,
            guardrail: GuardrailConfig::default(),
            feed: FeedSettings::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl IngestSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn reaper_tick(&self) -> Duration {
        Duration::from_millis(self.reaper_tick_ms)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, keyed by full variable name.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("WHITELIST") {
            self.whitelist = parse_list(&key, &value, SeriesId::parse)?;
        }
        if let Some((key, value)) = get("ENABLE_WHITELIST") {
            self.enable_whitelist = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_JOBS") {
            self.max_jobs = parse_value(&key, &value)?;
        }
        if let Some((key, value)) = get("IDLE_TTL_MS") {
            self.idle_ttl_ms = parse_value(&key, &value)?;
        }
        if let Some((key, value)) = get("REAPER_TICK_MS") {
            self.reaper_tick_ms = parse_value(&key, &value)?;
        }
        if let Some((key, value)) = get("BASE_TIMEFRAME") {
            self.feed.base_timeframe = parse_value(&key, &value)?;
        }
        if let Some((key, value)) = get("DERIVED_TIMEFRAMES") {
            self.feed.derived_timeframes = parse_list(&key, &value, Timeframe::parse)?;
        }
        if let Some((key, value)) = get("DERIVED_ENABLED") {
            self.feed.derived_enabled = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = get("CRASH_BUDGET") {
            self.guardrail.crash_budget = parse_value(&key, &value)?;
        }
        if let Some((_, value)) = get("BINANCE_SPOT_WS_URL") {
            self.feed.binance_spot_ws_url = value;
        }
        if let Some((_, value)) = get("BINANCE_FUTURES_WS_URL") {
            self.feed.binance_futures_ws_url = value;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reaper_tick_ms == 0 {
            return Err(ConfigError::Invalid("reaper_tick_ms must be positive".into()));
        }
        if self.feed.batch_max == 0 {
            return Err(ConfigError::Invalid("feed.batch_max must be positive".into()));
        }
        if self.feed.flush_idle_ms == 0 {
            return Err(ConfigError::Invalid("feed.flush_idle_ms must be positive".into()));
        }
        if self.guardrail.crash_budget == 0 {
            return Err(ConfigError::Invalid("guardrail.crash_budget must be positive".into()));
        }
        if self.guardrail.backoff_initial_ms > self.guardrail.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "guardrail.backoff_initial_ms exceeds backoff_max_ms".into(),
            ));
        }
        let base = self.feed.base_timeframe;
        if let Some(tf) = self
            .feed
            .active_derived()
            .into_iter()
            .find(|tf| !tf.is_multiple_of(base))
        {
            return Err(ConfigError::Invalid(format!(
                "derived timeframe {tf} is not a multiple of base {base}"
            )));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| invalid(key, value, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

fn parse_list<T, E, F>(key: &str, value: &str, parse: F) -> Result<Vec<T>, ConfigError>
where
    F: Fn(&str) -> Result<T, E>,
    E: std::fmt::Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse(s).map_err(|e| invalid(key, value, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = IngestSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.reaper_tick(), Duration::from_secs(1));
        assert!(settings.feed.active_derived().is_empty());
    }

    #[test]
    fn test_from_json_partial_document() {
        let settings = IngestSettings::from_json_str(
            r#"{
                "whitelist": ["binance:futures:BTC/USDT:1m"],
                "enable_whitelist": true,
                "max_jobs": 4,
                "guardrail": { "crash_budget": 3 },
                "feed": { "derived_enabled": true, "derived_timeframes": ["5m", "1h", "5m"] }
            }"#,
        )
        .unwrap();
        assert_eq!(settings.max_jobs, 4);
        assert_eq!(settings.guardrail.crash_budget, 3);
        assert_eq!(settings.guardrail.open_cooldown_ms, 120_000);
        assert_eq!(settings.whitelist[0].symbol(), "BTC/USDT");
        assert_eq!(
            settings.feed.active_derived(),
            vec![Timeframe::M5, Timeframe::H1]
        );
    }

    #[test]
    fn test_rejects_derived_not_multiple_of_base() {
        let err = IngestSettings::from_json_str(
            r#"{ "feed": { "base_timeframe": "3m", "derived_enabled": true, "derived_timeframes": ["5m"] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = IngestSettings::default();
        settings
            .apply_env_from(env(&[
                ("MARKET_INGEST_WHITELIST", "binance:spot:ETH/USDT:1m, binance:futures:BTC/USDT:1m"),
                ("MARKET_INGEST_ENABLE_WHITELIST", "yes"),
                ("MARKET_INGEST_MAX_JOBS", "0"),
                ("MARKET_INGEST_DERIVED_TIMEFRAMES", "15m,4h"),
            ]))
            .unwrap();
        assert_eq!(settings.whitelist.len(), 2);
        assert!(settings.enable_whitelist);
        assert_eq!(settings.max_jobs, 0);
        assert_eq!(
            settings.feed.derived_timeframes,
            vec![Timeframe::M15, Timeframe::H4]
        );
    }

    #[test]
    fn test_env_bad_value_names_variable() {
        let mut settings = IngestSettings::default();
        let err = settings
            .apply_env_from(env(&[("MARKET_INGEST_MAX_JOBS", "many")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidEnv { key, .. } => assert_eq!(key, "MARKET_INGEST_MAX_JOBS"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_feed_url_per_market() {
        let feed = FeedSettings::default();
        assert!(feed.binance_ws_url(MarketKind::Futures).contains("fstream"));
        assert!(feed.binance_ws_url(MarketKind::Spot).contains("stream.binance.com"));
    }
}
