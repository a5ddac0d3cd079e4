//! Source registry and series routing
//!
//! The registry maps an exchange key to the ingestion loop that speaks its
//! protocol. The router decides which physical feed serves a series: a
//! derived timeframe is always served by the base-timeframe feed of the same
//! instrument, so one connection feeds every timeframe.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use types::ids::SeriesId;
use types::timeframe::Timeframe;
use uuid::Uuid;

use crate::config::FeedSettings;
use crate::feed::binance::BinanceLoop;
use crate::feed::FeedError;
use crate::pipeline::IngestPipeline;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),
}

/// Everything one run of an ingestion loop works with.
#[derive(Clone)]
pub struct IngestContext {
    pub series_id: SeriesId,
    pub job_id: Uuid,
    pub pipeline: Arc<IngestPipeline>,
    pub settings: Arc<FeedSettings>,
    /// Derived timeframes rolled up from this feed.
    pub derived: Vec<Timeframe>,
    pub cancel: CancellationToken,
}

impl fmt::Debug for IngestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestContext")
            .field("series_id", &self.series_id)
            .field("job_id", &self.job_id)
            .field("derived", &self.derived)
            .finish_non_exhaustive()
    }
}

/// Exchange-specific network loop.
///
/// `run` returns `Ok(())` on cancellation and `Err` on any failure that
/// should count against the job's guardrail.
#[async_trait]
pub trait IngestLoop: Send + Sync {
    async fn run(&self, ctx: IngestContext) -> Result<(), FeedError>;
}

fn normalize(exchange: &str) -> String {
    exchange.trim().to_ascii_lowercase()
}

#[derive(Clone, Default)]
pub struct SourceRegistry {
    loops: HashMap<String, Arc<dyn IngestLoop>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter shipped in this crate.
    pub fn with_builtin_sources() -> Self {
        let mut registry = Self::new();
        registry.register("binance", Arc::new(BinanceLoop::new()));
        registry
    }

    /// Register (or replace) the loop for an exchange.
    pub fn register(&mut self, exchange: &str, ingest: Arc<dyn IngestLoop>) {
        self.loops.insert(normalize(exchange), ingest);
    }

    pub fn resolve(&self, exchange: &str) -> Result<Arc<dyn IngestLoop>, SourceError> {
        self.loops
            .get(&normalize(exchange))
            .cloned()
            .ok_or_else(|| SourceError::UnsupportedExchange(exchange.to_string()))
    }

    pub fn exchanges(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.loops.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("exchanges", &self.exchanges())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRouter {
    base: Timeframe,
    derived: Vec<Timeframe>,
}

impl SeriesRouter {
    /// Derived timeframes that are not longer multiples of `base` are
    /// ignored.
    pub fn new(base: Timeframe, derived: &[Timeframe]) -> Self {
        let mut derived: Vec<Timeframe> = derived
            .iter()
            .copied()
            .filter(|tf| tf.is_multiple_of(base))
            .collect();
        derived.sort();
        derived.dedup();
        Self { base, derived }
    }

    pub fn from_settings(settings: &FeedSettings) -> Self {
        Self::new(settings.base_timeframe, &settings.active_derived())
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.base
    }

    pub fn is_derived(&self, series_id: &SeriesId) -> bool {
        self.derived.contains(&series_id.timeframe())
    }

    /// Series whose physical feed serves `series_id`.
    pub fn route(&self, series_id: &SeriesId) -> SeriesId {
        if self.is_derived(series_id) {
            series_id.with_timeframe(self.base)
        } else {
            series_id.clone()
        }
    }

    /// Derived timeframes rolled up from a feed of `series_id`.
    pub fn derived_timeframes(&self, series_id: &SeriesId) -> Vec<Timeframe> {
        if series_id.timeframe() == self.base {
            self.derived.clone()
        } else {
            Vec::new()
        }
    }

    pub fn derived_for(&self, series_id: &SeriesId) -> Vec<SeriesId> {
        self.derived_timeframes(series_id)
            .into_iter()
            .map(|tf| series_id.with_timeframe(tf))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopLoop;

    #[async_trait]
    impl IngestLoop for NoopLoop {
        async fn run(&self, _ctx: IngestContext) -> Result<(), FeedError> {
            Ok(())
        }
    }

    fn sid(key: &str) -> SeriesId {
        SeriesId::parse(key).unwrap()
    }

    #[test]
    fn test_resolve_normalizes_key() {
        let mut registry = SourceRegistry::new();
        registry.register(" OKX ", Arc::new(NoopLoop));
        assert!(registry.resolve("okx").is_ok());
        assert!(registry.resolve("Okx").is_ok());
        assert_eq!(
            registry.resolve("kraken").err(),
            Some(SourceError::UnsupportedExchange("kraken".to_string()))
        );
    }

    #[test]
    fn test_builtin_sources() {
        let registry = SourceRegistry::with_builtin_sources();
        assert_eq!(registry.exchanges(), vec!["binance".to_string()]);
    }

    #[test]
    fn test_route_derived_to_base() {
        let router = SeriesRouter::new(Timeframe::M1, &[Timeframe::M5, Timeframe::H1]);
        assert_eq!(
            router.route(&sid("binance:spot:BTC/USDT:5m")),
            sid("binance:spot:BTC/USDT:1m")
        );
        // Not configured as derived: served by its own feed.
        assert_eq!(
            router.route(&sid("binance:spot:BTC/USDT:15m")),
            sid("binance:spot:BTC/USDT:15m")
        );
        assert_eq!(
            router.route(&sid("binance:spot:BTC/USDT:1m")),
            sid("binance:spot:BTC/USDT:1m")
        );
    }

    #[test]
    fn test_derived_for_base_only() {
        let router = SeriesRouter::new(Timeframe::M1, &[Timeframe::H1, Timeframe::M5, Timeframe::M1]);
        assert_eq!(
            router.derived_for(&sid("binance:futures:ETH/USDT:1m")),
            vec![
                sid("binance:futures:ETH/USDT:5m"),
                sid("binance:futures:ETH/USDT:1h")
            ]
        );
        assert!(router.derived_for(&sid("binance:futures:ETH/USDT:5m")).is_empty());
    }

    #[test]
    fn test_router_from_disabled_settings() {
        let router = SeriesRouter::from_settings(&FeedSettings::default());
        assert!(!router.is_derived(&sid("binance:spot:BTC/USDT:5m")));
    }
}
