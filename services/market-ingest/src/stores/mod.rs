//! Contracts for the stores and engines the pipeline writes through.
//!
//! The pipeline never depends on a storage engine directly; it only sees
//! these traits. `memory` holds in-process implementations used by tests and
//! local runs.

pub mod memory;

use async_trait::async_trait;
use types::candle::ClosedCandle;
use types::ids::SeriesId;

/// Failure reported by an external store, engine or hub.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{component} backend failure: {message}")]
    Backend {
        component: &'static str,
        message: String,
    },

    #[error("{component} unavailable")]
    Unavailable { component: &'static str },
}

impl StoreError {
    pub fn backend(component: &'static str, message: impl Into<String>) -> Self {
        StoreError::Backend {
            component,
            message: message.into(),
        }
    }
}

/// Raw closed-candle store.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert or replace candles; returns the times that did not exist before.
    async fn upsert_many(
        &self,
        series_id: &SeriesId,
        candles: &[ClosedCandle],
    ) -> Result<Vec<i64>, StoreError>;

    /// Latest closed candle time recorded for the series.
    async fn head_time(&self, series_id: &SeriesId) -> Result<Option<i64>, StoreError>;

    /// Delete candles at the given times; returns how many rows went away.
    async fn delete_closed_times(
        &self,
        series_id: &SeriesId,
        times: &[i64],
    ) -> Result<usize, StoreError>;

    /// Candles with `start <= candle_time <= end`, ascending.
    async fn read_range(
        &self,
        series_id: &SeriesId,
        start: i64,
        end: i64,
    ) -> Result<Vec<ClosedCandle>, StoreError>;
}

/// Outcome of a factor-engine ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactorIngestOutcome {
    /// The engine discarded its incremental state and recomputed from
    /// scratch.
    pub rebuilt: bool,
}

/// Pattern/factor detection engine (black box).
#[async_trait]
pub trait FactorEngine: Send + Sync {
    async fn ingest_closed(
        &self,
        series_id: &SeriesId,
        up_to_time: i64,
    ) -> Result<FactorIngestOutcome, StoreError>;

    async fn head_time(&self, series_id: &SeriesId) -> Result<Option<i64>, StoreError>;
}

/// Chart-overlay / derived-view engine.
#[async_trait]
pub trait OverlayEngine: Send + Sync {
    async fn reset_series(&self, series_id: &SeriesId) -> Result<(), StoreError>;

    async fn ingest_closed(&self, series_id: &SeriesId, up_to_time: i64) -> Result<(), StoreError>;

    async fn head_time(&self, series_id: &SeriesId) -> Result<Option<i64>, StoreError>;
}

/// Fan-out point towards subscribed clients.
#[async_trait]
pub trait SubscriberHub: Send + Sync {
    async fn publish_closed(
        &self,
        series_id: &SeriesId,
        candle: &ClosedCandle,
    ) -> Result<(), StoreError>;

    async fn publish_closed_batch(
        &self,
        series_id: &SeriesId,
        candles: &[ClosedCandle],
    ) -> Result<(), StoreError>;

    async fn publish_system(
        &self,
        series_id: &SeriesId,
        event: &str,
        message: &str,
        data: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Forming (not yet closed) candle update. Hubs without live charts may
    /// ignore it.
    async fn publish_forming(
        &self,
        _series_id: &SeriesId,
        _candle: &ClosedCandle,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}
