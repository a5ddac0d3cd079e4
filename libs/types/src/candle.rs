//! Closed candles and per-series batches
//!
//! Uses `Decimal` for all price and volume values so aggregation is exact
//! and reproducible.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::SeriesId;

/// A finalized OHLCV bar.
///
/// `candle_time` is the bucket open time in seconds and is the unique key of
/// a candle within its series. Feeds use the same shape for a forming
/// (not yet closed) bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedCandle {
    pub candle_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl ClosedCandle {
    pub fn new(
        candle_time: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            candle_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A bar where every price equals `price`.
    pub fn flat(candle_time: i64, price: Decimal, volume: Decimal) -> Self {
        Self::new(candle_time, price, price, price, price, volume)
    }

    /// Validate candle integrity (OHLCV invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
    }
}

/// Candles for one series, strictly increasing by time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesBatch {
    pub series_id: SeriesId,
    pub candles: Vec<ClosedCandle>,
    /// Latest candle time in the batch.
    pub up_to_time: i64,
}

impl SeriesBatch {
    /// Build a batch, sorting by time and keeping the last value seen for a
    /// duplicated time. Returns `None` when `candles` is empty.
    pub fn from_candles(
        series_id: SeriesId,
        candles: impl IntoIterator<Item = ClosedCandle>,
    ) -> Option<Self> {
        let by_time: BTreeMap<i64, ClosedCandle> = candles
            .into_iter()
            .map(|c| (c.candle_time, c))
            .collect();
        let up_to_time = *by_time.keys().next_back()?;
        Some(Self {
            series_id,
            candles: by_time.into_values().collect(),
            up_to_time,
        })
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Candle times in this batch, ascending.
    pub fn times(&self) -> Vec<i64> {
        self.candles.iter().map(|c| c.candle_time).collect()
    }
}
