//! Timeframe fanout
//!
//! Folds a stream of base-interval candles into longer derived intervals.
//! A derived candle is emitted only once every sub-interval of its bucket
//! has been seen; partial buckets never emit.
//!
//! Candle boundaries are aligned to epoch (a 5m bucket starts on a multiple
//! of 300s). When an incoming candle belongs to a different bucket than the
//! one being tracked, tracking restarts on the new bucket and the partial
//! progress is discarded. This includes candles arriving for an earlier
//! bucket: there is no retroactive correction of an already emitted bucket.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};
use types::candle::{ClosedCandle, SeriesBatch};
use types::ids::SeriesId;
use types::timeframe::Timeframe;

/// Errors raised when building a fanout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanoutError {
    #[error("derived timeframe {derived} is not a longer exact multiple of base {base}")]
    NotAMultiple { base: Timeframe, derived: Timeframe },

    #[error("derived timeframe {0} listed more than once")]
    Duplicate(Timeframe),
}

/// Aggregate complete sub-candles (ascending time) into one derived candle.
///
/// Shared by the streaming path and [`rollup_closed_candles`] so both produce
/// identical results for the same inputs.
fn aggregate<'a>(
    bucket_time: i64,
    parts: impl IntoIterator<Item = &'a ClosedCandle>,
) -> Option<ClosedCandle> {
    let mut iter = parts.into_iter();
    let first = iter.next()?;
    let mut out = ClosedCandle {
        candle_time: bucket_time,
        ..first.clone()
    };
    for c in iter {
        if c.high > out.high {
            out.high = c.high;
        }
        if c.low < out.low {
            out.low = c.low;
        }
        out.close = c.close;
        out.volume += c.volume;
    }
    Some(out)
}

fn validate_derived(base: Timeframe, derived: &[Timeframe]) -> Result<(), FanoutError> {
    for (i, tf) in derived.iter().enumerate() {
        if !tf.is_multiple_of(base) {
            return Err(FanoutError::NotAMultiple {
                base,
                derived: *tf,
            });
        }
        if derived[..i].contains(tf) {
            return Err(FanoutError::Duplicate(*tf));
        }
    }
    Ok(())
}

/// Aggregate a closed historical range of base candles into derived candles.
///
/// Input may be unordered and contain duplicates (latest value wins). Only
/// complete buckets are returned, ascending.
pub fn rollup_closed_candles(
    base: Timeframe,
    derived: Timeframe,
    candles: &[ClosedCandle],
) -> Result<Vec<ClosedCandle>, FanoutError> {
    validate_derived(base, &[derived])?;
    let expected = (derived.seconds() / base.seconds()) as usize;

    let mut buckets: BTreeMap<i64, BTreeMap<i64, &ClosedCandle>> = BTreeMap::new();
    for c in candles {
        let bucket = derived.align(c.candle_time);
        let offset = (base.align(c.candle_time) - bucket) / base.seconds();
        buckets.entry(bucket).or_default().insert(offset, c);
    }

    Ok(buckets
        .into_iter()
        .filter(|(_, parts)| parts.len() == expected)
        .filter_map(|(bucket, parts)| aggregate(bucket, parts.into_values()))
        .collect())
}

/// Streaming state for one (base series, derived timeframe) pair.
#[derive(Debug, Clone)]
struct DerivedBucket {
    timeframe: Timeframe,
    series_id: SeriesId,
    expected: usize,
    /// Open time of the bucket currently collected.
    bucket_open: Option<i64>,
    /// Sub-interval offset → closed base candle.
    parts: BTreeMap<i64, ClosedCandle>,
    /// Open time of the last fully emitted bucket.
    last_emitted: Option<i64>,
    last_forming_emit: Option<Instant>,
}

impl DerivedBucket {
    fn new(base: &SeriesId, timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            series_id: base.with_timeframe(timeframe),
            expected: (timeframe.seconds() / base.timeframe().seconds()) as usize,
            bucket_open: None,
            parts: BTreeMap::new(),
            last_emitted: None,
            last_forming_emit: None,
        }
    }

    fn already_emitted(&self, bucket: i64) -> bool {
        self.last_emitted.is_some_and(|last| bucket <= last)
    }

    fn on_closed(&mut self, base: Timeframe, candle: &ClosedCandle) -> Option<ClosedCandle> {
        let bucket = self.timeframe.align(candle.candle_time);
        if self.bucket_open != Some(bucket) {
            if !self.parts.is_empty() {
                trace!(
                    series = %self.series_id,
                    dropped_bucket = ?self.bucket_open,
                    collected = self.parts.len(),
                    "Resetting partial derived bucket"
                );
            }
            self.bucket_open = Some(bucket);
            self.parts.clear();
        }

        let offset = (base.align(candle.candle_time) - bucket) / base.seconds();
        self.parts.insert(offset, candle.clone());

        if self.parts.len() < self.expected || self.already_emitted(bucket) {
            return None;
        }
        let derived = aggregate(bucket, self.parts.values())?;
        self.last_emitted = Some(bucket);
        Some(derived)
    }

    fn on_forming(
        &mut self,
        base: Timeframe,
        candle: &ClosedCandle,
        now: Instant,
        min_interval: Duration,
    ) -> Option<ClosedCandle> {
        let bucket = self.timeframe.align(candle.candle_time);
        if self.already_emitted(bucket) {
            return None;
        }
        if let Some(prev) = self.last_forming_emit {
            if now.saturating_duration_since(prev) < min_interval {
                return None;
            }
        }

        let offset = (base.align(candle.candle_time) - bucket) / base.seconds();
        let collected: Vec<&ClosedCandle> = if self.bucket_open == Some(bucket) {
            self.parts.range(..offset).map(|(_, c)| c).collect()
        } else {
            Vec::new()
        };
        let forming = aggregate(bucket, collected.into_iter().chain(std::iter::once(candle)))?;
        self.last_forming_emit = Some(now);
        Some(forming)
    }
}

/// Expands base-series candles into one or more derived series.
#[derive(Debug, Clone)]
pub struct TimeframeFanout {
    base: SeriesId,
    buckets: Vec<DerivedBucket>,
    forming_min_interval: Duration,
}

impl TimeframeFanout {
    /// Create a fanout for `base`. Every derived timeframe must be a longer
    /// exact multiple of the base timeframe.
    pub fn new(
        base: SeriesId,
        derived: &[Timeframe],
        forming_min_interval: Duration,
    ) -> Result<Self, FanoutError> {
        validate_derived(base.timeframe(), derived)?;
        let buckets = derived
            .iter()
            .map(|tf| DerivedBucket::new(&base, *tf))
            .collect();
        Ok(Self {
            base,
            buckets,
            forming_min_interval,
        })
    }

    pub fn base(&self) -> &SeriesId {
        &self.base
    }

    /// Derived series fed by this fanout.
    pub fn derived_series(&self) -> Vec<SeriesId> {
        self.buckets.iter().map(|b| b.series_id.clone()).collect()
    }

    /// Fold newly closed base candles (ascending time).
    ///
    /// Returns one batch per derived series that completed at least one
    /// bucket.
    pub fn on_closed(&mut self, candles: &[ClosedCandle]) -> Vec<SeriesBatch> {
        let base_tf = self.base.timeframe();
        let mut out = Vec::new();
        for bucket in &mut self.buckets {
            let emitted: Vec<ClosedCandle> = candles
                .iter()
                .filter_map(|c| bucket.on_closed(base_tf, c))
                .collect();
            if let Some(batch) = SeriesBatch::from_candles(bucket.series_id.clone(), emitted) {
                debug!(
                    series = %batch.series_id,
                    count = batch.len(),
                    up_to = batch.up_to_time,
                    "Derived candles closed"
                );
                out.push(batch);
            }
        }
        out
    }

    /// Best-effort forming candles for derived series, throttled per series.
    pub fn on_forming(
        &mut self,
        candle: &ClosedCandle,
        now: Instant,
    ) -> Vec<(SeriesId, ClosedCandle)> {
        let base_tf = self.base.timeframe();
        let min_interval = self.forming_min_interval;
        self.buckets
            .iter_mut()
            .filter_map(|b| {
                b.on_forming(base_tf, candle, now, min_interval)
                    .map(|c| (b.series_id.clone(), c))
            })
            .collect()
    }
}
