//! In-process store and hub implementations.
//!
//! Uses BTreeMap per series so reads come back in time order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use types::candle::ClosedCandle;
use types::ids::SeriesId;

use super::{CandleStore, StoreError, SubscriberHub};
use crate::events::HubMessage;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Candle store backed by a map per series.
#[derive(Debug, Default)]
pub struct MemoryCandleStore {
    series: Mutex<HashMap<SeriesId, BTreeMap<i64, ClosedCandle>>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of candles stored for a series.
    pub fn len(&self, series_id: &SeriesId) -> usize {
        lock(&self.series).get(series_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, series_id: &SeriesId) -> bool {
        self.len(series_id) == 0
    }

    /// All candles of a series, ascending.
    pub fn candles(&self, series_id: &SeriesId) -> Vec<ClosedCandle> {
        lock(&self.series)
            .get(series_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn upsert_many(
        &self,
        series_id: &SeriesId,
        candles: &[ClosedCandle],
    ) -> Result<Vec<i64>, StoreError> {
        let mut all = lock(&self.series);
        let rows = all.entry(series_id.clone()).or_default();
        let mut inserted = Vec::new();
        for c in candles {
            if rows.insert(c.candle_time, c.clone()).is_none() {
                inserted.push(c.candle_time);
            }
        }
        Ok(inserted)
    }

    async fn head_time(&self, series_id: &SeriesId) -> Result<Option<i64>, StoreError> {
        Ok(lock(&self.series)
            .get(series_id)
            .and_then(|m| m.keys().next_back().copied()))
    }

    async fn delete_closed_times(
        &self,
        series_id: &SeriesId,
        times: &[i64],
    ) -> Result<usize, StoreError> {
        let mut all = lock(&self.series);
        let Some(rows) = all.get_mut(series_id) else {
            return Ok(0);
        };
        Ok(times.iter().filter(|t| rows.remove(t).is_some()).count())
    }

    async fn read_range(
        &self,
        series_id: &SeriesId,
        start: i64,
        end: i64,
    ) -> Result<Vec<ClosedCandle>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(lock(&self.series)
            .get(series_id)
            .map(|m| m.range(start..=end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }
}

/// Hub that records every published message.
#[derive(Debug, Default)]
pub struct RecordingHub {
    messages: Mutex<Vec<HubMessage>>,
    failing: AtomicBool,
}

impl RecordingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<HubMessage> {
        lock(&self.messages).clone()
    }

    pub fn take(&self) -> Vec<HubMessage> {
        std::mem::take(&mut *lock(&self.messages))
    }

    fn record(&self, msg: HubMessage) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable { component: "hub" });
        }
        lock(&self.messages).push(msg);
        Ok(())
    }
}

#[async_trait]
impl SubscriberHub for RecordingHub {
    async fn publish_closed(
        &self,
        series_id: &SeriesId,
        candle: &ClosedCandle,
    ) -> Result<(), StoreError> {
        self.record(HubMessage::CandleClosed {
            series_id: series_id.clone(),
            candle: candle.clone(),
        })
    }

    async fn publish_closed_batch(
        &self,
        series_id: &SeriesId,
        candles: &[ClosedCandle],
    ) -> Result<(), StoreError> {
        self.record(HubMessage::CandlesClosed {
            series_id: series_id.clone(),
            candles: candles.to_vec(),
        })
    }

    async fn publish_system(
        &self,
        series_id: &SeriesId,
        event: &str,
        message: &str,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.record(HubMessage::System {
            series_id: series_id.clone(),
            event: event.to_string(),
            message: message.to_string(),
            data,
        })
    }

    async fn publish_forming(
        &self,
        series_id: &SeriesId,
        candle: &ClosedCandle,
    ) -> Result<(), StoreError> {
        self.record(HubMessage::CandleForming {
            series_id: series_id.clone(),
            candle: candle.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sid() -> SeriesId {
        SeriesId::parse("binance:spot:BTC/USDT:1m").unwrap()
    }

    fn bar(t: i64) -> ClosedCandle {
        ClosedCandle::flat(t, Decimal::from(t), Decimal::ONE)
    }

    #[tokio::test]
    async fn test_upsert_reports_new_times_only() {
        let store = MemoryCandleStore::new();
        let first = store.upsert_many(&sid(), &[bar(60), bar(120)]).await.unwrap();
        assert_eq!(first, vec![60, 120]);

        let second = store.upsert_many(&sid(), &[bar(120), bar(180)]).await.unwrap();
        assert_eq!(second, vec![180]);
        assert_eq!(store.head_time(&sid()).await.unwrap(), Some(180));
    }

    #[tokio::test]
    async fn test_delete_and_range() {
        let store = MemoryCandleStore::new();
        store
            .upsert_many(&sid(), &[bar(60), bar(120), bar(180)])
            .await
            .unwrap();

        let removed = store.delete_closed_times(&sid(), &[180, 999]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.head_time(&sid()).await.unwrap(), Some(120));

        let range = store.read_range(&sid(), 100, 200).await.unwrap();
        assert_eq!(range, vec![bar(120)]);
        assert!(store.read_range(&sid(), 200, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recording_hub_failure_toggle() {
        let hub = RecordingHub::new();
        hub.publish_closed(&sid(), &bar(60)).await.unwrap();
        hub.set_failing(true);
        assert!(hub.publish_closed(&sid(), &bar(120)).await.is_err());
        hub.set_failing(false);
        assert_eq!(hub.take().len(), 1);
        assert!(hub.messages().is_empty());
    }
}
