//! Dependent-ledger catch-up for read paths
//!
//! Read paths that serve candles together with factor or overlay state call
//! this service first so both come from the same candle head. The hot
//! ingestion path never raises [`LedgerError::OutOfSync`]; only
//! [`LedgerSyncService::require_heads_ready`] does.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use types::ids::SeriesId;

use crate::pipeline::{steps, IngestPipeline, PipelineError, PublishMode};
use crate::stores::StoreError;

/// One of the stores kept in step with the candle head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ledger {
    Candles,
    Factor,
    Overlay,
}

impl fmt::Display for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Ledger::Candles => "candles",
            Ledger::Factor => "factor",
            Ledger::Overlay => "overlay",
        })
    }
}

/// Head times per store; `None` when the store holds nothing for the series
/// or is not configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerHeadSnapshot {
    pub candles: Option<i64>,
    pub factor: Option<i64>,
    pub overlay: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// A dependent recompute actually ran.
    pub refreshed: bool,
    pub steps: Vec<&'static str>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{ledger} ledger for {series_id} is at {head:?}, required {required}")]
    OutOfSync {
        series_id: SeriesId,
        ledger: Ledger,
        head: Option<i64>,
        required: i64,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("failed to read {ledger} head for {series_id}: {source}")]
    Store {
        series_id: SeriesId,
        ledger: Ledger,
        #[source]
        source: StoreError,
    },
}

fn covers(head: Option<i64>, up_to: i64) -> bool {
    head.is_some_and(|h| h >= up_to)
}

pub struct LedgerSyncService {
    pipeline: Arc<IngestPipeline>,
}

impl LedgerSyncService {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline }
    }

    fn store_err(series_id: &SeriesId, ledger: Ledger) -> impl FnOnce(StoreError) -> LedgerError + '_ {
        move |source| LedgerError::Store {
            series_id: series_id.clone(),
            ledger,
            source,
        }
    }

    async fn dependent_heads(
        &self,
        series_id: &SeriesId,
    ) -> Result<(Option<i64>, Option<i64>), LedgerError> {
        let factor = match self.pipeline.factor() {
            Some(factor) => factor
                .head_time(series_id)
                .await
                .map_err(Self::store_err(series_id, Ledger::Factor))?,
            None => None,
        };
        let overlay = match self.pipeline.overlay() {
            Some(overlay) => overlay
                .head_time(series_id)
                .await
                .map_err(Self::store_err(series_id, Ledger::Overlay))?,
            None => None,
        };
        Ok((factor, overlay))
    }

    pub async fn read_heads(&self, series_id: &SeriesId) -> Result<LedgerHeadSnapshot, LedgerError> {
        let candles = self
            .pipeline
            .store()
            .head_time(series_id)
            .await
            .map_err(Self::store_err(series_id, Ledger::Candles))?;
        let (factor, overlay) = self.dependent_heads(series_id).await?;
        Ok(LedgerHeadSnapshot {
            candles,
            factor,
            overlay,
        })
    }

    /// Bring factor and overlay state up to `up_to` if either is behind.
    ///
    /// When both already cover `up_to` (absent engines count as covered)
    /// only their heads are read.
    pub async fn refresh_if_needed(
        &self,
        series_id: &SeriesId,
        up_to: i64,
    ) -> Result<RefreshOutcome, LedgerError> {
        let (factor, overlay) = self.dependent_heads(series_id).await?;
        let factor_ok = self.pipeline.factor().is_none() || covers(factor, up_to);
        let overlay_ok = self.pipeline.overlay().is_none() || covers(overlay, up_to);
        if factor_ok && overlay_ok {
            return Ok(RefreshOutcome {
                refreshed: false,
                steps: Vec::new(),
            });
        }

        debug!(
            series = %series_id,
            up_to,
            factor_head = ?factor,
            overlay_head = ?overlay,
            "Dependent ledgers behind, refreshing"
        );
        let mut targets = BTreeMap::new();
        targets.insert(series_id.clone(), up_to);
        let result = self
            .pipeline
            .refresh_series(&targets, PublishMode::BestEffort)
            .await?;
        let steps = result.step_names();
        Ok(RefreshOutcome {
            refreshed: steps.iter().any(|s| *s != steps::CANDLES_HEAD),
            steps,
        })
    }

    /// Refresh if needed and verify every configured ledger covers `up_to`
    /// (clamped to the candle head). With no candles persisted the heads are
    /// returned as they are.
    pub async fn require_heads_ready(
        &self,
        series_id: &SeriesId,
        up_to: i64,
    ) -> Result<LedgerHeadSnapshot, LedgerError> {
        let candle_head = self
            .pipeline
            .store()
            .head_time(series_id)
            .await
            .map_err(Self::store_err(series_id, Ledger::Candles))?;
        let Some(candle_head) = candle_head else {
            return self.read_heads(series_id).await;
        };
        let required = up_to.min(candle_head);

        self.refresh_if_needed(series_id, required).await?;
        let heads = self.read_heads(series_id).await?;

        let lagging = [
            (Ledger::Factor, self.pipeline.factor().is_some(), heads.factor),
            (Ledger::Overlay, self.pipeline.overlay().is_some(), heads.overlay),
        ]
        .into_iter()
        .find(|(_, present, head)| *present && !covers(*head, required));

        if let Some((ledger, _, head)) = lagging {
            warn!(series = %series_id, %ledger, ?head, required, "Ledger out of sync");
            return Err(LedgerError::OutOfSync {
                series_id: series_id.clone(),
                ledger,
                head,
                required,
            });
        }
        Ok(heads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{bar, sid, FakeEngine};
    use crate::pipeline::PipelineConfig;
    use crate::stores::memory::MemoryCandleStore;
    use crate::stores::{CandleStore, FactorEngine, FactorIngestOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use types::candle::ClosedCandle;

    /// Candle store that counts every call.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryCandleStore,
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CandleStore for CountingStore {
        async fn upsert_many(&self, s: &SeriesId, c: &[ClosedCandle]) -> Result<Vec<i64>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.upsert_many(s, c).await
        }

        async fn head_time(&self, s: &SeriesId) -> Result<Option<i64>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.head_time(s).await
        }

        async fn delete_closed_times(&self, s: &SeriesId, t: &[i64]) -> Result<usize, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.delete_closed_times(s, t).await
        }

        async fn read_range(
            &self,
            s: &SeriesId,
            start: i64,
            end: i64,
        ) -> Result<Vec<ClosedCandle>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.read_range(s, start, end).await
        }
    }

    /// Factor engine whose head never moves.
    struct StuckFactor(Option<i64>);

    #[async_trait]
    impl FactorEngine for StuckFactor {
        async fn ingest_closed(&self, _: &SeriesId, _: i64) -> Result<FactorIngestOutcome, StoreError> {
            Ok(FactorIngestOutcome::default())
        }

        async fn head_time(&self, _: &SeriesId) -> Result<Option<i64>, StoreError> {
            Ok(self.0)
        }
    }

    struct Fixture {
        store: Arc<CountingStore>,
        factor: Arc<FakeEngine>,
        overlay: Arc<FakeEngine>,
        service: LedgerSyncService,
    }

    async fn fixture(candles: &[i64]) -> Fixture {
        let store = Arc::new(CountingStore::default());
        let bars: Vec<ClosedCandle> = candles.iter().map(|t| bar(*t, "1.0")).collect();
        store.inner.upsert_many(&sid(), &bars).await.unwrap();
        let factor = Arc::new(FakeEngine::default());
        let overlay = Arc::new(FakeEngine::default());
        let pipeline = IngestPipeline::new(store.clone(), PipelineConfig::default())
            .with_factor(factor.clone())
            .with_overlay(overlay.clone());
        Fixture {
            store,
            factor,
            overlay,
            service: LedgerSyncService::new(Arc::new(pipeline)),
        }
    }

    #[tokio::test]
    async fn test_noop_reads_dependent_heads_only() {
        let f = fixture(&[100, 160]).await;
        f.factor.set_head(&sid(), 200);
        f.overlay.set_head(&sid(), 160);

        let outcome = f.service.refresh_if_needed(&sid(), 160).await.unwrap();
        assert!(!outcome.refreshed);
        assert!(outcome.steps.is_empty());
        assert_eq!(f.store.calls(), 0);
        assert_eq!(f.factor.calls(), vec!["factor.head"]);
        assert_eq!(f.overlay.calls(), vec!["overlay.head"]);
    }

    #[tokio::test]
    async fn test_refresh_when_behind() {
        let f = fixture(&[100, 160]).await;
        f.factor.set_head(&sid(), 100);

        let outcome = f.service.refresh_if_needed(&sid(), 160).await.unwrap();
        assert!(outcome.refreshed);
        assert_eq!(
            outcome.steps,
            vec![steps::CANDLES_HEAD, steps::FACTOR_INGEST, steps::OVERLAY_INGEST]
        );
        assert_eq!(f.factor.calls().last().unwrap(), "factor.ingest:160");
    }

    #[tokio::test]
    async fn test_require_heads_ready_clamps_to_candle_head() {
        let f = fixture(&[100, 160]).await;
        let heads = f.service.require_heads_ready(&sid(), 10_000).await.unwrap();
        assert_eq!(
            heads,
            LedgerHeadSnapshot {
                candles: Some(160),
                factor: Some(160),
                overlay: Some(160),
            }
        );
    }

    #[tokio::test]
    async fn test_require_heads_ready_reports_lagging_ledger() {
        let store = Arc::new(MemoryCandleStore::new());
        store.upsert_many(&sid(), &[bar(100, "1.0")]).await.unwrap();
        let pipeline = IngestPipeline::new(store, PipelineConfig::default())
            .with_factor(Arc::new(StuckFactor(Some(40))));
        let service = LedgerSyncService::new(Arc::new(pipeline));

        let err = service.require_heads_ready(&sid(), 100).await.unwrap_err();
        match err {
            LedgerError::OutOfSync {
                ledger,
                head,
                required,
                ..
            } => {
                assert_eq!(ledger, Ledger::Factor);
                assert_eq!(head, Some(40));
                assert_eq!(required, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_absent_engines_are_satisfied() {
        let store = Arc::new(MemoryCandleStore::new());
        let service = LedgerSyncService::new(Arc::new(IngestPipeline::new(
            store,
            PipelineConfig::default(),
        )));
        let outcome = service.refresh_if_needed(&sid(), 500).await.unwrap();
        assert!(!outcome.refreshed);
        assert_eq!(
            service.require_heads_ready(&sid(), 500).await.unwrap(),
            LedgerHeadSnapshot::default()
        );
    }
}
