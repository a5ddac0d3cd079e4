//! Persist → recompute → publish pipeline
//!
//! Applies closed-candle batches to the raw candle store, then brings the
//! dependent ledgers (factor engine, overlay engine) up to the persisted
//! head, then notifies subscribers. A failure in a dependent step can roll
//! back the step before it:
//!
//! - factor failure: newly inserted candle rows are deleted
//!   (`compensate_candles`)
//! - overlay failure: the overlay series is reset (`compensate_overlay`)
//!
//! Compensation is best effort. Its own failure is recorded on the error and
//! never replaces the original cause.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use types::candle::SeriesBatch;
use types::ids::SeriesId;

use crate::events::FACTOR_REBUILD_EVENT;
use crate::stores::{CandleStore, FactorEngine, OverlayEngine, StoreError, SubscriberHub};

/// Step names recorded in [`PipelineResult::steps`] and [`PipelineError`].
pub mod steps {
    pub const CANDLES_UPSERT: &str = "candles.upsert";
    pub const CANDLES_HEAD: &str = "candles.head_time";
    pub const FACTOR_INGEST: &str = "factor.ingest_closed";
    pub const OVERLAY_RESET: &str = "overlay.reset_series";
    pub const OVERLAY_INGEST: &str = "overlay.ingest_closed";
    pub const HUB_PUBLISH_CLOSED: &str = "hub.publish_closed";
    pub const HUB_PUBLISH_SYSTEM: &str = "hub.publish_system";
}

/// Compensation switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Delete newly inserted candles when the factor step fails.
    pub compensate_candles: bool,
    /// Reset the overlay series when the overlay step fails.
    pub compensate_overlay: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compensate_candles: true,
            compensate_overlay: true,
        }
    }
}

/// How subscriber notifications are handled after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Do not publish.
    Skip,
    /// Log and swallow hub failures (network hot path).
    BestEffort,
    /// Hub failures fail the run (client-facing writes).
    Strict,
}

/// One completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    pub name: &'static str,
    pub series_id: SeriesId,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineResult {
    pub batches: Vec<SeriesBatch>,
    /// Series whose dependent state was rebuilt rather than extended.
    pub rebuilt: BTreeSet<SeriesId>,
    pub steps: Vec<PipelineStep>,
    pub duration: Duration,
}

impl PipelineResult {
    fn record(&mut self, name: &'static str, series_id: &SeriesId, started: Instant) {
        self.steps.push(PipelineStep {
            name,
            series_id: series_id.clone(),
            duration: started.elapsed(),
        });
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    pub fn is_rebuilt(&self, series_id: &SeriesId) -> bool {
        self.rebuilt.contains(series_id)
    }
}

/// A failed pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pipeline step {step} failed for {series_id} (compensated={compensated}): {source}")]
pub struct PipelineError {
    pub step: &'static str,
    pub series_id: SeriesId,
    /// A compensation action was attempted.
    pub compensated: bool,
    /// Newly inserted candle rows were deleted.
    pub candles_compensated: bool,
    /// The overlay series was reset.
    pub overlay_compensated: bool,
    /// Failure of the compensation itself, if any.
    pub compensation_error: Option<StoreError>,
    pub source: StoreError,
}

impl PipelineError {
    fn new(step: &'static str, series_id: &SeriesId, source: StoreError) -> Self {
        Self {
            step,
            series_id: series_id.clone(),
            compensated: false,
            candles_compensated: false,
            overlay_compensated: false,
            compensation_error: None,
            source,
        }
    }
}

/// Writes candle batches and keeps dependent ledgers consistent with them.
pub struct IngestPipeline {
    store: Arc<dyn CandleStore>,
    factor: Option<Arc<dyn FactorEngine>>,
    overlay: Option<Arc<dyn OverlayEngine>>,
    hub: Option<Arc<dyn SubscriberHub>>,
    config: PipelineConfig,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn CandleStore>, config: PipelineConfig) -> Self {
        Self {
            store,
            factor: None,
            overlay: None,
            hub: None,
            config,
        }
    }

    pub fn with_factor(mut self, factor: Arc<dyn FactorEngine>) -> Self {
        self.factor = Some(factor);
        self
    }

    pub fn with_overlay(mut self, overlay: Arc<dyn OverlayEngine>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn with_hub(mut self, hub: Arc<dyn SubscriberHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn store(&self) -> &Arc<dyn CandleStore> {
        &self.store
    }

    pub fn factor(&self) -> Option<&Arc<dyn FactorEngine>> {
        self.factor.as_ref()
    }

    pub fn overlay(&self) -> Option<&Arc<dyn OverlayEngine>> {
        self.overlay.as_ref()
    }

    pub fn hub(&self) -> Option<&Arc<dyn SubscriberHub>> {
        self.hub.as_ref()
    }

    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    /// Persist `batches`, recompute dependent state for each series, then
    /// publish.
    pub async fn run(
        &self,
        batches: Vec<SeriesBatch>,
        publish: PublishMode,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        let mut result = PipelineResult::default();
        let batches: Vec<SeriesBatch> = batches.into_iter().filter(|b| !b.is_empty()).collect();
        let mut rebuilt_at = Vec::new();

        for batch in &batches {
            let series_id = &batch.series_id;
            let step_started = Instant::now();
            let inserted = self
                .store
                .upsert_many(series_id, &batch.candles)
                .await
                .map_err(|e| PipelineError::new(steps::CANDLES_UPSERT, series_id, e))?;
            result.record(steps::CANDLES_UPSERT, series_id, step_started);
            debug!(
                series = %series_id,
                candles = batch.len(),
                inserted = inserted.len(),
                up_to = batch.up_to_time,
                "Candles persisted"
            );

            // The batch's own candles are now persisted, so up_to never runs
            // ahead of the raw store.
            if self
                .recompute(series_id, batch.up_to_time, &inserted, &mut result)
                .await?
            {
                rebuilt_at.push((series_id.clone(), batch.up_to_time));
            }
        }

        self.publish(&batches, &rebuilt_at, publish, &mut result).await?;
        result.batches = batches;
        result.duration = started.elapsed();
        debug!(
            batches = result.batches.len(),
            rebuilt = result.rebuilt.len(),
            duration_ms = result.duration.as_millis() as u64,
            "Pipeline run complete"
        );
        Ok(result)
    }

    /// Recompute dependent state up to the given times without persisting
    /// candles. Each target is clamped to the raw store head; series with no
    /// candles are skipped.
    pub async fn refresh_series(
        &self,
        up_to_times: &BTreeMap<SeriesId, i64>,
        publish: PublishMode,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        let mut result = PipelineResult::default();
        let mut rebuilt_at = Vec::new();

        for (series_id, requested) in up_to_times {
            let step_started = Instant::now();
            let head = self
                .store
                .head_time(series_id)
                .await
                .map_err(|e| PipelineError::new(steps::CANDLES_HEAD, series_id, e))?;
            result.record(steps::CANDLES_HEAD, series_id, step_started);

            let Some(head) = head else {
                debug!(series = %series_id, "No candles persisted, nothing to refresh");
                continue;
            };
            let up_to = (*requested).min(head);
            if self.recompute(series_id, up_to, &[], &mut result).await? {
                rebuilt_at.push((series_id.clone(), up_to));
            }
        }

        self.publish(&[], &rebuilt_at, publish, &mut result).await?;
        result.duration = started.elapsed();
        Ok(result)
    }

    /// Factor then overlay for one series. Returns whether the factor engine
    /// rebuilt.
    async fn recompute(
        &self,
        series_id: &SeriesId,
        up_to: i64,
        inserted: &[i64],
        result: &mut PipelineResult,
    ) -> Result<bool, PipelineError> {
        let mut rebuilt = false;

        if let Some(factor) = &self.factor {
            let step_started = Instant::now();
            match factor.ingest_closed(series_id, up_to).await {
                Ok(outcome) => {
                    result.record(steps::FACTOR_INGEST, series_id, step_started);
                    rebuilt = outcome.rebuilt;
                    if rebuilt {
                        info!(series = %series_id, up_to, "Factor state rebuilt");
                        result.rebuilt.insert(series_id.clone());
                    }
                }
                Err(source) => {
                    let mut err = PipelineError::new(steps::FACTOR_INGEST, series_id, source);
                    if self.config.compensate_candles {
                        self.compensate_candles(&mut err, inserted).await;
                    }
                    return Err(err);
                }
            }
        }

        if let Some(overlay) = &self.overlay {
            if rebuilt {
                let step_started = Instant::now();
                overlay
                    .reset_series(series_id)
                    .await
                    .map_err(|e| PipelineError::new(steps::OVERLAY_RESET, series_id, e))?;
                result.record(steps::OVERLAY_RESET, series_id, step_started);
            }

            let step_started = Instant::now();
            match overlay.ingest_closed(series_id, up_to).await {
                Ok(()) => result.record(steps::OVERLAY_INGEST, series_id, step_started),
                Err(source) => {
                    let mut err = PipelineError::new(steps::OVERLAY_INGEST, series_id, source);
                    if self.config.compensate_overlay {
                        self.compensate_overlay(overlay.as_ref(), &mut err).await;
                    }
                    return Err(err);
                }
            }
        }

        Ok(rebuilt)
    }

    async fn compensate_candles(&self, err: &mut PipelineError, inserted: &[i64]) {
        err.compensated = true;
        if inserted.is_empty() {
            err.candles_compensated = true;
            return;
        }
        match self.store.delete_closed_times(&err.series_id, inserted).await {
            Ok(removed) => {
                err.candles_compensated = true;
                warn!(
                    series = %err.series_id,
                    step = err.step,
                    removed,
                    "Deleted newly inserted candles after step failure"
                );
            }
            Err(e) => {
                error!(
                    series = %err.series_id,
                    step = err.step,
                    error = %e,
                    "Candle compensation failed"
                );
                err.compensation_error = Some(e);
            }
        }
    }

    async fn compensate_overlay(&self, overlay: &dyn OverlayEngine, err: &mut PipelineError) {
        err.compensated = true;
        match overlay.reset_series(&err.series_id).await {
            Ok(()) => {
                err.overlay_compensated = true;
                warn!(
                    series = %err.series_id,
                    step = err.step,
                    "Overlay series reset after step failure"
                );
            }
            Err(e) => {
                error!(
                    series = %err.series_id,
                    step = err.step,
                    error = %e,
                    "Overlay compensation failed"
                );
                err.compensation_error = Some(e);
            }
        }
    }

    async fn publish(
        &self,
        batches: &[SeriesBatch],
        rebuilt_at: &[(SeriesId, i64)],
        mode: PublishMode,
        result: &mut PipelineResult,
    ) -> Result<(), PipelineError> {
        if mode == PublishMode::Skip {
            return Ok(());
        }
        let Some(hub) = &self.hub else {
            return Ok(());
        };

        for batch in batches {
            let step_started = Instant::now();
            let outcome = match batch.candles.as_slice() {
                [single] => hub.publish_closed(&batch.series_id, single).await,
                candles => hub.publish_closed_batch(&batch.series_id, candles).await,
            };
            if Self::check_publish(outcome, steps::HUB_PUBLISH_CLOSED, &batch.series_id, mode)? {
                result.record(steps::HUB_PUBLISH_CLOSED, &batch.series_id, step_started);
            }
        }

        for (series_id, up_to) in rebuilt_at {
            let step_started = Instant::now();
            let outcome = hub
                .publish_system(
                    series_id,
                    FACTOR_REBUILD_EVENT,
                    "dependent state rebuilt; discard incremental state",
                    serde_json::json!({ "up_to_time": up_to }),
                )
                .await;
            if Self::check_publish(outcome, steps::HUB_PUBLISH_SYSTEM, series_id, mode)? {
                result.record(steps::HUB_PUBLISH_SYSTEM, series_id, step_started);
            }
        }
        Ok(())
    }

    /// `Ok(true)` when published, `Ok(false)` when a best-effort failure was
    /// swallowed.
    fn check_publish(
        outcome: Result<(), StoreError>,
        step: &'static str,
        series_id: &SeriesId,
        mode: PublishMode,
    ) -> Result<bool, PipelineError> {
        match outcome {
            Ok(()) => Ok(true),
            Err(e) if mode == PublishMode::Strict => Err(PipelineError::new(step, series_id, e)),
            Err(e) => {
                warn!(series = %series_id, step, error = %e, "Publish failed (best effort)");
                Ok(false)
            }
        }
    }
}
