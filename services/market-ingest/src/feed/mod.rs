//! Network hot path
//!
//! A [`KlineFeed`] yields decoded kline updates for one base series.
//! [`pump_feed`] buffers closed candles and hands them to the pipeline in
//! batches:
//!
//! - when `batch_max` candles are buffered
//! - after `flush_idle` without any message
//! - on cancellation, before returning
//! - before propagating a feed error
//!
//! Forming candles bypass persistence and go straight to the hub.

pub mod binance;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};
use types::candle::{ClosedCandle, SeriesBatch};

use crate::fanout::{FanoutError, TimeframeFanout};
use crate::pipeline::{PipelineError, PublishMode};
use crate::registry::IngestContext;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("connect to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("websocket transport error: {0}")]
    Transport(String),

    #[error("failed to decode feed message: {0}")]
    Decode(String),

    #[error("feed stream ended")]
    StreamEnded,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

/// One decoded feed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Final value of a candle.
    Closed(ClosedCandle),
    /// Intermediate value of the candle still forming.
    Forming(ClosedCandle),
    /// Keep-alive or control frame with no payload.
    Heartbeat,
}

/// Source of kline updates.
#[async_trait]
pub trait KlineFeed: Send {
    /// Next update; `Ok(None)` once the stream ended.
    async fn next_message(&mut self) -> Result<Option<FeedMessage>, FeedError>;
}

/// Drive `feed` until cancellation or failure.
///
/// Returns `Ok(())` only when cancelled; a stream end is reported as
/// [`FeedError::StreamEnded`] so the guardrail sees it.
pub async fn pump_feed<F>(ctx: &IngestContext, feed: &mut F) -> Result<(), FeedError>
where
    F: KlineFeed + ?Sized,
{
    let mut fanout = if ctx.derived.is_empty() {
        None
    } else {
        Some(TimeframeFanout::new(
            ctx.series_id.clone(),
            &ctx.derived,
            ctx.settings.forming_min_interval(),
        )?)
    };
    let mut buffer: BTreeMap<i64, ClosedCandle> = BTreeMap::new();
    let flush_idle = ctx.settings.flush_idle();
    let batch_max = ctx.settings.batch_max.max(1);

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            next = timeout(flush_idle, feed.next_message()) => Some(next),
        };

        let Some(next) = next else {
            flush(ctx, fanout.as_mut(), &mut buffer).await?;
            debug!(series = %ctx.series_id, "Feed pump cancelled");
            return Ok(());
        };

        match next {
            Err(_idle) => flush(ctx, fanout.as_mut(), &mut buffer).await?,
            Ok(Ok(Some(FeedMessage::Closed(candle)))) => {
                // Duplicate times keep the latest value.
                buffer.insert(candle.candle_time, candle);
                if buffer.len() >= batch_max {
                    flush(ctx, fanout.as_mut(), &mut buffer).await?;
                }
            }
            Ok(Ok(Some(FeedMessage::Forming(candle)))) => {
                publish_forming(ctx, fanout.as_mut(), &candle).await;
            }
            Ok(Ok(Some(FeedMessage::Heartbeat))) => {}
            Ok(Ok(None)) => {
                flush(ctx, fanout.as_mut(), &mut buffer).await?;
                return Err(FeedError::StreamEnded);
            }
            Ok(Err(err)) => {
                if let Err(flush_err) = flush(ctx, fanout.as_mut(), &mut buffer).await {
                    warn!(
                        series = %ctx.series_id,
                        error = %flush_err,
                        "Flush before feed error failed"
                    );
                }
                return Err(err);
            }
        }
    }
}

async fn flush(
    ctx: &IngestContext,
    fanout: Option<&mut TimeframeFanout>,
    buffer: &mut BTreeMap<i64, ClosedCandle>,
) -> Result<(), FeedError> {
    if buffer.is_empty() {
        return Ok(());
    }
    let candles: Vec<ClosedCandle> = std::mem::take(buffer).into_values().collect();
    let derived = fanout
        .map(|f| f.on_closed(&candles))
        .unwrap_or_default();

    let mut batches = Vec::with_capacity(1 + derived.len());
    batches.extend(SeriesBatch::from_candles(ctx.series_id.clone(), candles));
    batches.extend(derived);

    let result = ctx.pipeline.run(batches, PublishMode::BestEffort).await?;
    debug!(
        series = %ctx.series_id,
        batches = result.batches.len(),
        rebuilt = result.rebuilt.len(),
        duration_ms = result.duration.as_millis() as u64,
        "Flushed closed candles"
    );
    Ok(())
}

async fn publish_forming(
    ctx: &IngestContext,
    fanout: Option<&mut TimeframeFanout>,
    candle: &ClosedCandle,
) {
    let Some(hub) = ctx.pipeline.hub() else {
        return;
    };
    let mut updates = vec![(ctx.series_id.clone(), candle.clone())];
    if let Some(fanout) = fanout {
        updates.extend(fanout.on_forming(candle, Instant::now()));
    }
    for (series_id, forming) in updates {
        if let Err(e) = hub.publish_forming(&series_id, &forming).await {
            trace!(series = %series_id, error = %e, "Forming publish dropped");
        }
    }
}
