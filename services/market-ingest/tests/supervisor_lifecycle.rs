//! Supervisor lifecycle tests
//!
//! Runs real jobs over scripted feeds: subscription, derived rollup,
//! idle reaping, crash recovery of pinned series and shutdown.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use market_ingest::events::HubMessage;
use market_ingest::feed::{pump_feed, FeedError, FeedMessage, KlineFeed};
use market_ingest::stores::memory::{MemoryCandleStore, RecordingHub};
use market_ingest::{
    IngestContext, IngestLoop, IngestPipeline, IngestSettings, PipelineConfig, SourceRegistry,
    Supervisor,
};
use rust_decimal::Decimal;
use types::candle::ClosedCandle;
use types::ids::SeriesId;
use types::timeframe::Timeframe;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Replays one script per run; `None` ends the stream. Silent once the
/// script is exhausted.
struct VecFeed(VecDeque<Option<FeedMessage>>);

#[async_trait]
impl KlineFeed for VecFeed {
    async fn next_message(&mut self) -> Result<Option<FeedMessage>, FeedError> {
        match self.0.pop_front() {
            Some(next) => Ok(next),
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct ScriptedSource {
    runs: Mutex<VecDeque<Vec<Option<FeedMessage>>>>,
}

impl ScriptedSource {
    fn push_run(&self, script: Vec<Option<FeedMessage>>) {
        self.runs.lock().unwrap().push_back(script);
    }
}

#[async_trait]
impl IngestLoop for ScriptedSource {
    async fn run(&self, ctx: IngestContext) -> Result<(), FeedError> {
        let script = self.runs.lock().unwrap().pop_front().unwrap_or_default();
        let mut feed = VecFeed(script.into());
        pump_feed(&ctx, &mut feed).await
    }
}

fn closed(t: i64) -> Option<FeedMessage> {
    Some(FeedMessage::Closed(ClosedCandle::flat(t, Decimal::from(t), Decimal::ONE)))
}

fn forming(t: i64) -> Option<FeedMessage> {
    Some(FeedMessage::Forming(ClosedCandle::flat(t, Decimal::from(t), Decimal::ONE)))
}

struct Stack {
    store: Arc<MemoryCandleStore>,
    hub: Arc<RecordingHub>,
    source: Arc<ScriptedSource>,
    supervisor: Supervisor,
}

fn stack(settings: IngestSettings) -> Stack {
    let store = Arc::new(MemoryCandleStore::new());
    let hub = Arc::new(RecordingHub::new());
    let source = Arc::new(ScriptedSource::default());
    let mut registry = SourceRegistry::new();
    registry.register("binance", source.clone());
    let pipeline = IngestPipeline::new(store.clone(), PipelineConfig::default()).with_hub(hub.clone());
    let supervisor = Supervisor::new(settings, registry, Arc::new(pipeline)).unwrap();
    Stack {
        store,
        hub,
        source,
        supervisor,
    }
}

fn btc(tf: &str) -> SeriesId {
    SeriesId::parse(&format!("binance:spot:BTC/USDT:{tf}")).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_derived_subscription_feeds_and_reaps() {
    init_tracing();
    let mut settings = IngestSettings {
        idle_ttl_ms: 5_000,
        ..IngestSettings::default()
    };
    settings.feed.derived_enabled = true;
    settings.feed.derived_timeframes = vec![Timeframe::M5];
    let s = stack(settings);
    s.source
        .push_run(vec![closed(0), closed(60), closed(120), closed(180), closed(240), forming(300)]);

    assert!(s.supervisor.subscribe(&btc("5m")).await.unwrap());
    s.supervisor.start_reaper().await;
    tokio::time::sleep(Duration::from_millis(2_000)).await;

    assert_eq!(s.store.len(&btc("1m")), 5);
    assert_eq!(s.store.len(&btc("5m")), 1);
    assert!(s
        .hub
        .messages()
        .iter()
        .any(|m| matches!(m, HubMessage::CandleForming { series_id, .. } if *series_id == btc("5m"))));

    s.supervisor.unsubscribe(&btc("5m")).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(s.supervisor.job_count().await, 0);
    s.supervisor.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_pinned_series_recovers_from_stream_end() {
    init_tracing();
    let s = stack(IngestSettings {
        whitelist: vec![btc("1m")],
        enable_whitelist: true,
        ..IngestSettings::default()
    });
    s.source.push_run(vec![closed(60), None]);
    s.source.push_run(vec![closed(120)]);

    assert_eq!(s.supervisor.start_whitelist().await.unwrap(), 1);
    s.supervisor.start_reaper().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(s.store.len(&btc("1m")), 2);
    let snapshot = s.supervisor.debug_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].alive);
    assert!(snapshot[0].pinned);
    assert_eq!(snapshot[0].crash_count, 1);
    assert!(snapshot[0].last_error.as_deref().unwrap().contains("stream ended"));

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json[0]["series_id"], "binance:spot:BTC/USDT:1m");

    s.supervisor.close().await;
    s.supervisor.close().await;
    assert_eq!(s.supervisor.job_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_flushes_buffered_candles() {
    init_tracing();
    let mut settings = IngestSettings::default();
    settings.feed.flush_idle_ms = 60_000;
    let s = stack(settings);
    s.source.push_run(vec![closed(60), closed(120)]);

    assert!(s.supervisor.subscribe(&btc("1m")).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(s.store.len(&btc("1m")), 0);

    s.supervisor.close().await;
    assert_eq!(s.store.len(&btc("1m")), 2);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_job_flushes_before_stopping() {
    init_tracing();
    let mut settings = IngestSettings {
        max_jobs: 1,
        ..IngestSettings::default()
    };
    settings.feed.flush_idle_ms = 60_000;
    let s = stack(settings);
    let eth = SeriesId::parse("binance:spot:ETH/USDT:1m").unwrap();
    s.source.push_run(vec![closed(60)]);
    s.source.push_run(Vec::new());

    assert!(s.supervisor.subscribe(&btc("1m")).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    s.supervisor.unsubscribe(&btc("1m")).await;

    assert!(s.supervisor.subscribe(&eth).await.unwrap());
    assert_eq!(s.store.len(&btc("1m")), 1);
    s.supervisor.close().await;
}
