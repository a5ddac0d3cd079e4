//! Binance kline WebSocket adapter
//!
//! One raw stream per series: `{ws_base}/ws/{symbol}@kline_{interval}`.
//! Prices arrive as decimal strings and times in milliseconds; candles are
//! converted to seconds on the way in.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use types::candle::ClosedCandle;
use types::ids::SeriesId;

use super::{pump_feed, FeedError, FeedMessage, KlineFeed};
use crate::registry::{IngestContext, IngestLoop};

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time_ms: i64,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "x")]
    closed: bool,
}

/// Stream name fragment for a symbol: `BTC/USDT` → `btcusdt`.
pub fn stream_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub fn stream_url(ws_base: &str, series_id: &SeriesId) -> String {
    format!(
        "{}/ws/{}@kline_{}",
        ws_base.trim_end_matches('/'),
        stream_symbol(series_id.symbol()),
        series_id.timeframe().label()
    )
}

/// Decode one text frame. Frames that are not kline events (subscription
/// acks and the like) decode to [`FeedMessage::Heartbeat`].
pub fn decode_kline(text: &str) -> Result<FeedMessage, FeedError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FeedError::Decode(e.to_string()))?;
    // Combined streams wrap the event in `data`.
    let event = value.get("data").unwrap_or(&value);
    if event.get("e").and_then(|e| e.as_str()) != Some("kline") {
        return Ok(FeedMessage::Heartbeat);
    }
    let kline = event
        .get("k")
        .ok_or_else(|| FeedError::Decode("kline event without payload".to_string()))?;
    let payload = KlinePayload::deserialize(kline).map_err(|e| FeedError::Decode(e.to_string()))?;

    let candle = ClosedCandle::new(
        payload.open_time_ms.div_euclid(1_000),
        payload.open,
        payload.high,
        payload.low,
        payload.close,
        payload.volume,
    );
    if !candle.is_valid() {
        return Err(FeedError::Decode(format!(
            "inconsistent kline at {}",
            candle.candle_time
        )));
    }
    Ok(if payload.closed {
        FeedMessage::Closed(candle)
    } else {
        FeedMessage::Forming(candle)
    })
}

/// An open kline stream.
pub struct BinanceKlineFeed {
    url: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl BinanceKlineFeed {
    pub async fn connect(url: &str) -> Result<Self, FeedError> {
        let (ws, _response) = connect_async(url).await.map_err(|e| FeedError::Connect {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        debug!(url, "Binance stream connected");
        Ok(Self {
            url: url.to_string(),
            ws,
        })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(url = %self.url, error = %e, "Close handshake failed");
        }
    }
}

#[async_trait]
impl KlineFeed for BinanceKlineFeed {
    async fn next_message(&mut self) -> Result<Option<FeedMessage>, FeedError> {
        loop {
            let Some(frame) = self.ws.next().await else {
                return Ok(None);
            };
            let frame = frame.map_err(|e| FeedError::Transport(e.to_string()))?;
            match frame {
                Message::Text(text) => return decode_kline(&text).map(Some),
                Message::Binary(bytes) => {
                    let text = String::from_utf8(bytes)
                        .map_err(|e| FeedError::Decode(e.to_string()))?;
                    return decode_kline(&text).map(Some);
                }
                Message::Ping(payload) => {
                    self.ws
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| FeedError::Transport(e.to_string()))?;
                    return Ok(Some(FeedMessage::Heartbeat));
                }
                Message::Pong(_) => return Ok(Some(FeedMessage::Heartbeat)),
                Message::Close(frame) => {
                    info!(url = %self.url, ?frame, "Binance stream closed by server");
                    return Ok(None);
                }
                Message::Frame(_) => continue,
            }
        }
    }
}

/// [`IngestLoop`] for Binance spot and futures klines.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceLoop;

impl BinanceLoop {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IngestLoop for BinanceLoop {
    async fn run(&self, ctx: IngestContext) -> Result<(), FeedError> {
        let ws_base = ctx.settings.binance_ws_url(ctx.series_id.market());
        let url = stream_url(ws_base, &ctx.series_id);
        info!(series = %ctx.series_id, job_id = %ctx.job_id, %url, "Connecting kline stream");

        let connected = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(()),
            connected = BinanceKlineFeed::connect(&url) => connected,
        };
        let mut feed = connected?;

        let outcome = pump_feed(&ctx, &mut feed).await;
        if let Err(e) = &outcome {
            warn!(series = %ctx.series_id, job_id = %ctx.job_id, error = %e, "Kline stream failed");
        }
        feed.close().await;
        outcome
    }
}
