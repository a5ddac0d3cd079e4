//! Messages delivered to subscribers
//!
//! `HubMessage` is the shape every hub publish call maps to. Hubs that
//! forward to WebSocket clients serialize it as JSON tagged by `type`.

use serde::{Deserialize, Serialize};
use types::candle::ClosedCandle;
use types::ids::SeriesId;

/// System event name sent when a series' dependent state was rebuilt from
/// scratch. Clients must drop their incremental view of the series.
pub const FACTOR_REBUILD_EVENT: &str = "factor.rebuild";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    CandleClosed {
        series_id: SeriesId,
        candle: ClosedCandle,
    },
    CandlesClosed {
        series_id: SeriesId,
        candles: Vec<ClosedCandle>,
    },
    CandleForming {
        series_id: SeriesId,
        candle: ClosedCandle,
    },
    System {
        series_id: SeriesId,
        event: String,
        message: String,
        data: serde_json::Value,
    },
}

impl HubMessage {
    pub fn series_id(&self) -> &SeriesId {
        match self {
            HubMessage::CandleClosed { series_id, .. }
            | HubMessage::CandlesClosed { series_id, .. }
            | HubMessage::CandleForming { series_id, .. }
            | HubMessage::System { series_id, .. } => series_id,
        }
    }

    /// Label for logging.
    pub fn type_label(&self) -> &'static str {
        match self {
            HubMessage::CandleClosed { .. } => "candle_closed",
            HubMessage::CandlesClosed { .. } => "candles_closed",
            HubMessage::CandleForming { .. } => "candle_forming",
            HubMessage::System { .. } => "system",
        }
    }
}
