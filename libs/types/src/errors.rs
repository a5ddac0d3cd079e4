//! Error types for series and candle definitions
//!
//! Error taxonomy using thiserror

use thiserror::Error;

/// Failures while building or parsing series identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeriesError {
    #[error("Invalid series key: {0} (expected exchange:market:SYMBOL:timeframe)")]
    InvalidSeriesKey(String),

    #[error("Invalid exchange: {0:?}")]
    InvalidExchange(String),

    #[error("Invalid market kind: {0}")]
    InvalidMarket(String),

    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),
}
