//! Series identifiers
//!
//! A series is one (exchange, market, symbol, timeframe) stream of candles.
//! Its canonical text form is `exchange:market:SYMBOL:timeframe`, for example
//! `binance:futures:BTC/USDT:1m`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SeriesError;
use crate::timeframe::Timeframe;

/// Market segment of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Futures,
}

impl MarketKind {
    pub fn label(&self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::Futures => "futures",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SeriesError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spot" => Ok(MarketKind::Spot),
            "futures" | "perp" => Ok(MarketKind::Futures),
            _ => Err(SeriesError::InvalidMarket(s.to_string())),
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Composite key identifying one candle series.
///
/// Exchange names are normalized to lower-case and symbols to upper-case so
/// that two spellings of the same series compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeriesId {
    exchange: String,
    market: MarketKind,
    symbol: String,
    timeframe: Timeframe,
}

impl SeriesId {
    pub fn new(
        exchange: impl AsRef<str>,
        market: MarketKind,
        symbol: impl AsRef<str>,
        timeframe: Timeframe,
    ) -> Result<Self, SeriesError> {
        let exchange = exchange.as_ref().trim().to_ascii_lowercase();
        let symbol = symbol.as_ref().trim().to_ascii_uppercase();
        if exchange.is_empty() || exchange.contains(':') {
            return Err(SeriesError::InvalidExchange(exchange));
        }
        if symbol.is_empty() || symbol.contains(':') {
            return Err(SeriesError::InvalidSymbol(symbol));
        }
        Ok(Self {
            exchange,
            market,
            symbol,
            timeframe,
        })
    }

    /// Parse the canonical `exchange:market:SYMBOL:timeframe` form.
    pub fn parse(key: &str) -> Result<Self, SeriesError> {
        let parts: Vec<&str> = key.trim().split(':').collect();
        match parts.as_slice() {
            [exchange, market, symbol, timeframe] => Self::new(
                exchange,
                MarketKind::parse(market)?,
                symbol,
                Timeframe::parse(timeframe)?,
            ),
            _ => Err(SeriesError::InvalidSeriesKey(key.to_string())),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn market(&self) -> MarketKind {
        self.market
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// The same instrument on a different timeframe.
    pub fn with_timeframe(&self, timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            ..self.clone()
        }
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.exchange, self.market, self.symbol, self.timeframe
        )
    }
}

impl FromStr for SeriesId {
    type Err = SeriesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SeriesId::parse(s)
    }
}

impl TryFrom<String> for SeriesId {
    type Error = SeriesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SeriesId::parse(&value)
    }
}

impl From<SeriesId> for String {
    fn from(id: SeriesId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_id_parse() {
        let id = SeriesId::parse("binance:futures:BTC/USDT:1m").unwrap();
        assert_eq!(id.exchange(), "binance");
        assert_eq!(id.market(), MarketKind::Futures);
        assert_eq!(id.symbol(), "BTC/USDT");
        assert_eq!(id.timeframe(), Timeframe::M1);
    }

    #[test]
    fn test_series_id_normalizes_case() {
        let a = SeriesId::parse("Binance:SPOT:eth/usdt:5m").unwrap();
        let b = SeriesId::parse("binance:spot:ETH/USDT:5m").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "binance:spot:ETH/USDT:5m");
    }

    #[test]
    fn test_series_id_rejects_bad_keys() {
        assert!(matches!(
            SeriesId::parse("binance:spot:BTC/USDT"),
            Err(SeriesError::InvalidSeriesKey(_))
        ));
        assert!(matches!(
            SeriesId::parse("binance:margin:BTC/USDT:1m"),
            Err(SeriesError::InvalidMarket(_))
        ));
        assert!(matches!(
            SeriesId::parse("binance:spot:BTC/USDT:7m"),
            Err(SeriesError::InvalidTimeframe(_))
        ));
        assert!(matches!(
            SeriesId::parse(":spot:BTC/USDT:1m"),
            Err(SeriesError::InvalidExchange(_))
        ));
    }

    #[test]
    fn test_with_timeframe() {
        let base = SeriesId::parse("binance:spot:BTC/USDT:1m").unwrap();
        let derived = base.with_timeframe(Timeframe::H1);
        assert_eq!(derived.to_string(), "binance:spot:BTC/USDT:1h");
        assert_eq!(derived.with_timeframe(Timeframe::M1), base);
    }

    #[test]
    fn test_series_id_serializes_as_key() {
        let id = SeriesId::parse("binance:spot:BTC/USDT:15m").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"binance:spot:BTC/USDT:15m\"");
        let back: SeriesId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
