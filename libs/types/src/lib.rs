//! Types library for the market ingestion service
//!
//! Core type definitions shared by the ingestion supervisor, the consistency
//! pipeline and the stores that sit behind it.
//!
//! # Modules
//! - `ids`: Series identifiers (SeriesId, MarketKind)
//! - `timeframe`: Epoch-aligned candle intervals
//! - `candle`: Closed candles and per-series batches
//! - `errors`: Error taxonomy

// Public modules
pub mod candle;
pub mod errors;
pub mod ids;
pub mod timeframe;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::candle::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::timeframe::*;
}
