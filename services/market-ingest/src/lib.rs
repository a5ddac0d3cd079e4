//! Market Ingest Service
//!
//! Keeps live exchange candle feeds running and the stores built from them
//! consistent:
//! - One supervised ingestion job per base series, started on demand or
//!   pinned by a whitelist
//! - Crash-loop guardrail with exponential backoff and a timed open circuit
//! - Capacity-bounded eviction and idle reaping
//! - Derived-timeframe rollup from the base feed
//! - Persist → recompute → publish pipeline with compensation on failure
//! - On-demand catch-up of dependent ledgers for read paths
//!
//! # Architecture
//!
//! ```text
//!  subscribe / whitelist
//!          │
//!    ┌─────▼──────┐   crash notices   ┌────────┐
//!    │ Supervisor │◄──────────────────┤ Reaper │
//!    └─────┬──────┘                   └────────┘
//!          │ spawn
//!    ┌─────▼──────┐   ┌───────────┐
//!    │ JobRunner  ├──►│ IngestLoop│  (binance, ...)
//!    └────────────┘   └─────┬─────┘
//!                           │ closed candles
//!                     ┌─────▼─────┐
//!                     │  Fanout   │  1m → 5m, 1h, ...
//!                     └─────┬─────┘
//!                  ┌────────▼─────────┐
//!                  │  IngestPipeline  │
//!                  └┬───────┬───────┬─┘
//!                   │       │       │
//!              candles   factor  overlay ──► hub
//!                   ▲       ▲       ▲
//!                   └───────┴───────┘
//!                   LedgerSyncService (read paths)
//! ```

pub mod config;
pub mod events;
pub mod fanout;
pub mod feed;
pub mod guardrail;
pub mod ledger;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod stores;
pub mod supervisor;

pub use config::{FeedSettings, IngestSettings};
pub use pipeline::{IngestPipeline, PipelineConfig, PipelineError, PipelineResult, PublishMode};
pub use registry::{IngestContext, IngestLoop, SeriesRouter, SourceRegistry};
pub use supervisor::{Supervisor, SupervisorError};

// Service version
pub const SERVICE_VERSION: &str = "0.1.0";
