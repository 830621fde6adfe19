//! Delta Engine
//!
//! Aggregates sensor deltas for a vessel and its surroundings and produces:
//! - A canonical state tree keyed by context, path and source
//! - A preferred-source stream with priority fail-over per path
//! - Coalesced backpressure deltas for consumers that fall behind
//! - Zone notifications synthesized from the vessel's own values
//! - Point-in-time snapshots replayed from retained deltas
//!
//! # Architecture
//!
//! ```text
//!        Deltas
//!          │
//!    ┌─────▼─────┐
//!    │ Normalize │  ← self alias, missing timestamps
//!    └─────┬─────┘
//!          │──────────────► History ──► Replay / Snapshot
//!    ┌─────▼─────┐
//!    │ StateTree │
//!    └─────┬─────┘
//!    ┌─────▼──────┐
//!    │ Arbitrator │  ← preferred source per path
//!    └─────┬──────┘
//!          │
//!   ┌──────┴────────────┐
//!   │                   │
//! ┌─▼────────────┐  ┌───▼───────────┐
//! │ DeliveryHub  │  │ ZoneEvaluator │
//! │ (Accumulator │  └───┬───────────┘
//! │  per queue)  │      │ notifications
//! └──────────────┘      └──► back to Normalize
//! ```

pub mod accumulator;
pub mod arbitration;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod events;
pub mod history;
pub mod metrics;
pub mod replay;
pub mod sources;
pub mod state_tree;
pub mod zones;

pub use engine::{DeltaEngine, IngestOutcome};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
