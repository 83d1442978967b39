//! Pelorus ingest-and-fusion core.
//!
//! Upstream AIS/ADSB feeds → normalization → validation → per-key event-time
//! windows → fusion decisions → realtime cache + historical store, with an
//! α–β smoother dead-reckoning between measurements.

pub mod adapters;
pub mod cache;
pub mod config;
pub mod decider;
pub mod fusion;
pub mod history;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod publish;
pub mod smoother;
pub mod validate;
pub mod window;
