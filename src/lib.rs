//! edata statistics bridge
//!
//! Fetches Spanish electricity meter data from Datadis, keeps Home Assistant
//! long-term statistics incrementally in sync with it, and compiles the
//! per-meter summary read by sensors and the dashboard card.

pub mod attributes;
pub mod billing;
pub mod config;
pub mod coordinator;
pub mod cups;
pub mod dashboard;
pub mod datadis;
pub mod dates;
pub mod error;
pub mod formula;
pub mod helper;
pub mod home_assistant;
pub mod meter;
pub mod provider;
pub mod recorder;
pub mod setup;
pub mod statistics;
pub mod storage;
pub mod store;
pub mod streams;
pub mod tariff;

// Re-export commonly used types for easier access
pub use config::Config;
pub use coordinator::MeterCoordinator;
pub use helper::{Dataset, EdataHelper};
pub use meter::{MeterHandle, MeterRegistry, MeterView};
pub use recorder::RecorderStatsStore;
pub use statistics::Reconciler;
pub use store::{MemoryStatsStore, StatsStore};
