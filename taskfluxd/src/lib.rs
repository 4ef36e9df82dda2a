//! Host process monitor core: snapshot sampling, suspicion scoring, threat
//! classification, health aggregation, the event/log bus and process actions.
//!
//! One cycle flows strictly one way:
//!
//! ```text
//! Sampler -> ScoringEngine -> ThreatClassifier -> HealthAggregator -> publish
//!    \____________\_________________\___________________\____ LogBus
//! ```
//!
//! The [`executor::ActionExecutor`] runs outside the cadence and reports back
//! through the same [`bus::LogBus`].

pub mod api;
pub mod bus;
pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod history;
pub mod metrics;
pub mod pipeline;
pub mod sampler;
pub mod scoring;
pub mod threats;
pub mod types;

pub use config::{Config, RuntimeConfig, SettingsStore};
pub use metrics::Metrics;
pub use pipeline::{CycleResult, Pipeline};
pub use types::{Pid, ProcessSnapshot, SignatureStatus, SystemSnapshot};
