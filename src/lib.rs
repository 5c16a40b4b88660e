//! Cerebro observability core.
//!
//! A chunked on-disk cache of Prometheus range queries, an OTLP collector
//! writing into ClickHouse, and watchers that turn the resulting world model
//! into deployments, incidents and alerts delivered through notification
//! integrations.

pub mod cache;
pub mod chunk;
pub mod collector;
pub mod config;
pub mod constants;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod notifications;
pub mod pool;
pub mod prom;
pub mod telemetry;
pub mod template;
pub mod timeseries;
pub mod watchers;

pub use config::ObserveConfig;
pub use engine::Engine;
pub use error::{ObserveError, ObserveResult};
pub use watchers::WorldSource;
