//! Process wiring for the external volume resizer: command line flags and the
//! Prometheus metrics endpoint

#![deny(missing_docs)]

pub mod config;
pub mod metrics_server;

pub use config::{Backend, Cli};
pub use metrics_server::{MetricsEndpoint, MetricsServer};
