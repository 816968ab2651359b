//! Shared building blocks for the volume resizer: errors, events, metrics,
//! telemetry, quantities and leader election

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod quantity;
pub mod telemetry;

pub use error::Error;
pub use quantity::StorageSize;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding the leader election Lease unless overridden
pub const DEFAULT_LEADER_ELECTION_NAMESPACE: &str = "kube-system";

/// Prefix of the reporting component on Kubernetes Events
pub const CONTROLLER_NAME: &str = "volume-resizer";
