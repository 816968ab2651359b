//! Volume resize controller
//!
//! Watches PersistentVolumeClaims, decides which ones request more storage
//! than they have, and drives each through the resize lifecycle using a
//! pluggable [`Resizer`] backend.

#![deny(missing_docs)]

pub mod backoff;
pub mod cache;
pub mod conditions;
pub mod controller;
pub mod decision;
pub mod key;
pub mod patch;
pub mod resizer;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::RetryBackoff;
pub use cache::{ObjectCache, ReflectorCache};
pub use controller::{error_policy, reconcile, sync_claim, Context};
pub use key::ClaimKey;
pub use patch::{KubeClientImpl, ResizeKubeClient};
pub use resizer::{ResizeOutcome, Resizer};
pub use runner::{run, run_controller, ControllerConfig};
