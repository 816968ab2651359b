//! Error types for the volume resizer
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the object it concerns (claim key, volume name)
//! so the error policy can log it without extra context.

use thiserror::Error;

/// Main error type for resizer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency conflict from a conditional patch
    #[error("conflict patching {kind} {key}: {message}")]
    Conflict {
        /// Resource kind being patched (PersistentVolumeClaim, PersistentVolume)
        kind: String,
        /// Object key (namespace/name or name)
        key: String,
        /// Message returned by the API server
        message: String,
    },

    /// Object was not found in the cache or the API server
    #[error("{kind} {key} not found")]
    NotFound {
        /// Resource kind that was looked up
        kind: String,
        /// Object key that was looked up
        key: String,
    },

    /// Backend resize failure
    #[error("resize volume {volume} failed: {message}")]
    Resize {
        /// Name of the volume being resized
        volume: String,
        /// Description of what failed
        message: String,
    },

    /// Resource quantity could not be parsed
    #[error("invalid quantity {value:?}: {message}")]
    Quantity {
        /// The raw quantity string
        value: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Cache did not sync before shutdown was requested
    #[error("cache sync failed: {message}")]
    CacheSync {
        /// Description of which caches never became ready
        message: String,
    },

    /// Leader election infrastructure failure or lost leadership
    #[error("leader election error: {message}")]
    LeaderElection {
        /// Description of what failed
        message: String,
    },

    /// Configuration error detected at startup
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "metrics", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for the given object
    pub fn conflict(
        kind: impl Into<String>,
        key: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given object
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a backend resize error for the given volume
    pub fn resize(volume: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resize {
            volume: volume.into(),
            message: msg.into(),
        }
    }

    /// Create a quantity parse error
    pub fn quantity(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Quantity {
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a cache sync error
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync {
            message: msg.into(),
        }
    }

    /// Create a leader election error
    pub fn leader_election(msg: impl Into<String>) -> Self {
        Self::LeaderElection {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for optimistic concurrency conflicts, including raw 409s from kube
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// True when the subject of the operation no longer exists
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True for errors that abort the process instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CacheSync { .. } | Error::LeaderElection { .. } | Error::Config { .. }
        )
    }

    /// Short label used for logs and metric attributes
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Kube { .. } if self.is_conflict() => "conflict",
            Error::Kube { .. } if self.is_not_found() => "not_found",
            Error::Kube { .. } => "kube",
            Error::Conflict { .. } => "conflict",
            Error::NotFound { .. } => "not_found",
            Error::Resize { .. } => "backend",
            Error::Quantity { .. } => "quantity",
            Error::Serialization { .. } => "serialization",
            Error::CacheSync { .. } => "cache_sync",
            Error::LeaderElection { .. } => "leader_election",
            Error::Config { .. } => "config",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
