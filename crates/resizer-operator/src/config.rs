//! Command line configuration
//!
//! Every flag can also be set through the environment so the same image runs
//! unchanged under different Deployments.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use resizer_common::kube_utils::sanitize_name;
use resizer_common::leader_election::LeaderElectionConfig;
use resizer_common::{Error, Result, DEFAULT_LEADER_ELECTION_NAMESPACE};
use resizer_controller::runner::{DEFAULT_RESYNC_PERIOD, DEFAULT_WORKERS};
use resizer_controller::{ControllerConfig, Resizer};
use resizer_hostpath::HostPathResizer;

/// Storage backends the process can drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Single-node hostPath volumes (development only)
    #[value(name = "hostpath")]
    HostPath,
}

impl Backend {
    /// Instantiate the backend
    pub fn resizer(self) -> Arc<dyn Resizer> {
        match self {
            Backend::HostPath => Arc::new(HostPathResizer::new()),
        }
    }
}

/// External volume resizer: grows PersistentVolumes when their claims ask for more
#[derive(Parser, Debug, Clone)]
#[command(name = "volume-resizer", version, about, long_about = None)]
pub struct Cli {
    /// Absolute path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Leader election identity; defaults to `<backend>-<random uuid>`
    #[arg(long, env = "RESIZER_IDENTITY")]
    pub identity: Option<String>,

    /// Interval between reconciliations of every cached claim
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    pub resync_period: Duration,

    /// Number of claims processed concurrently
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Storage backend
    #[arg(long, value_enum, default_value_t = Backend::HostPath)]
    pub backend: Backend,

    /// Only run the controller while holding the leader Lease
    #[arg(long, env = "RESIZER_LEADER_ELECTION")]
    pub leader_election: bool,

    /// Namespace of the leader election Lease
    #[arg(long, default_value = DEFAULT_LEADER_ELECTION_NAMESPACE)]
    pub leader_election_namespace: String,

    /// Interval between acquire attempts and renewals
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub leader_election_retry_period: Duration,

    /// How long a non-renewed Lease stays valid for other replicas
    #[arg(long, value_parser = humantime::parse_duration, default_value = "15s")]
    pub leader_election_lease_duration: Duration,

    /// How long the leader keeps retrying renewals before giving up
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub leader_election_renew_deadline: Duration,

    /// Serve Prometheus metrics
    #[arg(long, env = "RESIZER_ENABLE_METRICS")]
    pub enable_metrics: bool,

    /// HTTP path of the metrics endpoint
    #[arg(long, default_value = "/metrics")]
    pub metrics_path: String,

    /// Listen address of the metrics endpoint, e.g. `0.0.0.0:8080`
    #[arg(long, env = "RESIZER_METRICS_ADDRESS")]
    pub metrics_address: Option<String>,
}

impl Cli {
    /// Check flag combinations clap cannot express
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("--workers must be at least 1"));
        }
        if self.resync_period.is_zero() {
            return Err(Error::config("--resync-period must be positive"));
        }
        if self.enable_metrics {
            if self.metrics_address().is_none() {
                return Err(Error::config(
                    "--metrics-address is required when --enable-metrics is set",
                ));
            }
            if !self.metrics_path.starts_with('/') {
                return Err(Error::config(format!(
                    "--metrics-path must start with '/', got {:?}",
                    self.metrics_path
                )));
            }
        }
        if self.leader_election {
            self.leader_election_config(&self.identity())?;
        }
        Ok(())
    }

    /// Non-empty metrics listen address
    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    /// Identity flag or a fresh `<backend>-<uuid>`
    pub fn identity(&self) -> String {
        match &self.identity {
            Some(identity) if !identity.is_empty() => identity.clone(),
            _ => format!("{}-{}", self.lock_name(), uuid::Uuid::new_v4()),
        }
    }

    /// Lease name derived from the backend name
    pub fn lock_name(&self) -> String {
        sanitize_name(self.backend.resizer().name())
    }

    /// Leader election settings for `identity`
    pub fn leader_election_config(&self, identity: &str) -> Result<LeaderElectionConfig> {
        let mut config = LeaderElectionConfig::new(
            identity,
            self.lock_name(),
            self.leader_election_namespace.clone(),
        );
        config.retry_period = self.leader_election_retry_period;
        config.lease_duration = self.leader_election_lease_duration;
        config.renew_deadline = self.leader_election_renew_deadline;
        config.validate()?;
        Ok(config)
    }

    /// Worker pool settings
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            resync_period: self.resync_period,
        }
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            identity: None,
            resync_period: DEFAULT_RESYNC_PERIOD,
            workers: DEFAULT_WORKERS,
            backend: Backend::HostPath,
            leader_election: false,
            leader_election_namespace: DEFAULT_LEADER_ELECTION_NAMESPACE.to_string(),
            leader_election_retry_period: Duration::from_secs(5),
            leader_election_lease_duration: Duration::from_secs(15),
            leader_election_renew_deadline: Duration::from_secs(10),
            enable_metrics: false,
            metrics_path: "/metrics".to_string(),
            metrics_address: None,
        }
    }
}
