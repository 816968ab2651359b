//! Leader election using Kubernetes Leases
//!
//! Only one resizer replica may patch claims at a time. Replicas compete for
//! a `coordination.k8s.io/v1` Lease; the holder renews it every retry period
//! and gives up leadership once renewals have failed for longer than the
//! renew deadline.
//!
//! Lease writes carry the `resourceVersion` that was read, so concurrent
//! takeovers fail with 409 Conflict instead of both replicas winning.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result};

const FIELD_MANAGER: &str = "volume-resizer";

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Timing and identity of a leader election participant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// Holder identity written into the Lease
    pub identity: String,
    /// Lease object name
    pub lock_name: String,
    /// Namespace holding the Lease
    pub namespace: String,
    /// Interval between acquire attempts and between renewals
    pub retry_period: Duration,
    /// How long a non-renewed lease stays valid for other candidates
    pub lease_duration: Duration,
    /// How long the leader keeps failing renewals before giving up
    pub renew_deadline: Duration,
}

impl LeaderElectionConfig {
    /// Config with the standard 5s retry, 15s lease and 10s renew deadline
    pub fn new(
        identity: impl Into<String>,
        lock_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            lock_name: lock_name.into(),
            namespace: namespace.into(),
            retry_period: Duration::from_secs(5),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
        }
    }

    /// Reject timings under which two replicas could both believe they lead
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(Error::config("leader election identity must not be empty"));
        }
        if self.retry_period.is_zero() {
            return Err(Error::config("leader election retry period must be positive"));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::config(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::config(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// What to do with the Lease as currently observed
#[derive(Clone, Debug, PartialEq, Eq)]
enum LeaseAction {
    /// No Lease exists yet
    Create,
    /// We hold it; bump renewTime
    Renew,
    /// Holder let it expire; take over with the next transition count
    TakeOver { transitions: i32 },
    /// Someone else holds a live lease
    Wait,
}

fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();

    match spec.and_then(|s| s.holder_identity.as_deref()) {
        Some(holder) if holder == identity => return LeaseAction::Renew,
        Some(holder) if !holder.is_empty() => {
            let renew_time = spec.and_then(|s| s.renew_time.as_ref());
            let duration = spec.and_then(|s| s.lease_duration_seconds);
            if let (Some(renewed), Some(secs)) = (renew_time, duration) {
                if now <= renewed.0 + chrono::Duration::seconds(i64::from(secs)) {
                    return LeaseAction::Wait;
                }
            }
        }
        _ => {}
    }

    LeaseAction::TakeOver {
        transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
    }
}

/// Lease-based leader elector
pub struct LeaderElector {
    client: Client,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    /// Create an elector; fails on inconsistent timings
    pub fn new(client: Client, config: LeaderElectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { client, config })
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// API errors while campaigning are logged and retried; only a caller
    /// dropping the future stops the campaign.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.config.identity,
            lease = %self.config.lock_name,
            namespace = %self.config.namespace,
            "Waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.config.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(identity = %self.config.identity, "Lease held by another candidate");
                }
                Err(e) => {
                    warn!(
                        identity = %self.config.identity,
                        error = %e,
                        "Failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(self.config.retry_period).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let api = self.api();
        let existing = api.get_opt(&self.config.lock_name).await?;
        let now = Utc::now();

        match decide(existing.as_ref(), &self.config.identity, now) {
            LeaseAction::Wait => Ok(false),
            LeaseAction::Create => {
                let lease = self.lease(None, now, now, 0);
                self.write(api.create(&post_params(), &lease).await, "create")
            }
            LeaseAction::Renew => {
                let mut updated = existing.unwrap_or_default();
                if let Some(spec) = updated.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                    spec.lease_duration_seconds = Some(self.lease_duration_secs());
                }
                self.write(
                    api.replace(&self.config.lock_name, &post_params(), &updated)
                        .await,
                    "renew",
                )
            }
            LeaseAction::TakeOver { transitions } => {
                let resource_version = existing.and_then(|l| l.metadata.resource_version);
                if resource_version.is_none() {
                    return Err(Error::leader_election("lease has no resourceVersion"));
                }
                let lease = self.lease(resource_version, now, now, transitions);
                let taken = self.write(
                    api.replace(&self.config.lock_name, &post_params(), &lease)
                        .await,
                    "take over",
                )?;
                if taken {
                    info!(identity = %self.config.identity, transitions, "Took over expired lease");
                }
                Ok(taken)
            }
        }
    }

    /// Map a lease write: 409 means another candidate won the race
    fn write(&self, result: kube::Result<Lease>, op: &str) -> Result<bool> {
        match result {
            Ok(_) => {
                debug!(identity = %self.config.identity, op, "Lease written");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.config.identity, op, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease(
        &self,
        resource_version: Option<String>,
        acquired: DateTime<Utc>,
        renewed: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lock_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration_secs()),
                acquire_time: Some(MicroTime(acquired)),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    fn lease_duration_secs(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    /// Renew every retry period until a renewal has been missing for the
    /// renew deadline or another holder shows up
    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.config.retry_period).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.config.identity, "Lease taken by another candidate");
                    break;
                }
                Err(e) if last_renewed.elapsed() < self.config.renew_deadline => {
                    warn!(
                        identity = %self.config.identity,
                        error = %e,
                        "Lease renewal failed, retrying"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.config.identity,
                        error = %e,
                        "Lease renewal failed past the renew deadline"
                    );
                    break;
                }
            }
        }
        let _ = lost_tx.send(());
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<()> {
        let api = self.api();
        let Some(lease) = api.get_opt(&self.config.lock_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.config.identity.as_str()) {
            debug!(identity = %self.config.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": {
                "holderIdentity": null,
                "leaseDurationSeconds": 1,
                "renewTime": MicroTime(Utc::now()),
            }
        });
        api.patch(
            &self.config.lock_name,
            &patch_params(),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.config.identity, "Lease released");
        Ok(())
    }
}

/// Held while this process is the leader
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.as_mut() {
            let _ = rx.await;
            self.lost_rx = None;
        }
    }

    /// Stop renewing and hand the lease back (graceful shutdown)
    pub async fn release(self) -> Result<()> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
