//! Read-only cluster object cache and the claim informer
//!
//! Claims and volumes are mirrored into kube-rs reflector stores. The claim
//! watcher also produces the controller's triggers: every add/update forwards
//! the claim, and every delete resets the claim's retry backoff. Both
//! watchers run on their own tasks so the stores sync before any
//! reconciliation starts.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[cfg(test)]
use mockall::automock;

use crate::backoff::RetryBackoff;
use crate::key::ClaimKey;

/// Read access to cached claims and volumes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectCache: Send + Sync {
    /// Cached claim by namespace and name
    fn get_claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>>;

    /// Cached volume by name
    fn get_volume(&self, name: &str) -> Option<Arc<PersistentVolume>>;

    /// Every cached claim
    fn list_claims(&self) -> Vec<Arc<PersistentVolumeClaim>>;

    /// Wait until both caches hold a complete initial listing
    ///
    /// Returns false if `shutdown` fires first.
    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool;
}

/// Cache backed by reflector stores fed from watch streams
#[derive(Clone)]
pub struct ReflectorCache {
    claims: Store<PersistentVolumeClaim>,
    volumes: Store<PersistentVolume>,
}

impl ReflectorCache {
    /// Cache over existing stores
    pub fn new(claims: Store<PersistentVolumeClaim>, volumes: Store<PersistentVolume>) -> Self {
        Self { claims, volumes }
    }

    /// Start the claim and volume watchers
    ///
    /// Returns the cache and the stream of claims to reconcile. Deleted
    /// claims have their retry history cleared in `backoff`. The watchers
    /// stop when `shutdown` is cancelled, which also closes the stream.
    pub fn spawn(
        client: Client,
        backoff: Arc<RetryBackoff>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<PersistentVolumeClaim>) {
        let (claims, claim_writer) = reflector::store::<PersistentVolumeClaim>();
        let (volumes, volume_writer) = reflector::store::<PersistentVolume>();
        let (triggers, trigger_rx) = mpsc::unbounded_channel();

        let claim_events = watcher::watcher(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .reflect(claim_writer);
        tokio::spawn(run_claim_informer(
            claim_events,
            backoff,
            triggers,
            shutdown.clone(),
        ));

        let volume_events = watcher::watcher(
            Api::<PersistentVolume>::all(client),
            watcher::Config::default(),
        )
        .default_backoff()
        .reflect(volume_writer);
        tokio::spawn(drain_volume_events(volume_events, shutdown));

        (Self::new(claims, volumes), trigger_rx)
    }

    /// Reader over the claim store, shared with the controller runtime
    pub fn claim_store(&self) -> Store<PersistentVolumeClaim> {
        self.claims.clone()
    }
}

#[async_trait]
impl ObjectCache for ReflectorCache {
    fn get_claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims
            .get(&ObjectRef::<PersistentVolumeClaim>::new(name).within(namespace))
    }

    fn get_volume(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.volumes.get(&ObjectRef::new(name))
    }

    fn list_claims(&self) -> Vec<Arc<PersistentVolumeClaim>> {
        self.claims.state()
    }

    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        let ready = async {
            self.claims.wait_until_ready().await.is_ok()
                && self.volumes.wait_until_ready().await.is_ok()
        };
        tokio::select! {
            ready = ready => ready,
            _ = shutdown.cancelled() => false,
        }
    }
}

/// Route one claim watch event
///
/// Added and updated claims become triggers; a deleted claim only loses its
/// retry history, and any retry still scheduled for it finds nothing in the
/// store and is skipped.
pub(crate) fn handle_claim_event(
    event: Event<PersistentVolumeClaim>,
    backoff: &RetryBackoff,
    triggers: &mpsc::UnboundedSender<PersistentVolumeClaim>,
) {
    match event {
        Event::Apply(claim) | Event::InitApply(claim) => {
            if let Some(key) = ClaimKey::from_claim(&claim) {
                trace!(claim = %key, "Claim added or updated");
            }
            if triggers.send(claim).is_err() {
                trace!("Controller stopped, dropping claim trigger");
            }
        }
        Event::Delete(claim) => {
            if let Some(key) = ClaimKey::from_claim(&claim) {
                debug!(claim = %key, "Claim deleted");
                backoff.forget(&key);
            }
        }
        Event::Init | Event::InitDone => {}
    }
}

async fn run_claim_informer<S>(
    events: S,
    backoff: Arc<RetryBackoff>,
    triggers: mpsc::UnboundedSender<PersistentVolumeClaim>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<Event<PersistentVolumeClaim>, watcher::Error>> + Send,
{
    info!("Starting claim informer");
    let mut events = std::pin::pin!(events);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.try_next() => match next {
                Ok(Some(event)) => handle_claim_event(event, &backoff, &triggers),
                Ok(None) => break,
                Err(e) => warn!(error = %e, "Claim watch failed, retrying with backoff"),
            },
        }
    }
    info!("Claim informer stopped");
}

async fn drain_volume_events<S>(events: S, shutdown: CancellationToken)
where
    S: Stream<Item = Result<Event<PersistentVolume>, watcher::Error>> + Send,
{
    let mut events = std::pin::pin!(events);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.next() => match next {
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!(error = %e, "Volume watch failed, retrying with backoff"),
                None => break,
            },
        }
    }
}
