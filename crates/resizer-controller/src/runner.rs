//! Controller runtime wiring
//!
//! Claims are reconciled by a kube-runtime [`Controller`] fed from the claim
//! informer's trigger stream. The controller store is the informer's claim
//! store, so a retry scheduled for a claim that was deleted in the meantime
//! finds nothing and is dropped. Startup waits for both caches; every
//! `resync_period` each cached claim is reconciled again.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::Client;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::{IntervalStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use resizer_common::events::EventPublisher;
use resizer_common::metrics::ResizeMetrics;
use resizer_common::{Error, Result};

use crate::backoff::RetryBackoff;
use crate::cache::ReflectorCache;
use crate::controller::{error_policy, reconcile, Context};
use crate::patch::KubeClientImpl;
use crate::resizer::Resizer;

/// Default number of claims reconciled concurrently
pub const DEFAULT_WORKERS: usize = 10;
/// Default full resync interval
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(120);

/// Controller runtime settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Claims reconciled concurrently
    pub workers: usize,
    /// Interval between reconciliations of every cached claim
    pub resync_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_period: DEFAULT_RESYNC_PERIOD,
        }
    }
}

/// Wire the production cache and patch client, then run until `shutdown`
pub async fn run_controller(
    client: Client,
    resizer: Arc<dyn Resizer>,
    events: Arc<dyn EventPublisher>,
    metrics: Option<ResizeMetrics>,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let backoff = Arc::new(RetryBackoff::default());
    let (cache, triggers) =
        ReflectorCache::spawn(client.clone(), Arc::clone(&backoff), shutdown.clone());
    let claims = cache.claim_store();

    let mut ctx = Context::new(
        Arc::new(cache),
        Arc::new(KubeClientImpl::new(client)),
        resizer,
        events,
    )
    .with_backoff(backoff);
    ctx.metrics = metrics;

    run(
        Arc::new(ctx),
        claims,
        UnboundedReceiverStream::new(triggers),
        config,
        shutdown,
    )
    .await
}

/// Wait for cache sync, then reconcile `triggers` until `shutdown`
///
/// Returns `Error::CacheSync` if `shutdown` fires before the caches are
/// ready; nothing is reconciled in that case. On shutdown, in-flight
/// reconciliations finish before this returns.
pub async fn run<S>(
    ctx: Arc<Context>,
    claims: Store<PersistentVolumeClaim>,
    triggers: S,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = PersistentVolumeClaim> + Send + 'static,
{
    info!(resizer = ctx.resizer.name(), "Waiting for claim and volume caches to sync");
    if !ctx.cache.wait_for_sync(&shutdown).await {
        return Err(Error::cache_sync(
            "shutdown requested before claim and volume caches synced",
        ));
    }

    let concurrency = u16::try_from(config.workers.max(1)).unwrap_or(u16::MAX);
    info!(
        workers = concurrency,
        resync_period = ?config.resync_period,
        "Caches synced, starting controller"
    );

    let period = config.resync_period;
    let resync = {
        let claims = claims.clone();
        IntervalStream::new(interval_at(Instant::now() + period, period)).map(move |_| {
            debug!(claims = claims.state().len(), "Resyncing claims");
        })
    };

    Controller::for_stream(triggers.map(Ok::<_, watcher::Error>), claims)
        .with_config(controller::Config::default().concurrency(concurrency))
        .reconcile_all_on(resync)
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result)
        .await;

    info!("Controller stopped");
    Ok(())
}

type ReconcileResult = std::result::Result<
    (ObjectRef<PersistentVolumeClaim>, Action),
    controller::Error<Error, watcher::Error>,
>;

/// Failures were already logged by the error policy
fn log_reconcile_result(result: ReconcileResult) -> std::future::Ready<()> {
    match result {
        Ok((claim, action)) => debug!(claim = %claim, ?action, "Claim reconciled"),
        Err(controller::Error::ObjectNotFound(claim)) => {
            debug!(claim = %claim, "Claim deleted before its retry, skipping")
        }
        Err(controller::Error::ReconcilerFailed(_, claim)) => {
            debug!(claim = %claim, "Claim reconciliation failed")
        }
        Err(e) => error!(error = %e, "Controller error"),
    }
    std::future::ready(())
}
