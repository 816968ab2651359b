//! Claim reconciliation and the resize lifecycle
//!
//! A claim moves `Idle -> ResizeInProgress -> FileSystemResizePending` or
//! `Idle -> ResizeInProgress -> Finished`:
//!
//! 1. `Resizing=True` is written to the claim
//! 2. the backend grows the volume
//! 3. the volume's declared capacity is raised
//! 4. the claim either gets `FileSystemResizePending=True` or its status
//!    capacity is set to the new size with resize conditions cleared
//!
//! Any step may fail; [`error_policy`] requeues the claim with backoff and the
//! next attempt starts over from the cached state. Every step is safe to
//! repeat.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimCondition,
};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use resizer_common::events::{actions, reasons, EventPublisher};
use resizer_common::metrics::ResizeMetrics;
use resizer_common::quantity::RESOURCE_STORAGE;
use resizer_common::{Error, Result};

use crate::backoff::RetryBackoff;
use crate::cache::ObjectCache;
use crate::conditions::{
    file_system_resize_pending_condition, merge_resize_conditions, resizing_condition,
};
use crate::decision::{bound_volume_name, claim_needs_resize, storage_class, volume_needs_resize};
use crate::key::ClaimKey;
use crate::patch::{patch_claim_status, patch_volume_capacity, ResizeKubeClient};
use crate::resizer::{ResizeOutcome, Resizer};

/// Shared dependencies of the reconciliation workers
pub struct Context {
    /// Cached claims and volumes
    pub cache: Arc<dyn ObjectCache>,
    /// Patch submission
    pub kube: Arc<dyn ResizeKubeClient>,
    /// Storage backend
    pub resizer: Arc<dyn Resizer>,
    /// Event sink for user-visible transitions
    pub events: Arc<dyn EventPublisher>,
    /// Resize metrics; `None` when metrics are disabled
    pub metrics: Option<ResizeMetrics>,
    /// Per-claim retry delays, shared with the claim informer
    pub backoff: Arc<RetryBackoff>,
}

impl Context {
    /// Context without metrics
    pub fn new(
        cache: Arc<dyn ObjectCache>,
        kube: Arc<dyn ResizeKubeClient>,
        resizer: Arc<dyn Resizer>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            cache,
            kube,
            resizer,
            events,
            metrics: None,
            backoff: Arc::new(RetryBackoff::default()),
        }
    }

    /// Record resize metrics
    pub fn with_metrics(mut self, metrics: ResizeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share retry state with the claim informer
    pub fn with_backoff(mut self, backoff: Arc<RetryBackoff>) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Controller entry point: reconcile one claim
///
/// Success clears the claim's retry history; the claim is revisited on its
/// next change or resync.
pub async fn reconcile(claim: Arc<PersistentVolumeClaim>, ctx: Arc<Context>) -> Result<Action> {
    let Some(key) = ClaimKey::from_claim(&claim) else {
        return Ok(Action::await_change());
    };
    sync_claim(&ctx, &key).await?;
    ctx.backoff.forget(&key);
    Ok(Action::await_change())
}

/// Requeue a failed claim after its exponential backoff
pub fn error_policy(claim: Arc<PersistentVolumeClaim>, error: &Error, ctx: Arc<Context>) -> Action {
    let Some(key) = ClaimKey::from_claim(&claim) else {
        return Action::await_change();
    };
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        claim = %key,
        error = %error,
        error_type = error.error_type(),
        retries = ctx.backoff.failures(&key),
        retry_in = ?delay,
        "Failed to sync claim, requeueing"
    );
    Action::requeue(delay)
}

/// Reconcile one claim against the cache
///
/// A claim or volume that is missing from the cache, or deleted while the
/// resize is in flight, has nothing left to do and counts as success.
#[instrument(skip(ctx, key), fields(claim = %key))]
pub async fn sync_claim(ctx: &Context, key: &ClaimKey) -> Result<()> {
    let Some(claim) = ctx.cache.get_claim(&key.namespace, &key.name) else {
        debug!("Claim deleted, nothing to do");
        return Ok(());
    };

    if !claim_needs_resize(&claim) {
        debug!("Claim does not need resize");
        return Ok(());
    }

    let Some(volume_name) = bound_volume_name(&claim) else {
        return Ok(());
    };
    let Some(volume) = ctx.cache.get_volume(volume_name) else {
        debug!(volume = volume_name, "Volume deleted, nothing to do");
        return Ok(());
    };

    if !volume_needs_resize(ctx.resizer.as_ref(), &claim, &volume) {
        debug!(volume = volume_name, "Volume does not need resize");
        return Ok(());
    }

    let timer = ctx
        .metrics
        .as_ref()
        .map(|m| m.start(&key.namespace, &storage_class(&claim)));
    match resize_claim(ctx, &claim, &volume).await {
        Ok(()) => {
            if let Some(timer) = timer {
                timer.success();
            }
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "Claim or volume deleted during resize, nothing to do");
            Ok(())
        }
        Err(e) => {
            if let Some(timer) = timer {
                timer.failure();
            }
            Err(e)
        }
    }
}

/// Drive one resize attempt from `Resizing` to its outcome
async fn resize_claim(
    ctx: &Context,
    claim: &PersistentVolumeClaim,
    volume: &PersistentVolume,
) -> Result<()> {
    let claim = mark_resize_in_progress(ctx, claim).await?;
    let claim_ref = object_ref(&claim);

    ctx.events
        .publish(
            &claim_ref,
            EventType::Normal,
            reasons::VOLUME_RESIZING,
            actions::RESIZE,
            Some(format!("External resizer is resizing volume {}", volume.name_any())),
        )
        .await;

    let result = async {
        let outcome = resize_volume(ctx, &claim, volume).await?;
        if outcome.fs_resize_required {
            mark_file_system_resize_required(ctx, &claim).await
        } else {
            mark_resize_finished(ctx, &claim, &outcome).await
        }
    }
    .await;

    if let Some(e) = result.as_ref().err().filter(|e| !e.is_not_found()) {
        warn!(error = %e, error_type = e.error_type(), "Resize failed");
        ctx.events
            .publish(
                &claim_ref,
                EventType::Warning,
                reasons::VOLUME_RESIZE_FAILED,
                actions::RESIZE,
                Some(e.to_string()),
            )
            .await;
    }
    result
}

async fn mark_resize_in_progress(
    ctx: &Context,
    claim: &PersistentVolumeClaim,
) -> Result<PersistentVolumeClaim> {
    let new = with_conditions(claim, vec![resizing_condition()]);
    patch_claim_status(ctx.kube.as_ref(), claim, &new).await
}

/// Call the backend, then raise the volume's declared capacity
async fn resize_volume(
    ctx: &Context,
    claim: &PersistentVolumeClaim,
    volume: &PersistentVolume,
) -> Result<ResizeOutcome> {
    let requested = claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(RESOURCE_STORAGE))
        .cloned()
        .ok_or_else(|| Error::quantity("", "claim has no storage request"))?;

    let outcome = ctx.resizer.resize(volume, &requested).await?;
    debug!(
        volume = %volume.name_any(),
        new_size = %outcome.new_size.0,
        fs_resize_required = outcome.fs_resize_required,
        "Backend resize succeeded"
    );

    patch_volume_capacity(ctx.kube.as_ref(), volume, &outcome.new_size).await?;
    Ok(outcome)
}

async fn mark_file_system_resize_required(
    ctx: &Context,
    claim: &PersistentVolumeClaim,
) -> Result<()> {
    let new = with_conditions(claim, vec![file_system_resize_pending_condition()]);
    let updated = patch_claim_status(ctx.kube.as_ref(), claim, &new).await?;

    info!("Volume grown, waiting for file system resize on a node");
    ctx.events
        .publish(
            &object_ref(&updated),
            EventType::Normal,
            reasons::FILE_SYSTEM_RESIZE_REQUIRED,
            actions::UPDATE_STATUS,
            Some("Require file system resize of volume on node".to_string()),
        )
        .await;
    Ok(())
}

async fn mark_resize_finished(
    ctx: &Context,
    claim: &PersistentVolumeClaim,
    outcome: &ResizeOutcome,
) -> Result<()> {
    let mut new = with_conditions(claim, vec![]);
    new.status
        .get_or_insert_with(Default::default)
        .capacity
        .get_or_insert_with(Default::default)
        .insert(RESOURCE_STORAGE.to_string(), outcome.new_size.clone());
    let updated = patch_claim_status(ctx.kube.as_ref(), claim, &new).await?;

    info!(new_size = %outcome.new_size.0, "Resize finished");
    ctx.events
        .publish(
            &object_ref(&updated),
            EventType::Normal,
            reasons::VOLUME_RESIZE_SUCCESSFUL,
            actions::UPDATE_STATUS,
            Some("Resize volume succeeded".to_string()),
        )
        .await;
    Ok(())
}

/// Clone of `claim` with resize conditions merged to `desired`
fn with_conditions(
    claim: &PersistentVolumeClaim,
    desired: Vec<PersistentVolumeClaimCondition>,
) -> PersistentVolumeClaim {
    let mut new = claim.clone();
    let status = new.status.get_or_insert_with(Default::default);
    let merged = merge_resize_conditions(status.conditions.as_deref().unwrap_or_default(), desired);
    status.conditions = (!merged.is_empty()).then_some(merged);
    new
}

fn object_ref(claim: &PersistentVolumeClaim) -> ObjectReference {
    claim.object_ref(&())
}
