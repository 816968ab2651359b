//! Decides whether a claim and its volume still owe resize work
//!
//! Both predicates are pure functions of cached snapshots. A quantity that
//! fails to parse never triggers work; it is logged and treated as "no".

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;
use tracing::{debug, warn};

use resizer_common::quantity::storage_size;
use resizer_common::StorageSize;

use crate::conditions::{has_condition, FILE_SYSTEM_RESIZE_PENDING};
use crate::resizer::Resizer;

const PHASE_BOUND: &str = "Bound";
/// Legacy annotation that predates `spec.storageClassName`
const BETA_STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

/// Storage requested in the claim's spec
pub fn requested_size(claim: &PersistentVolumeClaim) -> resizer_common::Result<StorageSize> {
    storage_size(
        claim
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref()),
    )
}

/// Capacity recorded in the claim's status
pub fn actual_size(claim: &PersistentVolumeClaim) -> resizer_common::Result<StorageSize> {
    storage_size(claim.status.as_ref().and_then(|s| s.capacity.as_ref()))
}

/// Capacity declared in the volume's spec
pub fn volume_size(volume: &PersistentVolume) -> resizer_common::Result<StorageSize> {
    storage_size(volume.spec.as_ref().and_then(|s| s.capacity.as_ref()))
}

/// Name of the volume a claim is bound to, if any
pub fn bound_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Storage class of a claim for metric labels; empty when unset
pub fn storage_class(claim: &PersistentVolumeClaim) -> String {
    claim
        .annotations()
        .get(BETA_STORAGE_CLASS_ANNOTATION)
        .cloned()
        .or_else(|| claim.spec.as_ref().and_then(|s| s.storage_class_name.clone()))
        .unwrap_or_default()
}

/// True when a bound claim requests more storage than its status reports
pub fn claim_needs_resize(claim: &PersistentVolumeClaim) -> bool {
    let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase != Some(PHASE_BOUND) || bound_volume_name(claim).is_none() {
        return false;
    }

    match (requested_size(claim), actual_size(claim)) {
        (Ok(requested), Ok(actual)) => requested > actual,
        (Err(e), _) | (_, Err(e)) => {
            warn!(claim = %claim.name_any(), error = %e, "Unparseable claim size, skipping");
            false
        }
    }
}

/// True when the backend still has work for this volume
///
/// A volume already at the requested size still needs a pass unless the
/// claim waits on a file system resize: that pass confirms whether a file
/// system grow is needed and records the final capacity.
pub fn volume_needs_resize(
    resizer: &dyn Resizer,
    claim: &PersistentVolumeClaim,
    volume: &PersistentVolume,
) -> bool {
    if !resizer.can_support(volume) {
        debug!(
            resizer = resizer.name(),
            volume = %volume.name_any(),
            "Resizer does not support volume"
        );
        return false;
    }

    let (volume_size, requested) = match (volume_size(volume), requested_size(claim)) {
        (Ok(v), Ok(r)) => (v, r),
        (Err(e), _) | (_, Err(e)) => {
            warn!(volume = %volume.name_any(), error = %e, "Unparseable volume size, skipping");
            return false;
        }
    };

    if volume_size >= requested {
        return !has_condition(claim, FILE_SYSTEM_RESIZE_PENDING);
    }
    true
}
