//! Resize conditions on claim status
//!
//! The resizer owns two condition types on a claim: `Resizing` while the
//! backend is working and `FileSystemResizePending` once only the node-side
//! file system grow remains. Every other condition belongs to someone else
//! and is carried through untouched.

use chrono::Utc;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use resizer_common::events::FILE_SYSTEM_RESIZE_PENDING_MESSAGE;

/// Backend resize in progress
pub const RESIZING: &str = "Resizing";
/// Volume grown, file system grow pending on a node
pub const FILE_SYSTEM_RESIZE_PENDING: &str = "FileSystemResizePending";

const STATUS_TRUE: &str = "True";

/// True for the condition types this controller manages
pub fn is_resize_condition(condition_type: &str) -> bool {
    condition_type == RESIZING || condition_type == FILE_SYSTEM_RESIZE_PENDING
}

/// True if the claim carries `condition_type` with status `True`
pub fn has_condition(claim: &PersistentVolumeClaim, condition_type: &str) -> bool {
    claim
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == condition_type && c.status == STATUS_TRUE)
        })
}

/// `Resizing=True` stamped with the current time
pub fn resizing_condition() -> PersistentVolumeClaimCondition {
    PersistentVolumeClaimCondition {
        type_: RESIZING.to_string(),
        status: STATUS_TRUE.to_string(),
        last_transition_time: Some(Time(Utc::now())),
        ..Default::default()
    }
}

/// `FileSystemResizePending=True` stamped with the current time
pub fn file_system_resize_pending_condition() -> PersistentVolumeClaimCondition {
    PersistentVolumeClaimCondition {
        type_: FILE_SYSTEM_RESIZE_PENDING.to_string(),
        status: STATUS_TRUE.to_string(),
        last_transition_time: Some(Time(Utc::now())),
        message: Some(FILE_SYSTEM_RESIZE_PENDING_MESSAGE.to_string()),
        ..Default::default()
    }
}

/// Merge the desired resize conditions into a claim's existing conditions
///
/// - unrelated conditions stay where they are, unchanged
/// - a resize condition named in `desired` is replaced in place; when its
///   status did not change the old `lastTransitionTime` is kept
/// - a resize condition missing from `desired` is removed
/// - desired conditions not present before are appended in input order
pub fn merge_resize_conditions(
    existing: &[PersistentVolumeClaimCondition],
    desired: Vec<PersistentVolumeClaimCondition>,
) -> Vec<PersistentVolumeClaimCondition> {
    let mut pending: Vec<Option<PersistentVolumeClaimCondition>> =
        desired.into_iter().map(Some).collect();
    let mut merged = Vec::with_capacity(existing.len() + pending.len());

    for old in existing {
        if !is_resize_condition(&old.type_) {
            merged.push(old.clone());
            continue;
        }
        let replacement = pending
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|c| c.type_ == old.type_))
            .and_then(Option::take);
        if let Some(mut new) = replacement {
            if new.status == old.status {
                new.last_transition_time = old.last_transition_time.clone();
            }
            merged.push(new);
        }
    }

    merged.extend(pending.into_iter().flatten());
    merged
}
