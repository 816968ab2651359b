//! Kubernetes Event recording for resize transitions.
//!
//! Events land on the claim being resized and are what users see in
//! `kubectl describe pvc`. Publishing is fire-and-forget: failures are
//! logged as warnings and never fail a reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for user-visible resize transitions
///
/// Publishing never fails the caller; implementations log and move on.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason` on `resource_ref` (normally the claim)
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `volume-resizer/<backend>`.
    pub fn new(client: Client, backend_name: &str) -> Self {
        let reporter = Reporter {
            controller: format!("{}/{}", crate::CONTROLLER_NAME, backend_name),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Resize started, `Resizing` condition set on the claim
    pub const VOLUME_RESIZING: &str = "Resizing";
    /// Backend or object update failed
    pub const VOLUME_RESIZE_FAILED: &str = "VolumeResizeFailed";
    /// Claim capacity updated to the new size
    pub const VOLUME_RESIZE_SUCCESSFUL: &str = "VolumeResizeSuccessful";
    /// Volume grown, waiting for a node to grow the file system
    pub const FILE_SYSTEM_RESIZE_REQUIRED: &str = "FileSystemResizeRequired";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Expanding a volume
    pub const RESIZE: &str = "Resize";
    /// Recording the outcome on the claim or volume
    pub const UPDATE_STATUS: &str = "UpdateStatus";
}

/// Message of the `FileSystemResizePending` claim condition
pub const FILE_SYSTEM_RESIZE_PENDING_MESSAGE: &str =
    "Waiting for user to (re-)start a pod to finish file system resize of volume on node.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_match_cluster_conventions() {
        assert_eq!(reasons::VOLUME_RESIZING, "Resizing");
        assert_eq!(reasons::VOLUME_RESIZE_FAILED, "VolumeResizeFailed");
        assert_eq!(reasons::VOLUME_RESIZE_SUCCESSFUL, "VolumeResizeSuccessful");
        assert_eq!(reasons::FILE_SYSTEM_RESIZE_REQUIRED, "FileSystemResizeRequired");
    }

    #[tokio::test]
    async fn noop_publisher_accepts_warnings_on_any_claim() {
        let claim_ref = ObjectReference {
            kind: Some("PersistentVolumeClaim".to_string()),
            namespace: Some("apps".to_string()),
            name: Some("data".to_string()),
            ..Default::default()
        };
        NoopEventPublisher
            .publish(
                &claim_ref,
                EventType::Warning,
                reasons::VOLUME_RESIZE_FAILED,
                actions::RESIZE,
                Some("backend unavailable".to_string()),
            )
            .await;
    }
}
