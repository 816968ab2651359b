//! Backend seam: the storage system that actually grows a volume

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

#[cfg(test)]
use mockall::automock;

use resizer_common::Result;

/// Result of a successful backend resize
#[derive(Clone, Debug, PartialEq)]
pub struct ResizeOutcome {
    /// Capacity the volume has now; may exceed the request
    pub new_size: Quantity,
    /// True when a node still has to grow the file system
    pub fs_resize_required: bool,
}

/// A storage backend able to expand volumes
///
/// Exactly one backend is chosen when the process starts. Implementations
/// must tolerate being asked for a size the volume already has, since a
/// retried reconciliation repeats the call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Resizer: Send + Sync {
    /// Backend name, e.g. `kubernetes.io/host-path`
    fn name(&self) -> &str;

    /// Whether this backend manages `volume`
    fn can_support(&self, volume: &PersistentVolume) -> bool;

    /// Grow `volume` to at least `requested`
    async fn resize(
        &self,
        volume: &PersistentVolume,
        requested: &Quantity,
    ) -> Result<ResizeOutcome>;
}
