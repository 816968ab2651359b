//! hostPath development backend
//!
//! "Resizes" a hostPath volume by recording the requested byte count in a
//! marker file inside the volume directory. Useful for exercising the
//! controller on a single-node cluster; it does not grow any real storage
//! and will not work across nodes.

#![deny(missing_docs)]

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use resizer_common::{Error, Result, StorageSize};
use resizer_controller::{ResizeOutcome, Resizer};

/// Backend name
pub const NAME: &str = "kubernetes.io/host-path";

/// Marker file written into the volume directory
pub const SIZE_FILE_NAME: &str = "kubernetes-host-path-size";

/// Resizer for directory-backed hostPath volumes
#[derive(Clone, Debug, Default)]
pub struct HostPathResizer;

impl HostPathResizer {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }
}

/// hostPath types that name a plain directory
fn is_directory_type(type_: Option<&str>) -> bool {
    matches!(type_, None | Some("") | Some("Directory") | Some("DirectoryOrCreate"))
}

fn host_path(volume: &PersistentVolume) -> Option<&str> {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.host_path.as_ref())
        .map(|h| h.path.as_str())
}

/// Location of the marker file for a volume rooted at `dir`
pub fn size_file(dir: &Path) -> PathBuf {
    dir.join(SIZE_FILE_NAME)
}

#[async_trait]
impl Resizer for HostPathResizer {
    fn name(&self) -> &str {
        NAME
    }

    fn can_support(&self, volume: &PersistentVolume) -> bool {
        volume
            .spec
            .as_ref()
            .and_then(|s| s.host_path.as_ref())
            .is_some_and(|h| is_directory_type(h.type_.as_deref()))
    }

    async fn resize(
        &self,
        volume: &PersistentVolume,
        requested: &Quantity,
    ) -> Result<ResizeOutcome> {
        let volume_name = volume.metadata.name.clone().unwrap_or_default();
        let dir = host_path(volume)
            .ok_or_else(|| Error::resize(&volume_name, "volume has no hostPath source"))?;
        let bytes = StorageSize::from_quantity(requested)?;

        let path = size_file(Path::new(dir));
        tokio::fs::write(&path, bytes.to_string())
            .await
            .map_err(|e| Error::resize(&volume_name, format!("write {}: {e}", path.display())))?;
        debug!(volume = %volume_name, path = %path.display(), %bytes, "Recorded hostPath size");

        Ok(ResizeOutcome {
            new_size: requested.clone(),
            fs_resize_required: false,
        })
    }
}
