//! Optimistic patch protocol
//!
//! Updates are sent as RFC 7386 merge patches holding only the fields that
//! differ between the cached snapshot and the desired object, plus the
//! snapshot's `metadata.resourceVersion`. The API server treats that
//! version as a precondition and answers 409 Conflict when the object moved
//! on in the meantime; the key is then retried from a fresh snapshot.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use resizer_common::quantity::{storage_size, RESOURCE_STORAGE};
use resizer_common::{Error, Result, StorageSize};

const FIELD_MANAGER: &str = "volume-resizer";
const CLAIM_KIND: &str = "PersistentVolumeClaim";
const VOLUME_KIND: &str = "PersistentVolume";

/// Submits merge patches for claims and volumes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResizeKubeClient: Send + Sync {
    /// Merge-patch the status subresource of a claim
    async fn patch_claim_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<PersistentVolumeClaim>;

    /// Merge-patch a volume
    async fn patch_volume(&self, name: &str, patch: &Value) -> Result<PersistentVolume>;
}

/// Production client talking to the API server
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn map_conflict(kind: &str, key: String, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, key, ae.message),
        e => Error::from(e),
    }
}

#[async_trait]
impl ResizeKubeClient for KubeClientImpl {
    async fn patch_claim_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &Self::params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_conflict(CLAIM_KIND, format!("{namespace}/{name}"), e))
    }

    async fn patch_volume(&self, name: &str, patch: &Value) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.patch(name, &Self::params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_conflict(VOLUME_KIND, name.to_string(), e))
    }
}

/// RFC 7386 merge patch turning `old` into `new`; `None` when they are equal
///
/// Objects are diffed key by key, removed keys become `null`, and any other
/// differing value (arrays included) is replaced whole.
pub fn merge_patch_diff(old: &Value, new: &Value) -> Option<Value> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, old_value) in old {
                match new.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) => {
                        if let Some(diff) = merge_patch_diff(old_value, new_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(new.clone()),
    }
}

fn with_precondition(resource_version: Option<String>, mut body: Map<String, Value>) -> Value {
    if let Some(rv) = resource_version {
        body.insert("metadata".to_string(), json!({ "resourceVersion": rv }));
    }
    Value::Object(body)
}

/// Patch body moving the claim's status from `old` to `new`
pub fn claim_status_patch(
    old: &PersistentVolumeClaim,
    new: &PersistentVolumeClaim,
) -> Result<Option<Value>> {
    let old_status = serde_json::to_value(&old.status)?;
    let new_status = serde_json::to_value(&new.status)?;
    let Some(diff) = merge_patch_diff(&old_status, &new_status) else {
        return Ok(None);
    };

    let mut body = Map::new();
    body.insert("status".to_string(), diff);
    Ok(Some(with_precondition(old.resource_version(), body)))
}

/// Patch body moving the volume's `spec.capacity` from `old` to `new`
pub fn volume_capacity_patch(
    old: &PersistentVolume,
    new: &PersistentVolume,
) -> Result<Option<Value>> {
    let capacity = |pv: &PersistentVolume| {
        serde_json::to_value(pv.spec.as_ref().and_then(|s| s.capacity.as_ref()))
    };
    let Some(diff) = merge_patch_diff(&capacity(old)?, &capacity(new)?) else {
        return Ok(None);
    };

    let mut body = Map::new();
    body.insert("spec".to_string(), json!({ "capacity": diff }));
    Ok(Some(with_precondition(old.resource_version(), body)))
}

/// Write `new`'s status over `old`'s; returns `old` unchanged if equal
pub async fn patch_claim_status(
    kube: &dyn ResizeKubeClient,
    old: &PersistentVolumeClaim,
    new: &PersistentVolumeClaim,
) -> Result<PersistentVolumeClaim> {
    let namespace = old.namespace().unwrap_or_default();
    let name = old.name_any();
    match claim_status_patch(old, new)? {
        Some(patch) => {
            debug!(claim = %format!("{namespace}/{name}"), "Patching claim status");
            kube.patch_claim_status(&namespace, &name, &patch).await
        }
        None => Ok(old.clone()),
    }
}

/// Raise the volume's declared capacity to `new_size`
///
/// Never lowers capacity: if the volume already declares at least
/// `new_size`, nothing is sent and `old` is returned.
pub async fn patch_volume_capacity(
    kube: &dyn ResizeKubeClient,
    old: &PersistentVolume,
    new_size: &Quantity,
) -> Result<PersistentVolume> {
    let current = storage_size(old.spec.as_ref().and_then(|s| s.capacity.as_ref()))?;
    if current >= StorageSize::from_quantity(new_size)? {
        debug!(volume = %old.name_any(), %current, "Volume already declares the new size");
        return Ok(old.clone());
    }

    let mut new = old.clone();
    new.spec
        .get_or_insert_with(Default::default)
        .capacity
        .get_or_insert_with(Default::default)
        .insert(RESOURCE_STORAGE.to_string(), new_size.clone());

    match volume_capacity_patch(old, &new)? {
        Some(patch) => {
            debug!(volume = %old.name_any(), size = %new_size.0, "Patching volume capacity");
            kube.patch_volume(&old.name_any(), &patch).await
        }
        None => Ok(old.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimCondition, PersistentVolumeClaimStatus, PersistentVolumeSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn claim(capacity: &str, conditions: Vec<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some("apps".to_string()),
                name: Some("data".to_string()),
                resource_version: Some("41".to_string()),
                ..Default::default()
            },
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                capacity: Some(BTreeMap::from([(
                    RESOURCE_STORAGE.to_string(),
                    Quantity(capacity.to_string()),
                )])),
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|t| PersistentVolumeClaimCondition {
                            type_: t.to_string(),
                            status: "True".to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn volume(capacity: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-data".to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(BTreeMap::from([(
                    RESOURCE_STORAGE.to_string(),
                    Quantity(capacity.to_string()),
                )])),
                storage_class_name: Some("standard".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn diff_of_equal_values_is_none() {
        let v = json!({"a": 1, "b": [1, 2]});
        assert_eq!(merge_patch_diff(&v, &v), None);
    }

    #[test]
    fn diff_nulls_removed_keys_and_replaces_arrays() {
        let old = json!({"keep": 1, "gone": true, "list": [1, 2], "nested": {"x": 1, "y": 2}});
        let new = json!({"keep": 1, "list": [1], "nested": {"x": 1, "y": 3}, "added": "z"});
        let diff = merge_patch_diff(&old, &new).unwrap();
        assert_eq!(
            diff,
            json!({"gone": null, "list": [1], "nested": {"y": 3}, "added": "z"})
        );

        let mut patched = old.clone();
        json_patch::merge(&mut patched, &diff);
        assert_eq!(patched, new);
    }

    #[test]
    fn claim_patch_carries_resource_version_and_only_changed_fields() {
        let old = claim("5Gi", vec!["Resizing"]);
        let new = claim("10Gi", vec![]);
        let patch = claim_status_patch(&old, &new).unwrap().unwrap();

        assert_eq!(patch["metadata"]["resourceVersion"], "41");
        assert!(patch["status"].get("phase").is_none());

        let mut status = serde_json::to_value(&old.status).unwrap();
        json_patch::merge(&mut status, &patch["status"]);
        assert_eq!(status, serde_json::to_value(&new.status).unwrap());
    }

    #[test]
    fn unchanged_claim_produces_no_patch() {
        let old = claim("5Gi", vec!["Resizing"]);
        assert!(claim_status_patch(&old, &old.clone()).unwrap().is_none());
    }

    #[tokio::test]
    async fn unchanged_claim_sends_nothing() {
        let mut kube = MockResizeKubeClient::new();
        kube.expect_patch_claim_status().never();

        let old = claim("5Gi", vec![]);
        let result = patch_claim_status(&kube, &old, &old.clone()).await.unwrap();
        assert_eq!(result, old);
    }

    #[tokio::test]
    async fn conflict_from_server_surfaces_as_conflict() {
        let mut kube = MockResizeKubeClient::new();
        kube.expect_patch_claim_status()
            .withf(|ns, name, _| ns == "apps" && name == "data")
            .returning(|ns, name, _| {
                Err(Error::conflict(CLAIM_KIND, format!("{ns}/{name}"), "object modified"))
            });

        let err = patch_claim_status(&kube, &claim("5Gi", vec![]), &claim("10Gi", vec![]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn volume_capacity_is_raised() {
        let mut kube = MockResizeKubeClient::new();
        kube.expect_patch_volume()
            .withf(|name, patch| {
                name == "pv-data"
                    && patch["spec"]["capacity"]["storage"] == "10Gi"
                    && patch["metadata"]["resourceVersion"] == "7"
                    && patch["spec"].get("storageClassName").is_none()
            })
            .times(1)
            .returning(|_, _| Ok(volume("10Gi")));

        let updated = patch_volume_capacity(&kube, &volume("5Gi"), &Quantity("10Gi".to_string()))
            .await
            .unwrap();
        assert_eq!(updated, volume("10Gi"));
    }

    #[tokio::test]
    async fn volume_capacity_is_never_lowered() {
        let mut kube = MockResizeKubeClient::new();
        kube.expect_patch_volume().never();

        let old = volume("20Gi");
        let updated = patch_volume_capacity(&kube, &old, &Quantity("10Gi".to_string()))
            .await
            .unwrap();
        assert_eq!(updated, old);

        // same size in a different notation is not a change either
        let old = volume("1Gi");
        let updated = patch_volume_capacity(&kube, &old, &Quantity("1073741824".to_string()))
            .await
            .unwrap();
        assert_eq!(updated, old);
    }
}
