//! In-memory stand-ins for the cluster used by unit tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimCondition,
    PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeSpec,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::Resource;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use resizer_common::events::EventPublisher;
use resizer_common::quantity::RESOURCE_STORAGE;
use resizer_common::{Error, Result};

use crate::cache::ObjectCache;
use crate::controller::Context;
use crate::key::ClaimKey;
use crate::patch::ResizeKubeClient;
use crate::resizer::{MockResizer, ResizeOutcome};

/// Cache whose contents are written directly by the test
#[derive(Default)]
pub(crate) struct InMemoryCache {
    claims: RwLock<BTreeMap<ClaimKey, Arc<PersistentVolumeClaim>>>,
    volumes: RwLock<BTreeMap<String, Arc<PersistentVolume>>>,
    synced: bool,
}

impl InMemoryCache {
    pub(crate) fn synced() -> Self {
        Self {
            synced: true,
            ..Default::default()
        }
    }

    pub(crate) fn put_claim(&self, claim: PersistentVolumeClaim) {
        let key = ClaimKey::from_claim(&claim).expect("claim has namespace and name");
        self.claims.write().unwrap().insert(key, Arc::new(claim));
    }

    pub(crate) fn put_volume(&self, volume: PersistentVolume) {
        let name = volume.metadata.name.clone().expect("volume has a name");
        self.volumes.write().unwrap().insert(name, Arc::new(volume));
    }
}

#[async_trait]
impl ObjectCache for InMemoryCache {
    fn get_claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims
            .read()
            .unwrap()
            .get(&ClaimKey::new(namespace, name))
            .cloned()
    }

    fn get_volume(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.volumes.read().unwrap().get(name).cloned()
    }

    fn list_claims(&self) -> Vec<Arc<PersistentVolumeClaim>> {
        self.claims.read().unwrap().values().cloned().collect()
    }

    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        if self.synced {
            return true;
        }
        shutdown.cancelled().await;
        false
    }
}

/// API server stand-in: applies merge patches to an object store and
/// enforces the resourceVersion precondition
#[derive(Default)]
pub(crate) struct FakeApiServer {
    pub(crate) claims: Mutex<BTreeMap<String, PersistentVolumeClaim>>,
    pub(crate) volumes: Mutex<BTreeMap<String, PersistentVolume>>,
    pub(crate) patches: Mutex<Vec<(String, Value)>>,
}

fn apply<T>(current: &T, patch: &Value, kind: &str, key: &str) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Resource,
{
    let current_rv = current.meta().resource_version.clone();
    if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
        if current_rv.as_deref() != Some(expected) {
            return Err(Error::conflict(kind, key, "the object has been modified"));
        }
    }
    let mut doc = serde_json::to_value(current)?;
    json_patch::merge(&mut doc, patch);
    let next_rv = current_rv
        .and_then(|rv| rv.parse::<u64>().ok())
        .map_or(1, |rv| rv + 1);
    doc["metadata"]["resourceVersion"] = Value::String(next_rv.to_string());
    Ok(serde_json::from_value(doc)?)
}

#[async_trait]
impl ResizeKubeClient for FakeApiServer {
    async fn patch_claim_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<PersistentVolumeClaim> {
        let key = format!("{namespace}/{name}");
        self.patches.lock().unwrap().push((key.clone(), patch.clone()));
        let mut claims = self.claims.lock().unwrap();
        let current = claims
            .get(&key)
            .ok_or_else(|| Error::not_found("PersistentVolumeClaim", key.clone()))?;
        let updated = apply(current, patch, "PersistentVolumeClaim", &key)?;
        claims.insert(key, updated.clone());
        Ok(updated)
    }

    async fn patch_volume(&self, name: &str, patch: &Value) -> Result<PersistentVolume> {
        self.patches
            .lock()
            .unwrap()
            .push((name.to_string(), patch.clone()));
        let mut volumes = self.volumes.lock().unwrap();
        let current = volumes
            .get(name)
            .ok_or_else(|| Error::not_found("PersistentVolume", name))?;
        let updated = apply(current, patch, "PersistentVolume", name)?;
        volumes.insert(name.to_string(), updated.clone());
        Ok(updated)
    }
}

/// Keeps every published event
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    pub(crate) events: Mutex<Vec<(EventType, String, Option<String>)>>,
}

impl RecordingPublisher {
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r, _)| r.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((type_, reason.to_string(), note));
    }
}

pub(crate) fn storage(q: &str) -> Option<BTreeMap<String, Quantity>> {
    Some(BTreeMap::from([(
        RESOURCE_STORAGE.to_string(),
        Quantity(q.to_string()),
    )]))
}

pub(crate) fn storage_of(map: Option<&BTreeMap<String, Quantity>>) -> String {
    map.and_then(|m| m.get(RESOURCE_STORAGE))
        .map(|q| q.0.clone())
        .unwrap_or_default()
}

/// Bound claim `apps/data` on volume `pv-data`
pub(crate) fn claim(
    requested: &str,
    actual: &str,
    conditions: Vec<PersistentVolumeClaimCondition>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            namespace: Some("apps".to_string()),
            name: Some("data".to_string()),
            uid: Some("claim-uid".to_string()),
            resource_version: Some("10".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some("pv-data".to_string()),
            storage_class_name: Some("standard".to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: storage(requested),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            capacity: storage(actual),
            conditions: (!conditions.is_empty()).then_some(conditions),
            ..Default::default()
        }),
    }
}

/// Volume `pv-data`
pub(crate) fn volume(capacity: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some("pv-data".to_string()),
            resource_version: Some("20".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: storage(capacity),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Resizer supporting every volume whose resize call yields `result`
pub(crate) fn resizer<F>(calls: usize, result: F) -> MockResizer
where
    F: Fn() -> Result<ResizeOutcome> + Send + 'static,
{
    let mut resizer = MockResizer::new();
    resizer.expect_can_support().return_const(true);
    resizer.expect_name().return_const("test".to_string());
    resizer
        .expect_resize()
        .times(calls)
        .returning(move |_, _| result());
    resizer
}

/// One claim and one volume, mirrored in both the cache and the API server
pub(crate) struct Harness {
    pub(crate) cache: Arc<InMemoryCache>,
    pub(crate) api: Arc<FakeApiServer>,
    pub(crate) events: Arc<RecordingPublisher>,
}

impl Harness {
    pub(crate) fn new(claim: PersistentVolumeClaim, volume: PersistentVolume) -> Self {
        let cache = Arc::new(InMemoryCache::synced());
        let api = Arc::new(FakeApiServer::default());
        api.claims
            .lock()
            .unwrap()
            .insert("apps/data".to_string(), claim.clone());
        api.volumes
            .lock()
            .unwrap()
            .insert("pv-data".to_string(), volume.clone());
        cache.put_claim(claim);
        cache.put_volume(volume);
        Self {
            cache,
            api,
            events: Arc::new(RecordingPublisher::default()),
        }
    }

    pub(crate) fn context(&self, resizer: MockResizer) -> Context {
        Context::new(
            self.cache.clone(),
            self.api.clone(),
            Arc::new(resizer),
            self.events.clone(),
        )
    }

    /// Copy API server state into the cache, as the watchers would
    pub(crate) fn sync_cache(&self) {
        for claim in self.api.claims.lock().unwrap().values() {
            self.cache.put_claim(claim.clone());
        }
        for volume in self.api.volumes.lock().unwrap().values() {
            self.cache.put_volume(volume.clone());
        }
    }

    pub(crate) fn claim(&self) -> PersistentVolumeClaim {
        self.api.claims.lock().unwrap()["apps/data"].clone()
    }

    pub(crate) fn volume(&self) -> PersistentVolume {
        self.api.volumes.lock().unwrap()["pv-data"].clone()
    }

    pub(crate) fn patch_count(&self) -> usize {
        self.api.patches.lock().unwrap().len()
    }
}
