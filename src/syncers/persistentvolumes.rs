//! Fake persistent volumes
//!
//! Claims in the virtual cluster are bound to volumes that only exist on the
//! host. A placeholder volume with the bound name is kept in the virtual
//! cluster while any claim refers to it, so the virtual control plane sees
//! a consistent binding.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    FlexPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec, PersistentVolumeStatus,
};
use kube::api::ObjectMeta;
use kube::{Api, Client};
use tracing::info;

use vsync_common::{ObjectClient, ObjectKey, Result};
use vsync_syncer::{FakeSyncer, Request, WatchSources};

/// Synchronizer name
pub const NAME: &str = "fake-persistentvolume";

/// Marks placeholder volumes
pub const FAKE_PV_LABEL: &str = "vcluster.loft.sh/fake-pv";

const CREATED_BY_ANNOTATION: &str = "kubernetes.io/createdby";
const CREATED_BY: &str = "fake-pv-provisioner";
const BOUND_BY_CONTROLLER_ANNOTATION: &str = "pv.kubernetes.io/bound-by-controller";
const FAKE_DRIVER: &str = "fake";

/// Keeps a placeholder volume for every volume name a virtual claim is bound to
pub struct FakePersistentVolumeSyncer {
    claims: Arc<dyn ObjectClient<PersistentVolumeClaim>>,
}

impl FakePersistentVolumeSyncer {
    /// Syncer reading claims through `claims` (the virtual cluster)
    pub fn new(claims: Arc<dyn ObjectClient<PersistentVolumeClaim>>) -> Self {
        Self { claims }
    }

    async fn bound_claim(&self, volume: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .claims
            .list("")
            .await?
            .into_iter()
            .find(|claim| bound_volume(claim) == Some(volume)))
    }
}

fn bound_volume(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|name| !name.is_empty())
}

fn placeholder(name: &str, claim: Option<&PersistentVolumeClaim>) -> PersistentVolume {
    let claim_spec = claim.and_then(|c| c.spec.as_ref());
    let capacity = claim_spec
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.clone());

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                FAKE_PV_LABEL.to_string(),
                "true".to_string(),
            )])),
            annotations: Some(BTreeMap::from([
                (CREATED_BY_ANNOTATION.to_string(), CREATED_BY.to_string()),
                (BOUND_BY_CONTROLLER_ANNOTATION.to_string(), "true".to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity,
            access_modes: claim_spec.and_then(|spec| spec.access_modes.clone()),
            storage_class_name: claim_spec.and_then(|spec| spec.storage_class_name.clone()),
            volume_mode: claim_spec.and_then(|spec| spec.volume_mode.clone()),
            claim_ref: claim.map(|c| ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                name: c.metadata.name.clone(),
                namespace: c.metadata.namespace.clone(),
                uid: c.metadata.uid.clone(),
                resource_version: c.metadata.resource_version.clone(),
                ..Default::default()
            }),
            flex_volume: Some(FlexPersistentVolumeSource {
                driver: FAKE_DRIVER.to_string(),
                ..Default::default()
            }),
            persistent_volume_reclaim_policy: Some("Delete".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

#[async_trait]
impl FakeSyncer<PersistentVolume> for FakePersistentVolumeSyncer {
    fn name(&self) -> &str {
        NAME
    }

    fn new_object(&self, key: &ObjectKey) -> PersistentVolume {
        placeholder(&key.name, None)
    }

    fn is_fake(&self, obj: &PersistentVolume) -> bool {
        obj.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(FAKE_PV_LABEL))
            .is_some_and(|v| v == "true")
    }

    async fn dependant_names(&self) -> Result<Vec<ObjectKey>> {
        let mut names: Vec<ObjectKey> = self
            .claims
            .list("")
            .await?
            .iter()
            .filter_map(bound_volume)
            .map(ObjectKey::cluster)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn create_needed(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.bound_claim(&key.name).await?.is_some())
    }

    async fn create(&self, client: &dyn ObjectClient<PersistentVolume>, key: &ObjectKey) -> Result<()> {
        let claim = self.bound_claim(&key.name).await?;
        info!(volume = %key, "Create fake persistent volume");
        let mut created = client.create(&placeholder(&key.name, claim.as_ref())).await?;
        created.status = Some(PersistentVolumeStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        client.update_status(&created).await?;
        Ok(())
    }
}

/// Requeue the bound volume name whenever a virtual claim changes
pub fn claim_watch(virtual_client: Client) -> WatchSources {
    let mut sources = WatchSources::new();
    sources.watch_related(
        Api::<PersistentVolumeClaim>::all(virtual_client),
        |claim: &PersistentVolumeClaim| {
            bound_volume(claim)
                .map(|name| vec![Request::Virtual(ObjectKey::cluster(name))])
                .unwrap_or_default()
        },
    );
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use vsync_common::testing::{MemoryClient, WriteOp};
    use vsync_syncer::FakeSyncController;

    fn claim(name: &str, volume: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("{name}-uid")),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some(volume.to_string()),
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("5Gi".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct Clusters {
        claims: Arc<MemoryClient<PersistentVolumeClaim>>,
        volumes: Arc<MemoryClient<PersistentVolume>>,
        controller: FakeSyncController<PersistentVolume>,
    }

    fn clusters(claims: Vec<PersistentVolumeClaim>) -> Clusters {
        let claims = Arc::new(MemoryClient::with_objects(claims));
        let volumes = Arc::new(MemoryClient::new());
        let syncer = Arc::new(FakePersistentVolumeSyncer::new(claims.clone()));
        Clusters {
            controller: FakeSyncController::new(syncer, volumes.clone()),
            claims,
            volumes,
        }
    }

    fn request(name: &str) -> Request {
        Request::Virtual(ObjectKey::cluster(name))
    }

    // =========================================================================
    // Story Tests: placeholder volumes
    // =========================================================================

    /// Story: a bound claim gets a placeholder, deleting the claim removes it
    #[tokio::test]
    async fn story_bound_claim_gets_placeholder_volume() {
        let c = clusters(vec![claim("data", "pvc-123")]);
        let key = ObjectKey::cluster("pvc-123");

        c.controller.reconcile(request("pvc-123")).await.unwrap();
        let volume = c.volumes.object(&key).expect("placeholder volume");
        let annotations = volume.metadata.annotations.clone().unwrap();
        assert_eq!(annotations[CREATED_BY_ANNOTATION], CREATED_BY);
        assert_eq!(annotations[BOUND_BY_CONTROLLER_ANNOTATION], "true");
        assert_eq!(volume.metadata.labels.unwrap()[FAKE_PV_LABEL], "true");
        let spec = volume.spec.unwrap();
        assert_eq!(spec.capacity.unwrap()["storage"], Quantity("5Gi".to_string()));
        assert_eq!(spec.claim_ref.unwrap().name.as_deref(), Some("data"));
        assert_eq!(volume.status.unwrap().phase.as_deref(), Some("Bound"));

        c.claims
            .delete(&ObjectKey::new("default", "data"))
            .await
            .unwrap();
        c.volumes.clear_writes();
        c.controller.reconcile(request("pvc-123")).await.unwrap();
        assert_eq!(c.volumes.writes(), vec![WriteOp::Delete(key.clone())]);
        assert!(c.volumes.object(&key).is_none());
    }

    #[tokio::test]
    async fn real_volumes_are_left_alone() {
        let c = clusters(Vec::new());
        c.volumes.insert(PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pvc-real".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        c.controller.reconcile(request("pvc-real")).await.unwrap();
        assert!(c.volumes.writes().is_empty());
    }

    #[tokio::test]
    async fn dependant_names_are_unique_bound_volumes() {
        let c = clusters(vec![claim("a", "pvc-1"), claim("b", "pvc-1"), claim("pending", "")]);
        let syncer = FakePersistentVolumeSyncer::new(c.claims.clone());

        assert_eq!(
            syncer.dependant_names().await.unwrap(),
            vec![ObjectKey::cluster("pvc-1")]
        );
    }
}
