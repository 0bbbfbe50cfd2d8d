//! Object existence checks used by mapping garbage collection

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(any(test, feature = "testing"))]
use mockall::automock;
use tracing::debug;

use vsync_common::{GroupVersionKind, KindedKey, Result, SyncObject};

/// Answers whether the objects a mapping points at still exist
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ObjectExistence: Send + Sync {
    /// True if the object exists in the virtual cluster
    async fn virtual_exists(&self, object: &KindedKey) -> Result<bool>;

    /// True if the object exists in the host cluster
    async fn host_exists(&self, object: &KindedKey) -> Result<bool>;
}

/// [`ObjectExistence`] backed by the virtual and host API servers.
///
/// Only registered kinds are checked; objects of unknown kinds are reported
/// as existing so their mappings are never collected by mistake.
pub struct KubeObjectExistence {
    virtual_client: Client,
    host_client: Client,
    resources: HashMap<GroupVersionKind, ApiResource>,
}

impl KubeObjectExistence {
    /// Checker without registered kinds
    pub fn new(virtual_client: Client, host_client: Client) -> Self {
        Self {
            virtual_client,
            host_client,
            resources: HashMap::new(),
        }
    }

    /// Register kind `K`
    pub fn register<K: SyncObject>(mut self) -> Self {
        self.resources
            .insert(GroupVersionKind::of::<K>(), ApiResource::erase::<K>(&()));
        self
    }

    async fn exists(&self, client: &Client, object: &KindedKey) -> Result<bool> {
        let Some(resource) = self.resources.get(&object.gvk) else {
            debug!(object = %object, "Kind not registered for existence checks, keeping mapping");
            return Ok(true);
        };
        let api: Api<DynamicObject> = match object.key.namespace() {
            Some(ns) => Api::namespaced_with(client.clone(), ns, resource),
            None => Api::all_with(client.clone(), resource),
        };
        Ok(api.get_opt(&object.key.name).await?.is_some())
    }
}

#[async_trait]
impl ObjectExistence for KubeObjectExistence {
    async fn virtual_exists(&self, object: &KindedKey) -> Result<bool> {
        self.exists(&self.virtual_client, object).await
    }

    async fn host_exists(&self, object: &KindedKey) -> Result<bool> {
        self.exists(&self.host_client, object).await
    }
}
