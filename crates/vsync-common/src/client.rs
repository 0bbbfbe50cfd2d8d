//! Typed access to one kind on one cluster
//!
//! The engine talks to both the virtual and the host cluster through
//! [`ObjectClient`]. "Not found" is a normal answer here: `get` returns
//! `None` and `delete` returns `false` instead of an error.

use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(any(test, feature = "testing"))]
use mockall::automock;
use tracing::debug;

use crate::object::{ObjectKey, SyncObject};
use crate::{Error, Result};

/// Cluster operations the engine needs for one kind
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ObjectClient<K: SyncObject>: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// List objects in a namespace, or across all namespaces when `namespace` is empty
    async fn list(&self, namespace: &str) -> Result<Vec<K>>;

    /// Create an object, returning the stored copy
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object (spec and metadata) using its resource version
    async fn update(&self, obj: &K) -> Result<K>;

    /// Write the status subresource of an object
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Delete an object; returns false if it was already gone
    async fn delete(&self, key: &ObjectKey) -> Result<bool>;
}

/// [`ObjectClient`] backed by the Kubernetes API
///
/// Requests go through `DynamicObject` with an erased `ApiResource` so the
/// same code path serves namespaced and cluster-scoped kinds.
pub struct KubeObjectClient<K> {
    client: Client,
    resource: ApiResource,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeObjectClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            resource: self.resource.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: SyncObject> KubeObjectClient<K> {
    /// Create a client for kind `K`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: ApiResource::erase::<K>(&()),
            _kind: PhantomData,
        }
    }

    /// Dynamic API handle, scoped to `namespace` unless it is empty
    pub fn dynamic_api(&self, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &self.resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &self.resource)
        }
    }
}

/// Convert a typed object into its dynamic form
pub fn to_dynamic<K: SyncObject>(obj: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}

/// Convert a dynamic object into kind `K`
pub fn from_dynamic<K: SyncObject>(obj: DynamicObject) -> Result<K> {
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}

fn object_name<K: SyncObject>(obj: &K) -> Result<&str> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("client", "object has no name"))
}

fn object_namespace<K: SyncObject>(obj: &K) -> &str {
    obj.meta().namespace.as_deref().unwrap_or_default()
}

#[async_trait]
impl<K: SyncObject> ObjectClient<K> for KubeObjectClient<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        match self.dynamic_api(&key.namespace).get_opt(&key.name).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        let list = self
            .dynamic_api(namespace)
            .list(&Default::default())
            .await?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let created = self
            .dynamic_api(object_namespace(obj))
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await?;
        from_dynamic(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let updated = self
            .dynamic_api(object_namespace(obj))
            .replace(object_name(obj)?, &PostParams::default(), &to_dynamic(obj)?)
            .await?;
        from_dynamic(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let value = serde_json::to_value(obj)
            .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
        let Some(status) = value.get("status") else {
            return Ok(obj.clone());
        };
        let patch = serde_json::json!({ "status": status });
        let updated = self
            .dynamic_api(object_namespace(obj))
            .patch_status(object_name(obj)?, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        from_dynamic(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        match self
            .dynamic_api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(object = %key, "Object already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn dynamic_conversion_keeps_type_information() {
        let dynamic = to_dynamic(&secret("a")).unwrap();
        let types = dynamic.types.clone().unwrap();
        assert_eq!(types.kind, "Secret");
        assert_eq!(types.api_version, "v1");

        let back: Secret = from_dynamic(dynamic).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn mock_client_reports_missing_objects() {
        let mut mock = MockObjectClient::<Secret>::new();
        mock.expect_get().returning(|_| Ok(None));
        mock.expect_delete().returning(|_| Ok(false));

        let key = ObjectKey::new("default", "a");
        assert!(mock.get(&key).await.unwrap().is_none());
        assert!(!mock.delete(&key).await.unwrap());
    }
}
