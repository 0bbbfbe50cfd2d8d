//! In-memory cluster used by scenario tests
//!
//! [`MemoryClient`] behaves like a single-kind API server: it assigns UIDs
//! and resource versions, enforces optimistic concurrency on update, keeps
//! objects with finalizers in a terminating state on delete, and records
//! every write so tests can assert that a second pass made none.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;

use crate::client::ObjectClient;
use crate::object::{ObjectKey, SyncObject};
use crate::Result;

/// A write observed by a [`MemoryClient`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// Object created
    Create(ObjectKey),
    /// Object replaced
    Update(ObjectKey),
    /// Status written
    UpdateStatus(ObjectKey),
    /// Object deleted (or marked terminating)
    Delete(ObjectKey),
}

/// Fake single-kind cluster
pub struct MemoryClient<K> {
    objects: Mutex<BTreeMap<ObjectKey, K>>,
    writes: Mutex<Vec<WriteOp>>,
    next_version: AtomicU64,
}

impl<K: SyncObject> Default for MemoryClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn api_error(code: u16, reason: &str, message: String) -> crate::Error {
    crate::Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

impl<K: SyncObject> MemoryClient<K> {
    /// Empty cluster
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            next_version: AtomicU64::new(1),
        }
    }

    /// Cluster pre-populated with objects; no writes are recorded for them
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let client = Self::new();
        for obj in objects {
            client.insert(obj);
        }
        client
    }

    /// Store an object as-is, assigning a resource version
    pub fn insert(&self, mut obj: K) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        obj.meta_mut().resource_version = Some(version.to_string());
        self.lock().insert(ObjectKey::of(&obj), obj);
    }

    /// Current copy of an object
    pub fn object(&self, key: &ObjectKey) -> Option<K> {
        self.lock().get(key).cloned()
    }

    /// All stored objects in key order
    pub fn objects(&self) -> Vec<K> {
        self.lock().values().cloned().collect()
    }

    /// Writes performed through the [`ObjectClient`] interface
    pub fn writes(&self) -> Vec<WriteOp> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.clear();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ObjectKey, K>> {
        // A poisoned lock only happens after a panicking test
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, op: WriteOp) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(op);
        }
    }

    fn bump(&self, obj: &mut K) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        obj.meta_mut().resource_version = Some(version.to_string());
    }

    fn replace(&self, obj: &K, op: WriteOp) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock();
        let Some(existing) = objects.get(&key) else {
            return Err(api_error(404, "NotFound", format!("{key} not found")));
        };

        let requested = obj.meta().resource_version.as_deref();
        if requested.is_some() && requested != existing.meta().resource_version.as_deref() {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object {key} has been modified"),
            ));
        }

        let mut stored = obj.clone();
        stored.meta_mut().uid = existing.meta().uid.clone();
        stored.meta_mut().creation_timestamp = existing.meta().creation_timestamp.clone();
        stored.meta_mut().deletion_timestamp = existing.meta().deletion_timestamp.clone();
        self.bump(&mut stored);

        let finished = stored.meta().deletion_timestamp.is_some()
            && stored.meta().finalizers.as_ref().map_or(true, |f| f.is_empty());
        if finished {
            objects.remove(&key);
        } else {
            objects.insert(key, stored.clone());
        }
        drop(objects);

        self.record(op);
        Ok(stored)
    }
}

#[async_trait]
impl<K: SyncObject> ObjectClient<K> for MemoryClient<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        Ok(self.object(key))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        Ok(self
            .lock()
            .iter()
            .filter(|(key, _)| namespace.is_empty() || key.namespace == namespace)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock();
        if objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{key} already exists"),
            ));
        }

        let mut stored = obj.clone();
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let meta = stored.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        meta.resource_version = Some(version.to_string());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        objects.insert(key.clone(), stored.clone());
        drop(objects);

        self.record(WriteOp::Create(key));
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.replace(obj, WriteOp::Update(ObjectKey::of(obj)))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        self.replace(obj, WriteOp::UpdateStatus(ObjectKey::of(obj)))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let mut objects = self.lock();
        let Some(existing) = objects.get_mut(key) else {
            return Ok(false);
        };

        let has_finalizers = existing
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if existing.meta().deletion_timestamp.is_none() {
                existing.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
                let version = self.next_version.fetch_add(1, Ordering::SeqCst);
                existing.meta_mut().resource_version = Some(version.to_string());
            }
        } else {
            objects.remove(key);
        }
        drop(objects);

        self.record(WriteOp::Delete(key.clone()));
        Ok(true)
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

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let client = MemoryClient::<Secret>::new();
        let created = client.create(&secret("a")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());

        let err = client.create(&secret("a")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(client.writes(), vec![WriteOp::Create(ObjectKey::new("default", "a"))]);
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let client = MemoryClient::with_objects([secret("a")]);
        let key = ObjectKey::new("default", "a");
        let current = client.get(&key).await.unwrap().unwrap();

        client.update(&current).await.unwrap();
        let err = client.update(&current).await.unwrap_err();
        assert!(err.is_write_conflict());
    }

    #[tokio::test]
    async fn finalizers_keep_deleted_objects_terminating() {
        let mut obj = secret("a");
        obj.metadata.finalizers = Some(vec!["example.com/guard".to_string()]);
        let client = MemoryClient::with_objects([obj]);
        let key = ObjectKey::new("default", "a");

        assert!(client.delete(&key).await.unwrap());
        let mut terminating = client.object(&key).unwrap();
        assert!(terminating.metadata.deletion_timestamp.is_some());

        terminating.metadata.finalizers = None;
        client.update(&terminating).await.unwrap();
        assert!(client.object(&key).is_none());
    }
}
