//! Last-seen object cache
//!
//! With object caching enabled the controller remembers both sides after
//! every successful pass. A later pass that fetches an older resource
//! version than the remembered one is acting on a stale read and requeues.

use dashmap::DashMap;

use vsync_common::kube_utils::newer_resource_version;
use vsync_common::{ObjectKey, SyncObject};

/// Which cluster an object was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The virtual cluster
    Virtual,
    /// The host cluster
    Host,
}

/// Objects observed by the last successful pass, per side and key
pub struct ObjectCache<K> {
    objects: DashMap<(Side, ObjectKey), K>,
}

impl<K: SyncObject> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }
}

impl<K: SyncObject> ObjectCache<K> {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a newer version than `fetched` was seen before
    pub fn is_stale(&self, side: Side, key: &ObjectKey, fetched: Option<&K>) -> bool {
        let Some(fetched) = fetched else {
            return false;
        };
        self.objects
            .get(&(side, key.clone()))
            .is_some_and(|cached| newer_resource_version(cached.value(), fetched))
    }

    /// Remember an observation; `None` forgets the key
    pub fn remember(&self, side: Side, key: &ObjectKey, obj: Option<&K>) {
        match obj {
            Some(obj) => {
                self.objects.insert((side, key.clone()), obj.clone());
            }
            None => {
                self.objects.remove(&(side, key.clone()));
            }
        }
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    fn secret(version: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("a".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn older_reads_are_stale() {
        let cache = ObjectCache::new();
        let key = ObjectKey::new("default", "a");
        cache.remember(Side::Virtual, &key, Some(&secret("5")));

        assert!(cache.is_stale(Side::Virtual, &key, Some(&secret("4"))));
        assert!(!cache.is_stale(Side::Virtual, &key, Some(&secret("5"))));
        assert!(!cache.is_stale(Side::Virtual, &key, Some(&secret("6"))));
        assert!(!cache.is_stale(Side::Host, &key, Some(&secret("1"))));
        assert!(!cache.is_stale(Side::Virtual, &key, None));

        cache.remember(Side::Virtual, &key, None);
        assert!(cache.is_empty());
    }
}
