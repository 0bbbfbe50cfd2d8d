//! Name resolution per kind
//!
//! A [`Mapper`] answers "which host object belongs to this virtual object"
//! and the reverse. [`GenericMapper`] derives answers from a translator and
//! the store; [`Recorder`] wraps any mapper and writes every resolved pair
//! into the store so later lookups (and other replicas) see it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use vsync_common::{
    Error, KindedKey, NameMapping, ObjectClient, ObjectKey, ResourceKind, Result, SyncObject,
};
use vsync_translate::Translator;

use crate::store::Store;

/// Bidirectional name resolution for kind `K`.
///
/// `belongs_to` names the mapping being reconciled when the lookup happens
/// on its behalf (a pod resolving its secret); recorders attach the
/// resolved pair to it as a reference.
#[async_trait]
pub trait Mapper<K: SyncObject>: Send + Sync {
    /// Kind descriptor
    fn kind(&self) -> &ResourceKind;

    /// Record pairs for objects that existed before the store did
    async fn migrate(
        &self,
        _virtual_client: &dyn ObjectClient<K>,
        _host_client: &dyn ObjectClient<K>,
        _host_namespace: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Host identity of a virtual object; empty if unknown.
    ///
    /// Fails with [`Error::NameMappingConflict`] when the identity is
    /// already paired with another object.
    async fn virtual_to_host(
        &self,
        key: &ObjectKey,
        obj: Option<&K>,
        belongs_to: Option<&NameMapping>,
    ) -> Result<ObjectKey>;

    /// Virtual identity of a host object; empty if unknown
    async fn host_to_virtual(
        &self,
        key: &ObjectKey,
        obj: Option<&K>,
        belongs_to: Option<&NameMapping>,
    ) -> Result<ObjectKey>;

    /// True if the host object belongs to this instance
    async fn is_managed(&self, host: &K) -> Result<bool>;
}

// =============================================================================
// Generic mapper
// =============================================================================

/// Mapper driven by a [`Translator`], falling back to the store
pub struct GenericMapper<K: SyncObject> {
    translator: Arc<dyn Translator<K>>,
    store: Arc<Store>,
}

impl<K: SyncObject> GenericMapper<K> {
    /// Mapper for the translator's kind
    pub fn new(translator: Arc<dyn Translator<K>>, store: Arc<Store>) -> Self {
        Self { translator, store }
    }

    /// Resolve a host key whose kind has no record by matching recorded
    /// virtual names of any kind that translate to the same host name
    async fn match_host_name(&self, key: &ObjectKey) -> ObjectKey {
        for candidate in self.store.host_to_virtual_any_kind(key).await {
            if self.translator.virtual_to_host(&candidate.key, None) == *key {
                debug!(
                    host = %key,
                    virtual_key = %candidate.key,
                    recorded_kind = %candidate.gvk,
                    "Resolved host object by name"
                );
                return candidate.key;
            }
        }
        ObjectKey::default()
    }
}

#[async_trait]
impl<K: SyncObject> Mapper<K> for GenericMapper<K> {
    fn kind(&self) -> &ResourceKind {
        self.translator.kind()
    }

    async fn virtual_to_host(
        &self,
        key: &ObjectKey,
        obj: Option<&K>,
        _belongs_to: Option<&NameMapping>,
    ) -> Result<ObjectKey> {
        Ok(self.translator.virtual_to_host(key, obj))
    }

    async fn host_to_virtual(
        &self,
        key: &ObjectKey,
        obj: Option<&K>,
        _belongs_to: Option<&NameMapping>,
    ) -> Result<ObjectKey> {
        if key.is_empty() {
            return Ok(ObjectKey::default());
        }
        if let Some(virtual_key) = obj.and_then(|h| self.translator.host_to_virtual_by_annotations(h))
        {
            return Ok(virtual_key);
        }

        let host = KindedKey::new(self.kind().gvk.clone(), key.clone());
        if let Some(virtual_key) = self.store.host_to_virtual_name(&host).await {
            return Ok(virtual_key);
        }
        Ok(self.match_host_name(key).await)
    }

    async fn is_managed(&self, host: &K) -> Result<bool> {
        Ok(self.translator.is_managed(host))
    }
}

// =============================================================================
// Recorder
// =============================================================================

/// Mapper decorator that consults the store first and records every resolved pair
pub struct Recorder<K: SyncObject> {
    inner: Arc<dyn Mapper<K>>,
    store: Arc<Store>,
}

impl<K: SyncObject> Recorder<K> {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn Mapper<K>>, store: Arc<Store>) -> Self {
        Self { inner, store }
    }

    /// Store a resolved pair under `belongs_to`, or as its own owner
    async fn record(&self, pair: NameMapping, belongs_to: Option<&NameMapping>) -> Result<()> {
        if !pair.is_complete() {
            return Ok(());
        }
        let owner = belongs_to.unwrap_or(&pair);
        self.store.add_reference_and_save(&pair, owner).await
    }

    /// Record a pair found during migration; conflicting pairs are left
    /// for the reconciler to report
    async fn migrate_pair(&self, pair: NameMapping) -> Result<()> {
        match self.store.add_reference_and_save(&pair, &pair).await {
            Ok(()) => Ok(()),
            Err(e @ Error::NameMappingConflict { .. }) => {
                warn!(error = %e, kind = %self.kind(), "Skipping conflicting name mapping");
                Ok(())
            }
            Err(e) => Err(Error::backend(format!("migrate {pair}: {e}"))),
        }
    }

    async fn migrate_host_objects(
        &self,
        host_client: &dyn ObjectClient<K>,
        host_namespace: &str,
    ) -> Result<()> {
        let gvk = &self.kind().gvk;
        for host in host_client.list(host_namespace).await? {
            let host_key = ObjectKey::of(&host);
            if self
                .store
                .has_host_object(&KindedKey::new(gvk.clone(), host_key.clone()))
                .await
            {
                continue;
            }
            if !self.inner.is_managed(&host).await? {
                continue;
            }

            let virtual_key = self.inner.host_to_virtual(&host_key, Some(&host), None).await?;
            if virtual_key.is_empty() {
                continue;
            }
            self.migrate_pair(NameMapping::new(gvk.clone(), virtual_key, host_key))
                .await?;
        }
        Ok(())
    }

    async fn migrate_virtual_objects(&self, virtual_client: &dyn ObjectClient<K>) -> Result<()> {
        let gvk = &self.kind().gvk;
        for obj in virtual_client.list("").await? {
            let virtual_key = ObjectKey::of(&obj);
            if self
                .store
                .has_virtual_object(&KindedKey::new(gvk.clone(), virtual_key.clone()))
                .await
            {
                continue;
            }

            let host_key = self.inner.virtual_to_host(&virtual_key, Some(&obj), None).await?;
            if host_key.is_empty() {
                continue;
            }
            self.migrate_pair(NameMapping::new(gvk.clone(), virtual_key, host_key))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<K: SyncObject> Mapper<K> for Recorder<K> {
    fn kind(&self) -> &ResourceKind {
        self.inner.kind()
    }

    async fn migrate(
        &self,
        virtual_client: &dyn ObjectClient<K>,
        host_client: &dyn ObjectClient<K>,
        host_namespace: &str,
    ) -> Result<()> {
        self.migrate_host_objects(host_client, host_namespace).await?;
        self.migrate_virtual_objects(virtual_client).await?;
        info!(kind = %self.kind(), "Migrated name mappings");
        self.inner
            .migrate(virtual_client, host_client, host_namespace)
            .await
    }

    async fn virtual_to_host(
        &self,
        key: &ObjectKey,
        obj: Option<&K>,
        belongs_to: Option<&NameMapping>,
    ) -> Result<ObjectKey> {
        if key.is_empty() {
            return Ok(ObjectKey::default());
        }
        let gvk = self.kind().gvk.clone();

        let virtual_object = KindedKey::new(gvk.clone(), key.clone());
        let host_key = match self.store.virtual_to_host_name(&virtual_object).await {
            Some(host_key) => host_key,
            None => self.inner.virtual_to_host(key, obj, belongs_to).await?,
        };
        if host_key.is_empty() {
            return Ok(host_key);
        }
        self.record(NameMapping::new(gvk, key.clone(), host_key.clone()), belongs_to)
            .await?;
        Ok(host_key)
    }

    async fn host_to_virtual(
        &self,
        key: &ObjectKey,
        obj: Option<&K>,
        belongs_to: Option<&NameMapping>,
    ) -> Result<ObjectKey> {
        if key.is_empty() {
            return Ok(ObjectKey::default());
        }
        let gvk = self.kind().gvk.clone();

        let host_object = KindedKey::new(gvk.clone(), key.clone());
        let virtual_key = match self.store.host_to_virtual_name(&host_object).await {
            Some(virtual_key) => virtual_key,
            None => self.inner.host_to_virtual(key, obj, belongs_to).await?,
        };
        if virtual_key.is_empty() {
            return Ok(virtual_key);
        }
        self.record(NameMapping::new(gvk, virtual_key.clone(), key.clone()), belongs_to)
            .await?;
        Ok(virtual_key)
    }

    async fn is_managed(&self, host: &K) -> Result<bool> {
        let host_object = KindedKey::new(self.kind().gvk.clone(), ObjectKey::of(host));
        if self.store.has_host_object(&host_object).await {
            return Ok(true);
        }
        self.inner.is_managed(host).await
    }
}
