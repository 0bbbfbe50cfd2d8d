//! Name mapping store
//!
//! Bidirectional index between virtual and host identities, per kind. Each
//! [`Mapping`] is owned by one virtual/host pair and may carry references:
//! further pairs discovered while reconciling the owner. Both index maps
//! point at the owning mappings so a reference disappears with its last
//! owner.
//!
//! The store never replaces an existing pair with a conflicting one; that
//! would mean two virtual objects resolve to the same host object.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vsync_common::metrics::{MAPPINGS_GC_REMOVED, MAPPINGS_TOTAL};
use vsync_common::{Error, GroupVersionKind, KindedKey, NameMapping, ObjectKey, Result};

use crate::backend::{Backend, BackendEvent, BackendEventType, Mapping};
use crate::existence::ObjectExistence;

/// Default interval between garbage collection runs
pub const GARBAGE_COLLECTION_INTERVAL: Duration = Duration::from_secs(180);

/// Delay before re-opening a backend watch that ended
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Filter applied to every mapping before it enters the store
pub type VerifyMapping = Arc<dyn Fn(&NameMapping) -> bool + Send + Sync>;

struct Entry {
    mapping: Mapping,
    changed: bool,
}

/// Index entry: the object on the other side plus the owning mappings
struct LookupName {
    object: ObjectKey,
    mappings: Vec<NameMapping>,
}

#[derive(Default)]
struct Inner {
    mappings: HashMap<NameMapping, Entry>,
    host_to_virtual: HashMap<KindedKey, LookupName>,
    virtual_to_host: HashMap<KindedKey, LookupName>,
    watches: HashMap<GroupVersionKind, Vec<mpsc::UnboundedSender<NameMapping>>>,
}

fn add_to_name_map(
    map: &mut HashMap<KindedKey, LookupName>,
    owner: &NameMapping,
    from: KindedKey,
    to: ObjectKey,
) {
    match map.get_mut(&from) {
        Some(lookup) if lookup.object == to => {
            if !lookup.mappings.contains(owner) {
                lookup.mappings.push(owner.clone());
            }
        }
        _ => {
            map.insert(
                from,
                LookupName {
                    object: to,
                    mappings: vec![owner.clone()],
                },
            );
        }
    }
}

fn remove_from_name_map(
    map: &mut HashMap<KindedKey, LookupName>,
    owner: &NameMapping,
    from: &KindedKey,
) {
    if let Some(lookup) = map.get_mut(from) {
        lookup.mappings.retain(|m| m != owner);
        if lookup.mappings.is_empty() {
            map.remove(from);
        }
    }
}

impl Inner {
    fn add_name_to_maps(&mut self, owner: &NameMapping, pair: &NameMapping) {
        add_to_name_map(
            &mut self.host_to_virtual,
            owner,
            pair.host_object(),
            pair.virtual_key.clone(),
        );
        add_to_name_map(
            &mut self.virtual_to_host,
            owner,
            pair.virtual_object(),
            pair.host_key.clone(),
        );
    }

    fn remove_name_from_maps(&mut self, owner: &NameMapping, pair: &NameMapping) {
        remove_from_name_map(&mut self.host_to_virtual, owner, &pair.host_object());
        remove_from_name_map(&mut self.virtual_to_host, owner, &pair.virtual_object());
    }

    fn dispatch(&mut self, pair: &NameMapping) {
        if let Some(watches) = self.watches.get_mut(&pair.gvk) {
            watches.retain(|tx| tx.send(pair.clone()).is_ok());
        }
    }

    fn add_mapping(&mut self, entry: Entry) {
        let owner = entry.mapping.name_mapping.clone();
        let references = entry.mapping.references.clone();
        self.mappings.insert(owner.clone(), entry);

        self.add_name_to_maps(&owner, &owner);
        self.dispatch(&owner);
        for reference in &references {
            self.add_name_to_maps(&owner, reference);
            self.dispatch(reference);
        }
        MAPPINGS_TOTAL.record(self.mappings.len() as i64, &[]);
    }

    fn remove_mapping(&mut self, owner: &NameMapping) -> Option<Mapping> {
        let entry = self.mappings.remove(owner)?;
        self.remove_name_from_maps(owner, owner);
        self.dispatch(owner);
        for reference in &entry.mapping.references {
            self.remove_name_from_maps(owner, reference);
            self.dispatch(reference);
        }
        MAPPINGS_TOTAL.record(self.mappings.len() as i64, &[]);
        Some(entry.mapping)
    }

    /// Complete key of the stored mapping matching a possibly partial mapping
    fn find_mapping(&self, mapping: &NameMapping) -> Option<NameMapping> {
        if mapping.is_empty() {
            return None;
        }

        let mut virtual_key = mapping.virtual_key.clone();
        let mut host_key = mapping.host_key.clone();
        if virtual_key.is_empty() {
            virtual_key = self.host_to_virtual.get(&mapping.host_object())?.object.clone();
        } else if host_key.is_empty() {
            host_key = self.virtual_to_host.get(&mapping.virtual_object())?.object.clone();
        }

        let key = NameMapping::new(mapping.gvk.clone(), virtual_key, host_key);
        self.mappings.contains_key(&key).then_some(key)
    }

    fn check_name_conflict(&self, mapping: &NameMapping) -> Result<()> {
        let host = mapping.host_object();
        let virt = mapping.virtual_object();

        if let Some(lookup) = self.host_to_virtual.get(&host) {
            if lookup.object != mapping.virtual_key {
                return Err(Error::name_mapping_conflict(
                    format!("{host} -> {}", lookup.object),
                    format!("{host} -> {}", mapping.virtual_key),
                ));
            }
        }
        if let Some(lookup) = self.virtual_to_host.get(&virt) {
            if lookup.object != mapping.host_key {
                return Err(Error::name_mapping_conflict(
                    format!("{virt} -> {}", lookup.object),
                    format!("{virt} -> {}", mapping.host_key),
                ));
            }
        }
        Ok(())
    }

    /// Create the owning mapping for `belongs_to`, completing a partial owner from `pair`
    fn create_mapping(&mut self, pair: &NameMapping, belongs_to: &NameMapping) {
        if belongs_to.is_empty() {
            return;
        }

        let mut virtual_key = belongs_to.virtual_key.clone();
        let mut host_key = belongs_to.host_key.clone();
        if virtual_key.is_empty() || host_key.is_empty() {
            if pair.gvk != belongs_to.gvk {
                info!(
                    owner = %belongs_to,
                    mapping = %pair,
                    "Cannot create name mapping, owner mapping is incomplete and of another kind"
                );
                return;
            }
            if virtual_key.is_empty() && host_key == pair.host_key {
                virtual_key = pair.virtual_key.clone();
            } else if host_key.is_empty() && virtual_key == pair.virtual_key {
                host_key = pair.host_key.clone();
            } else {
                return;
            }
        }

        let owner = NameMapping::new(belongs_to.gvk.clone(), virtual_key, host_key);
        info!(
            host = %owner.host_key,
            virtual_key = %owner.virtual_key,
            mapping = %pair,
            "Create name mapping"
        );
        self.add_mapping(Entry {
            mapping: Mapping::new(owner),
            changed: true,
        });
    }

    fn references_to(&self, virtual_object: &KindedKey) -> Vec<NameMapping> {
        if virtual_object.is_empty() {
            return Vec::new();
        }
        let Some(lookup) = self.virtual_to_host.get(virtual_object) else {
            return Vec::new();
        };

        let own = NameMapping::new(
            virtual_object.gvk.clone(),
            virtual_object.key.clone(),
            lookup.object.clone(),
        );
        lookup
            .mappings
            .iter()
            .filter(|m| **m != own)
            .cloned()
            .collect()
    }
}

/// Concurrent, backend-persisted name mapping store
pub struct Store {
    inner: RwLock<Inner>,
    backend: Arc<dyn Backend>,
    existence: Arc<dyn ObjectExistence>,
    verify_mapping: Option<VerifyMapping>,
    sender: String,
}

impl Store {
    /// Store persisting to `backend`; `existence` answers garbage collection lookups
    pub fn new(backend: Arc<dyn Backend>, existence: Arc<dyn ObjectExistence>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            backend,
            existence,
            verify_mapping: None,
            sender: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Drop mappings rejected by `verify` on load, on backend events and on add
    pub fn with_verify_mapping(
        mut self,
        verify: impl Fn(&NameMapping) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.verify_mapping = Some(Arc::new(verify));
        self
    }

    fn verified(&self, mapping: &NameMapping) -> bool {
        self.verify_mapping.as_ref().map_or(true, |verify| verify(mapping))
    }

    /// Load persisted mappings and follow backend changes until `cancel` fires
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let records = self.backend.list().await?;
        {
            let mut inner = self.inner.write().await;
            for record in records {
                if !self.verified(&record.name_mapping) {
                    continue;
                }
                inner.remove_mapping(&record.name_mapping);
                debug!(mapping = %record, "Add mapping");
                inner.add_mapping(Entry {
                    mapping: record,
                    changed: false,
                });
            }
        }

        let store = Arc::clone(self);
        tokio::spawn(async move { store.follow_backend(cancel).await });
        Ok(())
    }

    async fn follow_backend(&self, cancel: CancellationToken) {
        loop {
            match self.backend.watch().await {
                Ok(mut events) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        batch = events.next() => match batch {
                            Some(batch) => self.handle_events(batch).await,
                            None => break,
                        },
                    }
                },
                Err(e) => warn!(error = %e, "Failed to watch mapping backend"),
            }

            info!("Mapping store watch has ended");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
            }
        }
    }

    async fn handle_events(&self, batch: Result<Vec<BackendEvent>>) {
        let events = match batch {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Watch error in mappings store");
                return;
            }
        };

        let mut inner = self.inner.write().await;
        for event in events {
            if event.mapping.sender == self.sender {
                continue;
            }
            if event.event_type == BackendEventType::Update
                && !self.verified(&event.mapping.name_mapping)
            {
                continue;
            }

            debug!(event = ?event.event_type, mapping = %event.mapping, "Mapping store received event");
            if let Some(existing) = inner.find_mapping(&event.mapping.name_mapping) {
                inner.remove_mapping(&existing);
            }
            if event.event_type == BackendEventType::Update {
                inner.add_mapping(Entry {
                    mapping: event.mapping,
                    changed: false,
                });
            }
        }
    }

    /// Record `pair` as a reference of the mapping `belongs_to`, creating the owner if needed.
    ///
    /// Incomplete pairs are ignored. A pair conflicting with a stored
    /// identity is rejected with [`Error::NameMappingConflict`].
    pub async fn add_reference(&self, pair: &NameMapping, belongs_to: &NameMapping) -> Result<()> {
        if !pair.is_complete() {
            return Ok(());
        }

        let mut inner = self.inner.write().await;
        inner.check_name_conflict(pair)?;
        if !self.verified(pair) {
            return Ok(());
        }

        let Some(owner) = inner.find_mapping(belongs_to) else {
            inner.create_mapping(pair, belongs_to);
            return Ok(());
        };
        if owner == *pair {
            return Ok(());
        }

        let Some(entry) = inner.mappings.get_mut(&owner) else {
            return Ok(());
        };
        if entry.mapping.references.contains(pair) {
            return Ok(());
        }
        entry.changed = true;
        entry.mapping.references.push(pair.clone());

        info!(
            host = %pair.host_key,
            virtual_key = %pair.virtual_key,
            owner = %owner.virtual_key,
            "Add mapping reference"
        );
        inner.add_name_to_maps(&owner, pair);
        inner.dispatch(pair);
        Ok(())
    }

    /// [`Store::add_reference`] followed by [`Store::save_mapping`] of the owner
    pub async fn add_reference_and_save(
        &self,
        pair: &NameMapping,
        belongs_to: &NameMapping,
    ) -> Result<()> {
        self.add_reference(pair, belongs_to).await?;
        self.save_mapping(belongs_to).await
    }

    /// Remove `pair` from the references of `belongs_to`
    pub async fn delete_reference(&self, pair: &NameMapping, belongs_to: &NameMapping) -> Result<()> {
        if !pair.is_complete() {
            return Ok(());
        }

        let mut inner = self.inner.write().await;
        let Some(owner) = inner.find_mapping(belongs_to) else {
            return Ok(());
        };
        let Some(entry) = inner.mappings.get_mut(&owner) else {
            return Ok(());
        };

        let before = entry.mapping.references.len();
        entry.mapping.references.retain(|r| r != pair);
        if entry.mapping.references.len() == before {
            return Ok(());
        }
        entry.changed = true;

        info!(
            host = %pair.host_key,
            virtual_key = %pair.virtual_key,
            owner = %owner.virtual_key,
            "Delete mapping reference"
        );
        inner.remove_name_from_maps(&owner, pair);
        inner.dispatch(pair);
        Ok(())
    }

    /// [`Store::delete_reference`] followed by [`Store::save_mapping`] of the owner
    pub async fn delete_reference_and_save(
        &self,
        pair: &NameMapping,
        belongs_to: &NameMapping,
    ) -> Result<()> {
        self.delete_reference(pair, belongs_to).await?;
        self.save_mapping(belongs_to).await
    }

    /// Persist a mapping if it changed since it was last saved
    pub async fn save_mapping(&self, mapping: &NameMapping) -> Result<()> {
        if mapping.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().await;
        let Some(key) = inner.find_mapping(mapping) else {
            return Ok(());
        };
        let Some(entry) = inner.mappings.get_mut(&key) else {
            return Ok(());
        };
        if !entry.changed {
            return Ok(());
        }
        entry.mapping.sender = self.sender.clone();
        let record = entry.mapping.clone();

        info!(mapping = %record, "Save object mappings in store");
        self.backend
            .save(&record)
            .await
            .map_err(|e| Error::backend(format!("save mapping {record}: {e}")))?;

        if let Some(entry) = inner.mappings.get_mut(&key) {
            entry.changed = false;
        }
        Ok(())
    }

    /// Remove a mapping and its references from the store and the backend
    pub async fn delete_mapping(&self, mapping: &NameMapping) -> Result<()> {
        if mapping.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().await;
        let Some(key) = inner.find_mapping(mapping) else {
            return Ok(());
        };
        self.delete_entry(&mut inner, &key).await?;
        info!(mapping = %key, "Remove object mappings in store");
        Ok(())
    }

    async fn delete_entry(&self, inner: &mut Inner, key: &NameMapping) -> Result<()> {
        let Some(entry) = inner.mappings.get_mut(key) else {
            return Ok(());
        };
        entry.mapping.sender = self.sender.clone();
        let record = entry.mapping.clone();

        self.backend
            .delete(&record)
            .await
            .map_err(|e| Error::backend(format!("remove mapping {record} from backend: {e}")))?;
        inner.remove_mapping(key);
        Ok(())
    }

    /// Mappings of other objects that reference `virtual_object`
    pub async fn references_to(&self, virtual_object: &KindedKey) -> Vec<NameMapping> {
        let references = self.inner.read().await.references_to(virtual_object);
        debug!(object = %virtual_object, references = references.len(), "Found references for object");
        references
    }

    /// Virtual identity recorded for a host object
    pub async fn host_to_virtual_name(&self, host_object: &KindedKey) -> Option<ObjectKey> {
        self.inner
            .read()
            .await
            .host_to_virtual
            .get(host_object)
            .map(|l| l.object.clone())
    }

    /// Host identity recorded for a virtual object
    pub async fn virtual_to_host_name(&self, virtual_object: &KindedKey) -> Option<ObjectKey> {
        self.inner
            .read()
            .await
            .virtual_to_host
            .get(virtual_object)
            .map(|l| l.object.clone())
    }

    /// Virtual identities recorded for a host key under any kind
    pub async fn host_to_virtual_any_kind(&self, host_key: &ObjectKey) -> Vec<KindedKey> {
        self.inner
            .read()
            .await
            .host_to_virtual
            .iter()
            .filter(|(host, _)| host.key == *host_key)
            .map(|(host, lookup)| KindedKey::new(host.gvk.clone(), lookup.object.clone()))
            .collect()
    }

    /// True if the host object has a recorded virtual identity
    pub async fn has_host_object(&self, host_object: &KindedKey) -> bool {
        self.host_to_virtual_name(host_object).await.is_some()
    }

    /// True if the virtual object has a recorded host identity
    pub async fn has_virtual_object(&self, virtual_object: &KindedKey) -> bool {
        self.virtual_to_host_name(virtual_object).await.is_some()
    }

    /// Receive every pair of kind `gvk` that is added to or removed from the store
    pub async fn watch(&self, gvk: GroupVersionKind) -> mpsc::UnboundedReceiver<NameMapping> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .write()
            .await
            .watches
            .entry(gvk)
            .or_default()
            .push(tx);
        rx
    }

    /// Number of owning mappings
    pub async fn len(&self) -> usize {
        self.inner.read().await.mappings.len()
    }

    /// True if no mapping is stored
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Remove mappings whose virtual and host objects are both gone.
    ///
    /// Existence is checked without holding the lock so reconciliations keep
    /// resolving names during a run. Lookup errors count as "exists".
    /// Returns the number of removed mappings.
    pub async fn garbage_collect(&self) -> usize {
        let started = Instant::now();
        let keys: Vec<NameMapping> = self.inner.read().await.mappings.keys().cloned().collect();
        debug!(mappings = keys.len(), "Start mappings garbage collection");

        let mut removed = 0;
        for key in keys {
            if self.object_exists(&key).await {
                continue;
            }

            let mut inner = self.inner.write().await;
            if !inner.mappings.contains_key(&key) {
                continue;
            }
            match self.delete_entry(&mut inner, &key).await {
                Ok(()) => {
                    removed += 1;
                    info!(mapping = %key, "Remove mapping as both virtual and host were not found");
                }
                Err(e) => error!(mapping = %key, error = %e, "Failed to garbage collect mapping"),
            }
        }

        MAPPINGS_GC_REMOVED.add(removed as u64, &[]);
        debug!(took = ?started.elapsed(), removed, "Garbage collection done");
        removed
    }

    async fn object_exists(&self, mapping: &NameMapping) -> bool {
        match self.existence.virtual_exists(&mapping.virtual_object()).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                info!(object = %mapping.virtual_object(), error = %e, "Error retrieving virtual object");
                return true;
            }
        }
        match self.existence.host_exists(&mapping.host_object()).await {
            Ok(exists) => exists,
            Err(e) => {
                info!(object = %mapping.host_object(), error = %e, "Error retrieving host object");
                true
            }
        }
    }

    /// Run [`Store::garbage_collect`] every `interval` until `cancel` fires
    pub fn start_garbage_collection(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.garbage_collect().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::existence::MockObjectExistence;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use vsync_common::kube_utils::sha256_hex;

    /// Existence answers from a set of virtual objects; no host object exists
    #[derive(Default)]
    struct VirtualObjects(Mutex<HashSet<KindedKey>>);

    impl VirtualObjects {
        fn insert(&self, object: KindedKey) {
            self.0.lock().unwrap().insert(object);
        }

        fn remove(&self, object: &KindedKey) {
            self.0.lock().unwrap().remove(object);
        }
    }

    #[async_trait::async_trait]
    impl ObjectExistence for VirtualObjects {
        async fn virtual_exists(&self, object: &KindedKey) -> Result<bool> {
            Ok(self.0.lock().unwrap().contains(object))
        }

        async fn host_exists(&self, _object: &KindedKey) -> Result<bool> {
            Ok(false)
        }
    }

    fn gvk(kind: &str) -> GroupVersionKind {
        GroupVersionKind {
            group: String::new(),
            version: "v1".to_string(),
            kind: kind.to_string(),
        }
    }

    fn random_mapping(kind: &str) -> NameMapping {
        let id = uuid::Uuid::new_v4().to_string();
        let part = |p: &str| sha256_hex(&format!("{id}{p}"))[..32].to_string();
        NameMapping::new(
            gvk(kind),
            ObjectKey::new(part("vn"), part("v")),
            ObjectKey::new(part("hn"), part("h")),
        )
    }

    fn new_store(existence: Arc<dyn ObjectExistence>) -> (Arc<Store>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (Arc::new(Store::new(backend.clone(), existence)), backend)
    }

    async fn sizes(store: &Store) -> (usize, usize, usize) {
        let inner = store.inner.read().await;
        (
            inner.mappings.len(),
            inner.host_to_virtual.len(),
            inner.virtual_to_host.len(),
        )
    }

    async fn references(store: &Store, mapping: &NameMapping) -> usize {
        store.references_to(&mapping.virtual_object()).await.len()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    // =========================================================================
    // Story Tests: Lookup
    // =========================================================================

    /// Story: a recorded pair resolves in both directions
    #[tokio::test]
    async fn story_recorded_pair_resolves_both_ways() {
        let (store, _) = new_store(Arc::new(VirtualObjects::default()));
        let virtual_key = ObjectKey::new("virtual-namespace", "virtual-name");
        let host_key = ObjectKey::new("host-namespace", "host-name");
        let pair = NameMapping::new(gvk("Secret"), virtual_key.clone(), host_key.clone());
        let owner = NameMapping::new(gvk("Secret"), virtual_key.clone(), ObjectKey::default());

        store.add_reference(&pair, &owner).await.unwrap();
        assert_eq!(store.virtual_to_host_name(&pair.virtual_object()).await, Some(host_key));
        assert_eq!(store.host_to_virtual_name(&pair.host_object()).await, Some(virtual_key));
        assert!(store
            .host_to_virtual_name(&KindedKey::new(gvk("Secret"), ObjectKey::default()))
            .await
            .is_none());
        assert_eq!(sizes(&store).await, (1, 1, 1));

        // recording the same pair again changes nothing
        store.add_reference(&pair, &owner).await.unwrap();
        assert_eq!(sizes(&store).await, (1, 1, 1));
        assert!(store.inner.read().await.mappings[&pair].mapping.references.is_empty());

        store.garbage_collect().await;
        assert_eq!(sizes(&store).await, (0, 0, 0));
    }

    #[tokio::test]
    async fn partial_owner_of_another_host_is_not_created() {
        let (store, _) = new_store(Arc::new(VirtualObjects::default()));
        let pair = NameMapping::new(
            gvk("ConfigMap"),
            ObjectKey::new("default", "kube-root-ca.crt"),
            ObjectKey::new("vcluster-namespace", "vcluster-kube-root-ca.crt-x-vcluster"),
        );
        let owner = NameMapping::new(
            gvk("ConfigMap"),
            ObjectKey::default(),
            ObjectKey::new("vcluster-namespace", "kube-root-ca.crt"),
        );
        store.add_reference(&pair, &owner).await.unwrap();
        assert!(store.is_empty().await);
    }

    // =========================================================================
    // Story Tests: References
    // =========================================================================

    /// Story: references follow their owners in and out of the index
    #[tokio::test]
    async fn story_references_are_counted_per_owner() {
        let (store, _) = new_store(Arc::new(VirtualObjects::default()));
        let secret = random_mapping("Secret");
        let other_secret = random_mapping("Secret");
        let pod = random_mapping("Pod");
        let other_pod = random_mapping("Pod");

        store.add_reference(&pod, &pod).await.unwrap();
        store.add_reference(&other_pod, &other_pod).await.unwrap();
        store.add_reference(&secret, &secret).await.unwrap();
        store.add_reference(&secret, &pod).await.unwrap();
        store.add_reference(&secret, &other_pod).await.unwrap();
        store.add_reference(&other_secret, &pod).await.unwrap();
        assert_eq!(sizes(&store).await, (3, 4, 4));
        assert_eq!(references(&store, &secret).await, 2);
        assert_eq!(references(&store, &other_secret).await, 1);

        store.delete_reference(&other_secret, &pod).await.unwrap();
        assert_eq!(store.inner.read().await.mappings[&pod].mapping.references.len(), 1);
        assert_eq!(sizes(&store).await, (3, 3, 3));
        assert_eq!(references(&store, &secret).await, 2);
        assert_eq!(references(&store, &other_secret).await, 0);

        store.delete_mapping(&pod).await.unwrap();
        assert_eq!(sizes(&store).await, (2, 2, 2));
        assert_eq!(references(&store, &secret).await, 1);

        store.delete_reference(&secret, &other_pod).await.unwrap();
        assert_eq!(sizes(&store).await, (2, 2, 2));
        assert_eq!(references(&store, &secret).await, 0);

        store.delete_mapping(&secret).await.unwrap();
        assert_eq!(sizes(&store).await, (1, 1, 1));
    }

    #[tokio::test]
    async fn conflicting_pairs_are_rejected() {
        let (store, _) = new_store(Arc::new(VirtualObjects::default()));
        let secret = random_mapping("Secret");
        store.add_reference(&secret, &secret).await.unwrap();

        let conflicting = NameMapping::new(
            secret.gvk.clone(),
            secret.virtual_key.clone(),
            ObjectKey::new("other", "other"),
        );
        let err = store.add_reference(&conflicting, &conflicting).await.unwrap_err();
        assert!(err.to_string().contains("there is already another name mapping"));
        assert!(matches!(err, Error::NameMappingConflict { .. }));

        let stolen_host = NameMapping::new(
            secret.gvk.clone(),
            ObjectKey::new("default", "b"),
            secret.host_key.clone(),
        );
        assert!(store.add_reference(&stolen_host, &stolen_host).await.is_err());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn verify_filter_drops_mappings() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(backend, Arc::new(VirtualObjects::default()))
            .with_verify_mapping(|m| m.gvk.kind != "Pod");
        let pod = random_mapping("Pod");
        store.add_reference(&pod, &pod).await.unwrap();
        assert!(store.is_empty().await);
    }

    // =========================================================================
    // Story Tests: Persistence
    // =========================================================================

    /// Story: only changed mappings are written, and restarts reload them
    #[tokio::test]
    async fn story_saved_mappings_survive_restart() {
        let (store, backend) = new_store(Arc::new(VirtualObjects::default()));
        let secret = random_mapping("Secret");
        let pod = random_mapping("Pod");

        store.add_reference_and_save(&pod, &pod).await.unwrap();
        store.add_reference_and_save(&secret, &pod).await.unwrap();
        let saved = backend.list().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].references, vec![secret.clone()]);
        assert!(!saved[0].sender.is_empty());

        let restarted = Arc::new(Store::new(
            backend.clone(),
            Arc::new(VirtualObjects::default()),
        ));
        let cancel = CancellationToken::new();
        restarted.start(cancel.clone()).await.unwrap();
        assert_eq!(
            restarted.host_to_virtual_name(&secret.host_object()).await,
            Some(secret.virtual_key.clone())
        );
        assert_eq!(references(&restarted, &secret).await, 1);

        store.delete_reference_and_save(&secret, &pod).await.unwrap();
        assert!(backend.list().await.unwrap()[0].references.is_empty());
        cancel.cancel();
    }

    /// Story: a store follows mappings written by another replica
    #[tokio::test]
    async fn story_backend_events_from_other_writers_are_applied() {
        let (store, backend) = new_store(Arc::new(VirtualObjects::default()));
        let cancel = CancellationToken::new();
        store.start(cancel.clone()).await.unwrap();
        eventually(|| async { backend.watch_count() == 1 }).await;

        let secret = random_mapping("Secret");
        let other_secret = random_mapping("Secret");
        let pod = random_mapping("Pod");

        backend
            .save(
                &Mapping::new(secret.clone())
                    .with_references(vec![pod.clone()])
                    .with_sender("doesnotexist"),
            )
            .await
            .unwrap();
        eventually(|| async {
            sizes(&store).await == (1, 2, 2) && references(&store, &pod).await == 1
        })
        .await;

        backend
            .save(
                &Mapping::new(other_secret.clone())
                    .with_references(vec![pod.clone()])
                    .with_sender("doesnotexist"),
            )
            .await
            .unwrap();
        eventually(|| async {
            sizes(&store).await == (2, 3, 3) && references(&store, &pod).await == 2
        })
        .await;

        // update drops the reference
        backend
            .save(&Mapping::new(secret.clone()).with_sender("doesnotexist"))
            .await
            .unwrap();
        eventually(|| async {
            sizes(&store).await == (2, 3, 3) && references(&store, &pod).await == 1
        })
        .await;

        backend
            .delete(&Mapping::new(secret.clone()).with_sender("doesnotexist"))
            .await
            .unwrap();
        eventually(|| async {
            sizes(&store).await == (1, 2, 2) && references(&store, &pod).await == 1
        })
        .await;

        backend
            .delete(&Mapping::new(other_secret.clone()).with_sender("doesnotexist"))
            .await
            .unwrap();
        eventually(|| async { sizes(&store).await == (0, 0, 0) }).await;

        // own writes are ignored by the watch but applied directly
        store.add_reference_and_save(&pod, &pod).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sizes(&store).await, (1, 1, 1));
        cancel.cancel();
    }

    #[tokio::test]
    async fn watchers_are_notified_of_their_kind() {
        let (store, _) = new_store(Arc::new(VirtualObjects::default()));
        let mut secrets = store.watch(gvk("Secret")).await;
        let secret = random_mapping("Secret");
        let pod = random_mapping("Pod");

        store.add_reference(&pod, &pod).await.unwrap();
        store.add_reference(&secret, &pod).await.unwrap();
        assert_eq!(secrets.recv().await, Some(secret));
        assert!(secrets.try_recv().is_err());
    }

    // =========================================================================
    // Story Tests: Garbage Collection
    // =========================================================================

    /// Story: mappings disappear once neither side exists any more
    #[tokio::test]
    async fn story_garbage_collection_keeps_live_objects() {
        let objects = Arc::new(VirtualObjects::default());
        let (store, _) = new_store(objects.clone());
        let secret = random_mapping("Secret");
        let pod = random_mapping("Pod");

        store.add_reference(&secret, &secret).await.unwrap();
        store.add_reference(&pod, &pod).await.unwrap();
        store.add_reference(&secret, &pod).await.unwrap();
        assert_eq!(references(&store, &secret).await, 1);

        assert_eq!(store.garbage_collect().await, 2);
        assert_eq!(sizes(&store).await, (0, 0, 0));

        store.add_reference(&secret, &secret).await.unwrap();
        store.add_reference(&pod, &pod).await.unwrap();
        store.add_reference(&secret, &pod).await.unwrap();
        objects.insert(pod.virtual_object());

        assert_eq!(store.garbage_collect().await, 1);
        assert_eq!(sizes(&store).await, (1, 2, 2));
        assert_eq!(references(&store, &secret).await, 1);

        objects.remove(&pod.virtual_object());
        store.garbage_collect().await;
        assert_eq!(sizes(&store).await, (0, 0, 0));
        assert_eq!(references(&store, &secret).await, 0);
    }

    #[tokio::test]
    async fn lookup_errors_keep_mappings() {
        let mut existence = MockObjectExistence::new();
        existence
            .expect_virtual_exists()
            .returning(|_| Err(Error::internal("timeout")));
        existence.expect_host_exists().never();

        let (store, _) = new_store(Arc::new(existence));
        let secret = random_mapping("Secret");
        store.add_reference(&secret, &secret).await.unwrap();

        assert_eq!(store.garbage_collect().await, 0);
        assert_eq!(store.len().await, 1);
    }
}
