//! Per-kind synchronization context
//!
//! A [`SyncContext`] bundles the cluster clients, the mapper and the engine
//! configuration of one kind. The controller derives a scoped copy per pass
//! carrying the mapping being reconciled, so names resolved during the pass
//! are recorded as references of that mapping.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use vsync_common::events::{EventPublisher, NoopEventPublisher};
use vsync_common::{NameMapping, ObjectClient, ObjectKey, Result, SyncConfig, SyncObject};
use vsync_mappings::{Mapper, Store};

/// Clients, mapper and configuration shared by every pass of a kind
pub struct SyncContext<K: SyncObject> {
    /// Client of the virtual cluster
    pub virtual_client: Arc<dyn ObjectClient<K>>,
    /// Client of the host cluster
    pub host_client: Arc<dyn ObjectClient<K>>,
    /// Name resolution for this kind
    pub mapper: Arc<dyn Mapper<K>>,
    /// Name mapping store shared by all kinds
    pub store: Arc<Store>,
    /// Event sink for the virtual cluster
    pub events: Arc<dyn EventPublisher>,
    /// Engine configuration
    pub config: Arc<SyncConfig>,
    /// Fires on shutdown
    pub cancel: CancellationToken,
    mapping: Option<NameMapping>,
}

impl<K: SyncObject> Clone for SyncContext<K> {
    fn clone(&self) -> Self {
        Self {
            virtual_client: self.virtual_client.clone(),
            host_client: self.host_client.clone(),
            mapper: self.mapper.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            mapping: self.mapping.clone(),
        }
    }
}

impl<K: SyncObject> SyncContext<K> {
    /// Context without events and with its own cancellation token
    pub fn new(
        virtual_client: Arc<dyn ObjectClient<K>>,
        host_client: Arc<dyn ObjectClient<K>>,
        mapper: Arc<dyn Mapper<K>>,
        store: Arc<Store>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            virtual_client,
            host_client,
            mapper,
            store,
            events: Arc::new(NoopEventPublisher),
            config,
            cancel: CancellationToken::new(),
            mapping: None,
        }
    }

    /// Publish events through `events`
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Tie the context to a shutdown token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copy scoped to the mapping being reconciled
    pub fn with_mapping(&self, mapping: NameMapping) -> Self {
        let mut scoped = self.clone();
        scoped.mapping = Some(mapping);
        scoped
    }

    /// Mapping being reconciled, if the context is scoped
    pub fn mapping(&self) -> Option<&NameMapping> {
        self.mapping.as_ref()
    }

    /// Host identity of a virtual object
    pub async fn virtual_to_host(&self, key: &ObjectKey, obj: Option<&K>) -> Result<ObjectKey> {
        self.mapper
            .virtual_to_host(key, obj, self.mapping.as_ref())
            .await
    }

    /// Virtual identity of a host object
    pub async fn host_to_virtual(&self, key: &ObjectKey, obj: Option<&K>) -> Result<ObjectKey> {
        self.mapper
            .host_to_virtual(key, obj, self.mapping.as_ref())
            .await
    }
}

#[cfg(any(test, feature = "testing"))]
mod testing {
    use super::*;
    use vsync_common::testing::MemoryClient;
    use vsync_mappings::existence::MockObjectExistence;
    use vsync_mappings::{GenericMapper, MemoryBackend, Recorder};
    use vsync_translate::Translator;

    impl<K: SyncObject> SyncContext<K> {
        /// Context over in-memory clusters and an in-memory mapping store
        pub fn for_testing(
            virtual_client: Arc<MemoryClient<K>>,
            host_client: Arc<MemoryClient<K>>,
            translator: Arc<dyn Translator<K>>,
            config: SyncConfig,
        ) -> Self {
            let store = Arc::new(Store::new(
                Arc::new(MemoryBackend::new()),
                Arc::new(MockObjectExistence::new()),
            ));
            let generic = Arc::new(GenericMapper::new(translator, store.clone()));
            let mapper = Arc::new(Recorder::new(generic, store.clone()));
            Self::new(virtual_client, host_client, mapper, store, Arc::new(config))
        }
    }
}
