//! Synthetic virtual objects
//!
//! Some kinds have no host counterpart but must exist in the virtual
//! cluster while other virtual objects refer to them (a volume bound by a
//! claim, for example). A [`FakeSyncer`] decides whether a name is needed;
//! [`FakeSyncController`] creates the placeholder when it is missing and
//! removes it, finalizers first, once nothing needs it anymore.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use vsync_common::metrics::{record_action, ReconcileTimer, SyncAction};
use vsync_common::{ObjectClient, ObjectKey, Result, SyncConfig, SyncObject};

use crate::dispatch::{run_workers, KeyedLock, WorkQueue, WorkerOptions};
use crate::exclude::controlled_by_other;
use crate::runner::{watch_kind, WatchSources};
use crate::types::{Action, Request};

/// Placeholder objects derived from other virtual objects
#[async_trait]
pub trait FakeSyncer<K: SyncObject>: Send + Sync {
    /// Synchronizer name
    fn name(&self) -> &str;

    /// The placeholder object for `key`
    fn new_object(&self, key: &ObjectKey) -> K;

    /// True if `obj` is a placeholder written by this syncer
    fn is_fake(&self, obj: &K) -> bool;

    /// Every name that is needed right now
    async fn dependant_names(&self) -> Result<Vec<ObjectKey>>;

    /// True while something still needs `key`
    async fn create_needed(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.dependant_names().await?.contains(key))
    }

    /// True if an existing placeholder can go
    async fn delete_needed(&self, obj: &K) -> Result<bool> {
        if !self.is_fake(obj) {
            return Ok(false);
        }
        Ok(!self.create_needed(&ObjectKey::of(obj)).await?)
    }

    /// Create the placeholder for `key`
    async fn create(&self, client: &dyn ObjectClient<K>, key: &ObjectKey) -> Result<()> {
        info!(syncer = self.name(), object = %key, "Create fake object");
        client.create(&self.new_object(key)).await?;
        Ok(())
    }

    /// Strip finalizers, then delete the placeholder
    async fn delete(&self, client: &dyn ObjectClient<K>, obj: &K) -> Result<()> {
        let key = ObjectKey::of(obj);
        info!(syncer = self.name(), object = %key, "Delete fake object");
        if obj.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            let mut stripped = obj.clone();
            stripped.meta_mut().finalizers = None;
            client.update(&stripped).await?;
        }
        client.delete(&key).await?;
        Ok(())
    }
}

/// Drives the absent / needed / not-needed states of a [`FakeSyncer`]
pub struct FakeSyncController<K: SyncObject> {
    syncer: Arc<dyn FakeSyncer<K>>,
    client: Arc<dyn ObjectClient<K>>,
    locks: KeyedLock<ObjectKey>,
}

impl<K: SyncObject> FakeSyncController<K> {
    /// Controller writing placeholders through `client` (the virtual cluster)
    pub fn new(syncer: Arc<dyn FakeSyncer<K>>, client: Arc<dyn ObjectClient<K>>) -> Self {
        Self {
            syncer,
            client,
            locks: KeyedLock::new(),
        }
    }

    /// Synchronizer name
    pub fn name(&self) -> &str {
        self.syncer.name()
    }

    /// Reconcile one placeholder name
    #[instrument(skip(self, request), fields(syncer = %self.syncer.name(), object = %request.key()))]
    pub async fn reconcile(&self, request: Request) -> Result<Action> {
        let timer = ReconcileTimer::start(self.name());
        let result = self.reconcile_key(request.key()).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.error(e.error_type()),
        }
        result
    }

    async fn reconcile_key(&self, key: &ObjectKey) -> Result<Action> {
        let _guard = self.locks.lock(key.clone()).await;

        let Some(obj) = self.client.get(key).await? else {
            if self.syncer.create_needed(key).await? {
                record_action(self.name(), SyncAction::SyncToVirtual);
                self.syncer.create(self.client.as_ref(), key).await?;
            } else {
                record_action(self.name(), SyncAction::Noop);
            }
            return Ok(Action::await_change());
        };

        if controlled_by_other(&obj, self.name()) {
            debug!(object = %key, "Ignoring object controlled by another syncer");
            record_action(self.name(), SyncAction::Noop);
            return Ok(Action::await_change());
        }
        if self.syncer.delete_needed(&obj).await? {
            record_action(self.name(), SyncAction::DeleteHost);
            self.syncer.delete(self.client.as_ref(), &obj).await?;
        } else {
            record_action(self.name(), SyncAction::Noop);
        }
        Ok(Action::await_change())
    }

    /// Watch placeholders and `sources` on the virtual cluster until `cancel` fires
    pub async fn run(
        self: Arc<Self>,
        virtual_client: Client,
        mut sources: WatchSources,
        config: &SyncConfig,
        cancel: CancellationToken,
    ) -> Result<()> {
        let queue = Arc::new(WorkQueue::new());
        for key in self.syncer.dependant_names().await? {
            queue.add(Request::Virtual(key));
        }

        sources.add(
            watch_kind::<K>(virtual_client, "")
                .map(|observed| Request::Virtual(ObjectKey::of(observed.object()))),
        );
        let mut requests = sources.into_stream();
        let feeder_queue = queue.clone();
        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    next = requests.next() => match next {
                        Some(request) => feeder_queue.add(request),
                        None => break,
                    },
                }
            }
        });

        info!(syncer = self.name(), "Starting fake syncer");
        let options = WorkerOptions::from_config(self.name(), config);
        let controller = self.clone();
        run_workers(queue, options, cancel, move |request| {
            let controller = controller.clone();
            async move { controller.reconcile(request).await }
        })
        .await;
        feeder.abort();
        Ok(())
    }
}
