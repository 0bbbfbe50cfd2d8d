//! Resource kinds synchronized by the binary
//!
//! Each submodule registers one kind. [`SyncerSet`] holds what every kind
//! shares (clients, configuration, the mapping store) and turns a
//! [`Registration`] into a future that migrates existing objects and then
//! runs the kind until shutdown.

pub mod csidrivers;
pub mod persistentvolumes;
pub mod priorityclasses;
pub mod secrets;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vsync_common::events::KubeEventPublisher;
use vsync_common::{KubeObjectClient, ObjectClient, Result, SyncConfig, SyncObject};
use vsync_mappings::{GenericMapper, Mapper, Recorder, Store};
use vsync_syncer::{Registration, SyncContext, SyncController, SyncerRunner};
use vsync_translate::Translator;

use crate::retry::{retry_with_backoff, RetryConfig};

/// A running kind; resolves on shutdown
pub type SyncerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Shared state every kind is built from
#[derive(Clone)]
pub struct SyncerSet {
    /// Engine configuration
    pub config: Arc<SyncConfig>,
    /// Client of the virtual cluster
    pub virtual_client: Client,
    /// Client of the host cluster
    pub host_client: Client,
    /// Mapping store shared by all kinds
    pub store: Arc<Store>,
    /// Fires on shutdown
    pub cancel: CancellationToken,
}

impl SyncerSet {
    /// Context for a kind translated by `translator`
    pub fn context<K: SyncObject>(&self, translator: Arc<dyn Translator<K>>) -> SyncContext<K> {
        let generic = Arc::new(GenericMapper::new(translator.clone(), self.store.clone()));
        let mapper = Arc::new(Recorder::new(generic, self.store.clone()));
        SyncContext::new(
            Arc::new(KubeObjectClient::<K>::new(self.virtual_client.clone())),
            Arc::new(KubeObjectClient::<K>::new(self.host_client.clone())),
            mapper,
            self.store.clone(),
            self.config.clone(),
        )
        .with_events(Arc::new(KubeEventPublisher::new(
            self.virtual_client.clone(),
            translator.name(),
        )))
        .with_cancel(self.cancel.clone())
    }

    /// Migrate existing objects of the kind into the store, then return its runner
    pub async fn start<K: SyncObject>(&self, registration: Registration<K>) -> Result<SyncerFuture> {
        let ctx = self.context(registration.translator.clone());
        migrate(&ctx, &self.cancel).await?;

        let name = registration.name.clone();
        let controller = Arc::new(SyncController::new(registration, ctx));
        let runner = SyncerRunner::new(
            controller,
            self.virtual_client.clone(),
            self.host_client.clone(),
        );
        let cancel = self.cancel.clone();
        info!(syncer = %name, "Registered syncer");
        Ok(Box::pin(async move {
            if let Err(e) = runner.run(cancel).await {
                error!(syncer = %name, error = %e, "Syncer failed");
            }
        }))
    }
}

async fn migrate<K: SyncObject>(ctx: &SyncContext<K>, cancel: &CancellationToken) -> Result<()> {
    let virtual_client: &dyn ObjectClient<K> = ctx.virtual_client.as_ref();
    let host_client: &dyn ObjectClient<K> = ctx.host_client.as_ref();
    let operation = format!("migrate_{}", ctx.mapper.kind().kind().to_lowercase());
    retry_with_backoff(&RetryConfig::with_max_attempts(10), &operation, cancel, || {
        ctx.mapper
            .migrate(virtual_client, host_client, &ctx.config.host_namespace)
    })
    .await
}
