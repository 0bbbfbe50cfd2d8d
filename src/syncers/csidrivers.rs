//! CSI drivers: host-authoritative, mirrored into the virtual cluster
//!
//! Drivers are installed on the host. The virtual cluster gets a read-only
//! copy of each one; copies without a host driver are removed.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::CSIDriver;
use tracing::info;

use vsync_common::{ObjectClient, ObjectKey, Result, SyncConfig};
use vsync_syncer::host::update_if_changed;
use vsync_syncer::{Action, Registration, SyncContext, Syncer, UpSyncHandler};
use vsync_translate::{MirrorTranslator, Translator};

/// Synchronizer name
pub const NAME: &str = "csidriver";

/// Keeps virtual drivers identical to host drivers
pub struct CsiDriverSyncer {
    translator: Arc<MirrorTranslator<CSIDriver>>,
}

impl CsiDriverSyncer {
    /// Syncer with its own translator
    pub fn new(translator: Arc<MirrorTranslator<CSIDriver>>) -> Self {
        Self { translator }
    }
}

#[async_trait]
impl Syncer<CSIDriver> for CsiDriverSyncer {
    async fn sync_to_host(&self, ctx: &SyncContext<CSIDriver>, virtual_obj: &CSIDriver) -> Result<Action> {
        let key = ObjectKey::of(virtual_obj);
        info!(driver = %key, "Delete virtual CSI driver without host driver");
        ctx.virtual_client.delete(&key).await?;
        Ok(Action::await_change())
    }

    async fn sync(&self, ctx: &SyncContext<CSIDriver>, host: &CSIDriver, virtual_obj: &CSIDriver) -> Result<Action> {
        let mut desired = virtual_obj.clone();
        desired.spec = host.spec.clone();
        self.translator
            .translate_metadata_update(host, virtual_obj)
            .apply_to(&mut desired.metadata);
        update_if_changed(ctx.virtual_client.as_ref(), virtual_obj, &desired).await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl UpSyncHandler<CSIDriver> for CsiDriverSyncer {
    async fn sync_to_virtual(&self, ctx: &SyncContext<CSIDriver>, host: &CSIDriver) -> Result<Action> {
        let copy = self.translator.translate_metadata(host);
        info!(driver = %ObjectKey::of(&copy), "Create virtual CSI driver");
        ctx.virtual_client.create(&copy).await?;
        Ok(Action::await_change())
    }
}

/// Registration of the CSI driver syncer
pub fn registration(config: &SyncConfig) -> Registration<CSIDriver> {
    let translator = Arc::new(MirrorTranslator::<CSIDriver>::new(NAME, false, config));
    let syncer = Arc::new(CsiDriverSyncer::new(translator.clone()));
    Registration::new(translator, syncer.clone()).with_up_sync(syncer)
}
