//! Priority classes: cluster-scoped, renamed per instance on the host

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::scheduling::v1::PriorityClass;

use vsync_common::{Result, SyncConfig};
use vsync_syncer::host::{create_host_object, update_if_changed};
use vsync_syncer::{Action, Registration, SyncContext, Syncer};
use vsync_translate::{ClusterTranslator, Translator};

/// Synchronizer name
pub const NAME: &str = "priorityclass";

/// Values above this are reserved for system priority classes
pub const MAX_USER_PRIORITY: i32 = 1_000_000_000;

/// Copies priority classes, capping values to the user range
pub struct PriorityClassSyncer {
    translator: Arc<ClusterTranslator<PriorityClass>>,
}

impl PriorityClassSyncer {
    /// Syncer with its own translator
    pub fn new(translator: Arc<ClusterTranslator<PriorityClass>>) -> Self {
        Self { translator }
    }
}

fn host_spec(virtual_obj: &PriorityClass, host: &mut PriorityClass) {
    host.value = virtual_obj.value.min(MAX_USER_PRIORITY);
    host.description = virtual_obj.description.clone();
    host.preemption_policy = virtual_obj.preemption_policy.clone();
    // a tenant must never change the default of the whole host cluster
    host.global_default = None;
}

#[async_trait]
impl Syncer<PriorityClass> for PriorityClassSyncer {
    async fn sync_to_host(
        &self,
        ctx: &SyncContext<PriorityClass>,
        virtual_obj: &PriorityClass,
    ) -> Result<Action> {
        let mut host = self.translator.translate_metadata(virtual_obj);
        host_spec(virtual_obj, &mut host);
        create_host_object(ctx, virtual_obj, &host).await
    }

    async fn sync(
        &self,
        ctx: &SyncContext<PriorityClass>,
        host: &PriorityClass,
        virtual_obj: &PriorityClass,
    ) -> Result<Action> {
        let mut desired = host.clone();
        desired.description = virtual_obj.description.clone();
        self.translator
            .translate_metadata_update(virtual_obj, host)
            .apply_to(&mut desired.metadata);
        update_if_changed(ctx.host_client.as_ref(), host, &desired).await?;
        Ok(Action::await_change())
    }
}

/// Registration of the priority class syncer
pub fn registration(config: &SyncConfig) -> Registration<PriorityClass> {
    let translator = Arc::new(ClusterTranslator::<PriorityClass>::new(NAME, config));
    Registration::new(
        translator.clone(),
        Arc::new(PriorityClassSyncer::new(translator)),
    )
}
