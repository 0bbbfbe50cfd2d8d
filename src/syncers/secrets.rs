//! Secrets: namespaced, copied from the virtual cluster into the host namespace

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;

use vsync_common::{Result, SyncConfig};
use vsync_syncer::host::{create_host_object, update_if_changed};
use vsync_syncer::{Action, ObjectExcluder, Registration, SyncContext, Syncer};
use vsync_translate::{NamespacedTranslator, Translator};

/// Synchronizer name
pub const NAME: &str = "secret";

/// Secrets of this type are minted per cluster and never copied
const SERVICE_ACCOUNT_TOKEN: &str = "kubernetes.io/service-account-token";

/// Copies data, type and metadata of virtual secrets
pub struct SecretSyncer {
    translator: Arc<NamespacedTranslator<Secret>>,
}

impl SecretSyncer {
    /// Syncer with its own translator
    pub fn new(translator: Arc<NamespacedTranslator<Secret>>) -> Self {
        Self { translator }
    }
}

#[async_trait]
impl Syncer<Secret> for SecretSyncer {
    async fn sync_to_host(&self, ctx: &SyncContext<Secret>, virtual_obj: &Secret) -> Result<Action> {
        let host = self.translator.translate_metadata(virtual_obj);
        create_host_object(ctx, virtual_obj, &host).await
    }

    async fn sync(&self, ctx: &SyncContext<Secret>, host: &Secret, virtual_obj: &Secret) -> Result<Action> {
        let mut desired = host.clone();
        desired.data = virtual_obj.data.clone();
        desired.string_data = virtual_obj.string_data.clone();
        desired.type_ = virtual_obj.type_.clone();
        self.translator
            .translate_metadata_update(virtual_obj, host)
            .apply_to(&mut desired.metadata);
        update_if_changed(ctx.host_client.as_ref(), host, &desired).await?;
        Ok(Action::await_change())
    }
}

/// Keeps service account tokens out of the host cluster
struct SkipServiceAccountTokens;

fn is_service_account_token(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN)
}

impl ObjectExcluder<Secret> for SkipServiceAccountTokens {
    fn exclude_virtual(&self, obj: &Secret) -> bool {
        is_service_account_token(obj)
    }

    fn exclude_physical(&self, obj: &Secret) -> bool {
        is_service_account_token(obj)
    }
}

/// Registration of the secret syncer
pub fn registration(config: &SyncConfig) -> Registration<Secret> {
    let translator = Arc::new(NamespacedTranslator::<Secret>::new(NAME, config));
    Registration::new(translator.clone(), Arc::new(SecretSyncer::new(translator)))
        .with_excluder(Arc::new(SkipServiceAccountTokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use vsync_common::testing::{MemoryClient, WriteOp};
    use vsync_common::{ObjectClient, ObjectKey, UID_ANNOTATION};
    use vsync_syncer::{Request, SyncController};

    fn secret(name: &str, uid: &str, password: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(password.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    struct Clusters {
        virtual_cluster: Arc<MemoryClient<Secret>>,
        host_cluster: Arc<MemoryClient<Secret>>,
        controller: SyncController<Secret>,
    }

    fn clusters() -> Clusters {
        let config = SyncConfig::new("suffix", "test-ns");
        let registration = registration(&config);
        let virtual_cluster = Arc::new(MemoryClient::new());
        let host_cluster = Arc::new(MemoryClient::new());
        let ctx = SyncContext::for_testing(
            virtual_cluster.clone(),
            host_cluster.clone(),
            registration.translator.clone(),
            config,
        );
        Clusters {
            virtual_cluster,
            host_cluster,
            controller: SyncController::new(registration, ctx),
        }
    }

    fn host_key(name: &str) -> ObjectKey {
        ObjectKey::new("test-ns", format!("{name}-x-default-x-suffix"))
    }

    fn request(name: &str) -> Request {
        Request::Virtual(ObjectKey::new("default", name))
    }

    // =========================================================================
    // Story Tests: Secret lifecycle
    // =========================================================================

    /// Story: create, update, recreate and delete of one virtual secret
    #[tokio::test]
    async fn story_secret_lifecycle() {
        let c = clusters();

        c.virtual_cluster.insert(secret("db", "123", "hunter2"));
        c.controller.reconcile(request("db")).await.unwrap();
        let host = c.host_cluster.object(&host_key("db")).expect("host copy");
        assert_eq!(host.data.as_ref().unwrap()["password"], ByteString(b"hunter2".to_vec()));
        assert!(!host.metadata.labels.as_ref().unwrap().contains_key("app"));

        c.host_cluster.clear_writes();
        c.virtual_cluster.insert(secret("db", "123", "rotated"));
        c.controller.reconcile(request("db")).await.unwrap();
        assert_eq!(c.host_cluster.writes(), vec![WriteOp::Update(host_key("db"))]);

        // recreated under the same name: the stale copy goes first
        c.host_cluster.clear_writes();
        c.virtual_cluster.insert(secret("db", "456", "rotated"));
        c.controller.reconcile(request("db")).await.unwrap();
        assert_eq!(c.host_cluster.writes(), vec![WriteOp::Delete(host_key("db"))]);
        c.controller.reconcile(request("db")).await.unwrap();
        let host = c.host_cluster.object(&host_key("db")).unwrap();
        assert_eq!(host.metadata.annotations.unwrap()[UID_ANNOTATION], "456");

        c.virtual_cluster
            .delete(&ObjectKey::new("default", "db"))
            .await
            .unwrap();
        c.controller.reconcile(request("db")).await.unwrap();
        assert!(c.host_cluster.object(&host_key("db")).is_none());
    }

    #[tokio::test]
    async fn service_account_tokens_stay_virtual() {
        let c = clusters();
        let mut token = secret("default-token", "1", "jwt");
        token.type_ = Some(SERVICE_ACCOUNT_TOKEN.to_string());
        c.virtual_cluster.insert(token);

        c.controller.reconcile(request("default-token")).await.unwrap();
        assert!(c.host_cluster.objects().is_empty());
    }
}
