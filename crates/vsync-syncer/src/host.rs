//! Write helpers for directional handlers
//!
//! Handlers translate, then call one of these to write. Updates compare the
//! serialized objects first so a pass without changes issues no request.

use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use vsync_common::events::{actions, reasons};
use vsync_common::kube_utils::object_reference;
use vsync_common::{Error, ObjectClient, ObjectKey, Result, SyncObject};

use crate::context::SyncContext;
use crate::types::Action;

/// Create the host copy of a virtual object.
///
/// A host object already occupying the name is an ownership conflict and
/// is reported on the virtual object.
pub async fn create_host_object<K: SyncObject>(
    ctx: &SyncContext<K>,
    virtual_obj: &K,
    host_obj: &K,
) -> Result<Action> {
    let virtual_key = ObjectKey::of(virtual_obj);
    let host_key = ObjectKey::of(host_obj);
    info!(virtual_key = %virtual_key, host = %host_key, "Create host object");

    match ctx.host_client.create(host_obj).await {
        Ok(_) => Ok(Action::await_change()),
        Err(e) => {
            let err = if e.is_already_exists() {
                Error::conflict(&virtual_key, &host_key)
            } else {
                e
            };
            ctx.events
                .publish(
                    &object_reference(virtual_obj),
                    EventType::Warning,
                    reasons::SYNC_ERROR,
                    actions::CREATE,
                    Some(format!("Error syncing to host cluster: {err}")),
                )
                .await;
            Err(err)
        }
    }
}

/// Delete a host object; an already deleted object is not an error
pub async fn delete_host_object<K: SyncObject>(
    ctx: &SyncContext<K>,
    host_obj: &K,
    virtual_obj: Option<&K>,
    reason: &str,
) -> Result<Action> {
    let host_key = ObjectKey::of(host_obj);
    info!(host = %host_key, reason, "Delete host object");

    let deleted = ctx.host_client.delete(&host_key).await?;
    if !deleted {
        debug!(host = %host_key, "Host object was already gone");
    }
    if let (true, Some(virtual_obj)) = (deleted, virtual_obj) {
        ctx.events
            .publish(
                &object_reference(virtual_obj),
                EventType::Normal,
                reasons::DELETED_HOST_OBJECT,
                actions::DELETE,
                Some(format!("Deleted host object {host_key}: {reason}")),
            )
            .await;
    }
    Ok(Action::await_change())
}

fn unchanged<K: SyncObject>(before: &K, after: &K) -> Result<bool> {
    let encode = |obj: &K| {
        serde_json::to_value(obj)
            .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
    };
    Ok(encode(before)? == encode(after)?)
}

/// Replace `before` with `after` if they differ; returns whether a write happened
pub async fn update_if_changed<K: SyncObject>(
    client: &dyn ObjectClient<K>,
    before: &K,
    after: &K,
) -> Result<bool> {
    if unchanged(before, after)? {
        return Ok(false);
    }
    let key = ObjectKey::of(after);
    debug!(object = %key, "Update object");
    client.update(after).await.inspect_err(|e| {
        warn!(object = %key, error = %e, "Failed to update object");
    })?;
    Ok(true)
}

/// Write the status of `after` if it differs from `before`; returns whether a write happened
pub async fn update_status_if_changed<K: SyncObject>(
    client: &dyn ObjectClient<K>,
    before: &K,
    after: &K,
) -> Result<bool> {
    if unchanged(before, after)? {
        return Ok(false);
    }
    let key = ObjectKey::of(after);
    debug!(object = %key, "Update object status");
    client.update_status(after).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;
    use std::sync::Arc;
    use vsync_common::testing::{MemoryClient, WriteOp};
    use vsync_common::SyncConfig;
    use vsync_translate::NamespacedTranslator;

    fn secret(namespace: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn context(host: Arc<MemoryClient<Secret>>) -> SyncContext<Secret> {
        let config = SyncConfig::new("suffix", "test-ns");
        SyncContext::for_testing(
            Arc::new(MemoryClient::new()),
            host,
            Arc::new(NamespacedTranslator::<Secret>::new("secret", &config)),
            config,
        )
    }

    #[tokio::test]
    async fn occupied_host_name_is_a_conflict() {
        let host = Arc::new(MemoryClient::with_objects(vec![secret("test-ns", "a")]));
        let ctx = context(host.clone());

        let err = create_host_object(&ctx, &secret("default", "a"), &secret("test-ns", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.to_string().contains("default/a"));
        assert!(host.writes().is_empty());
    }

    #[tokio::test]
    async fn unchanged_objects_are_not_written() {
        let host = Arc::new(MemoryClient::with_objects(vec![secret("test-ns", "a")]));
        let stored = host.object(&ObjectKey::new("test-ns", "a")).unwrap();

        assert!(!update_if_changed(host.as_ref(), &stored, &stored.clone())
            .await
            .unwrap());

        let mut changed = stored.clone();
        changed.type_ = Some("Opaque".to_string());
        assert!(update_if_changed(host.as_ref(), &stored, &changed).await.unwrap());
        assert_eq!(
            host.writes(),
            vec![WriteOp::Update(ObjectKey::new("test-ns", "a"))]
        );
    }

    #[tokio::test]
    async fn deleting_a_missing_object_succeeds() {
        let host = Arc::new(MemoryClient::new());
        let ctx = context(host);
        let action = delete_host_object(&ctx, &secret("test-ns", "gone"), None, "test")
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }
}
