//! Reconciliation core
//!
//! [`SyncController::reconcile`] resolves both identities of a request,
//! fetches both objects, filters them through the exclusion predicate and
//! picks one cell of the decision matrix:
//!
//! | virtual | host | action                                              |
//! |---------|------|-----------------------------------------------------|
//! | yes     | no   | `sync_to_host`                                      |
//! | yes     | yes  | `sync`, or delete the host copy if the UID changed  |
//! | no      | yes  | up-sync handler, else `sync_to_virtual` (delete)    |
//! | no      | no   | release the name mapping                            |
//!
//! Passes for one virtual identity never overlap. A virtual identity whose
//! host name is already paired with another object fails the pass with
//! [`Error::NameMappingConflict`]; neither side is written.

use std::time::Duration;

use kube::runtime::events::EventType;
use tracing::{debug, info, instrument};

use vsync_common::events::{actions, reasons};
use vsync_common::kube_utils::{is_terminating, object_reference};
use vsync_common::metrics::{record_action, ReconcileTimer, SyncAction};
use vsync_common::{
    Error, NameMapping, ObjectKey, Result, SyncObject, KIND_ANNOTATION, SKIP_BACKSYNC_ANNOTATION,
    UID_ANNOTATION,
};

use crate::cache::{ObjectCache, Side};
use crate::context::SyncContext;
use crate::dispatch::KeyedLock;
use crate::exclude::{annotation_value, controlled_by_other, HostExclusion};
use crate::host::delete_host_object;
use crate::types::{Action, Registration, Request};

/// Delay before looking again at a host object that is still terminating
const TERMINATING_REQUEUE: Duration = Duration::from_secs(1);

/// Decision-matrix controller of one kind
pub struct SyncController<K: SyncObject> {
    registration: Registration<K>,
    ctx: SyncContext<K>,
    locks: KeyedLock<ObjectKey>,
    cache: Option<ObjectCache<K>>,
}

impl<K: SyncObject> SyncController<K> {
    /// Controller for a registered kind
    pub fn new(registration: Registration<K>, ctx: SyncContext<K>) -> Self {
        let cache = registration
            .options
            .object_caching
            .then(ObjectCache::new);
        Self {
            registration,
            ctx,
            locks: KeyedLock::new(),
            cache,
        }
    }

    /// Synchronizer name
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    /// Shared context of the kind
    pub fn context(&self) -> &SyncContext<K> {
        &self.ctx
    }

    /// Registration of the kind
    pub fn registration(&self) -> &Registration<K> {
        &self.registration
    }

    /// Run the initializer hook, if any
    pub async fn initialize(&self) -> Result<()> {
        let Some(initializer) = &self.registration.initializer else {
            return Ok(());
        };
        initializer
            .init(&self.ctx)
            .await
            .map_err(|e| Error::hook(self.name(), "initialize", e.to_string()))
    }

    // =========================================================================
    // Exclusion
    // =========================================================================

    /// True if the virtual object must be left alone
    pub fn exclude_virtual(&self, obj: &K) -> bool {
        controlled_by_other(obj, self.name())
            || self
                .registration
                .excluder
                .as_ref()
                .is_some_and(|excluder| excluder.exclude_virtual(obj))
    }

    /// Classify a host object.
    ///
    /// Ownership is read from the object, not from the mapping store, since
    /// resolving a virtual name already records a mapping for it.
    pub fn exclude_physical(&self, obj: &K) -> HostExclusion {
        let excluded = controlled_by_other(obj, self.name())
            || self
                .registration
                .excluder
                .as_ref()
                .is_some_and(|excluder| excluder.exclude_physical(obj));
        if excluded {
            return HostExclusion::Excluded;
        }
        if !self.registration.translator.is_managed(obj) {
            return HostExclusion::Unmanaged;
        }
        HostExclusion::Included
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Reconcile one request
    #[instrument(skip(self, request), fields(syncer = %self.registration.name, request = %request))]
    pub async fn reconcile(&self, request: Request) -> Result<Action> {
        let timer = ReconcileTimer::start(self.name());
        let result = self.reconcile_request(&request).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.error(e.error_type()),
        }
        result
    }

    async fn reconcile_request(&self, request: &Request) -> Result<Action> {
        let resolved = match self.resolve(request).await {
            Err(e @ Error::NameMappingConflict { .. }) => {
                return Err(self.mapping_conflict(request, e).await);
            }
            other => other?,
        };
        let Some((virtual_key, host_key)) = resolved else {
            record_action(self.name(), SyncAction::Noop);
            return Ok(Action::await_change());
        };

        let _guard = self.locks.lock(virtual_key.clone()).await;
        let mapping = NameMapping::new(
            self.registration.translator.kind().gvk.clone(),
            virtual_key.clone(),
            host_key.clone(),
        );
        let ctx = self.ctx.with_mapping(mapping);

        let Some(starter) = &self.registration.starter else {
            return self.reconcile_objects(&ctx, &virtual_key, host_key).await;
        };
        let result = match starter.reconcile_start(&ctx, &virtual_key).await {
            Ok(true) => {
                debug!(virtual_key = %virtual_key, "Skipped by starter");
                Ok(Action::await_change())
            }
            Ok(false) => self.reconcile_objects(&ctx, &virtual_key, host_key).await,
            Err(e) => Err(Error::hook(self.name(), "reconcile-start", e.to_string())),
        };
        starter.reconcile_end().await;
        result
    }

    /// Virtual and host key of a request; `None` if there is nothing to reconcile
    async fn resolve(&self, request: &Request) -> Result<Option<(ObjectKey, ObjectKey)>> {
        match request {
            Request::Virtual(key) => {
                let host_key = self.ctx.virtual_to_host(key, None).await?;
                Ok(Some((key.clone(), host_key)))
            }
            Request::Host(host_key) => {
                let host = self.ctx.host_client.get(host_key).await?;
                if let Some(host) = &host {
                    if self.exclude_physical(host) != HostExclusion::Included {
                        debug!(host = %host_key, "Ignoring excluded host object");
                        return Ok(None);
                    }
                }
                let virtual_key = self.ctx.host_to_virtual(host_key, host.as_ref()).await?;
                if virtual_key.is_empty() {
                    debug!(host = %host_key, "No virtual object resolved for host object");
                    return Ok(None);
                }
                Ok(Some((virtual_key, host_key.clone())))
            }
        }
    }

    async fn reconcile_objects(
        &self,
        ctx: &SyncContext<K>,
        virtual_key: &ObjectKey,
        host_key: ObjectKey,
    ) -> Result<Action> {
        let virtual_obj = ctx.virtual_client.get(virtual_key).await?;
        if let Some(v) = &virtual_obj {
            if self.exclude_virtual(v) {
                debug!(virtual_key = %virtual_key, "Ignoring excluded virtual object");
                record_action(self.name(), SyncAction::Noop);
                return Ok(Action::await_change());
            }
        }

        let host_key = match &virtual_obj {
            Some(v) => match ctx.virtual_to_host(virtual_key, Some(v)).await {
                Ok(host_key) => host_key,
                Err(e @ Error::NameMappingConflict { .. }) => {
                    record_action(self.name(), SyncAction::Noop);
                    publish_sync_error(ctx, v, &e).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
            None => host_key,
        };
        let host_obj = if host_key.is_empty() {
            None
        } else {
            ctx.host_client.get(&host_key).await?
        };

        if let Some(h) = &host_obj {
            match self.exclude_physical(h) {
                HostExclusion::Included => {}
                HostExclusion::Excluded => {
                    debug!(host = %host_key, "Ignoring excluded host object");
                    record_action(self.name(), SyncAction::Noop);
                    return Ok(Action::await_change());
                }
                HostExclusion::Unmanaged => {
                    record_action(self.name(), SyncAction::Noop);
                    return match &virtual_obj {
                        Some(v) => Err(self.ownership_conflict(ctx, v, &host_key).await),
                        None => Ok(Action::await_change()),
                    };
                }
            }
        }

        if let Some(cache) = &self.cache {
            if cache.is_stale(Side::Virtual, virtual_key, virtual_obj.as_ref())
                || cache.is_stale(Side::Host, &host_key, host_obj.as_ref())
            {
                debug!(virtual_key = %virtual_key, "Observed an older version than cached, requeue");
                record_action(self.name(), SyncAction::Requeue);
                return Ok(Action::Requeue);
            }
        }

        let action = self
            .decide(ctx, virtual_obj.as_ref(), host_obj.as_ref())
            .await?;

        if let Some(cache) = &self.cache {
            cache.remember(Side::Virtual, virtual_key, virtual_obj.as_ref());
            cache.remember(Side::Host, &host_key, host_obj.as_ref());
        }
        Ok(action)
    }

    /// The decision matrix
    async fn decide(
        &self,
        ctx: &SyncContext<K>,
        virtual_obj: Option<&K>,
        host_obj: Option<&K>,
    ) -> Result<Action> {
        let syncer = &self.registration.syncer;
        match (virtual_obj, host_obj) {
            (Some(v), None) => {
                record_action(self.name(), SyncAction::CreateHost);
                syncer.sync_to_host(ctx, v).await
            }
            (Some(v), Some(h)) => {
                if let Some(action) = self.check_uid(ctx, v, h).await? {
                    return Ok(action);
                }
                record_action(self.name(), SyncAction::UpdateHost);
                syncer.sync(ctx, h, v).await
            }
            (None, Some(h)) => {
                if let Some(up_sync) = &self.registration.up_sync {
                    record_action(self.name(), SyncAction::SyncToVirtual);
                    return up_sync.sync_to_virtual(ctx, h).await;
                }
                if annotation_value(h, SKIP_BACKSYNC_ANNOTATION) == "true" {
                    debug!(host = %ObjectKey::of(h), "Host object is marked to skip back-sync, keeping it");
                    record_action(self.name(), SyncAction::Noop);
                    return Ok(Action::await_change());
                }
                record_action(self.name(), SyncAction::DeleteHost);
                syncer.sync_to_virtual(ctx, h).await
            }
            (None, None) => {
                record_action(self.name(), SyncAction::Noop);
                if let Some(mapping) = ctx.mapping() {
                    ctx.store.delete_mapping(mapping).await?;
                }
                Ok(Action::await_change())
            }
        }
    }

    /// Delete a host copy that was written for an earlier virtual object of the same name
    async fn check_uid(&self, ctx: &SyncContext<K>, v: &K, h: &K) -> Result<Option<Action>> {
        if self.registration.options.disable_uid_deletion {
            return Ok(None);
        }
        let recorded = annotation_value(h, UID_ANNOTATION);
        let current = v.meta().uid.as_deref().unwrap_or_default();
        if recorded.is_empty() || recorded == current {
            return Ok(None);
        }
        let kind = annotation_value(h, KIND_ANNOTATION);
        let own_kind = self.registration.translator.kind().gvk.to_string();
        if !kind.is_empty() && kind != own_kind {
            return Ok(None);
        }

        if is_terminating(h) {
            record_action(self.name(), SyncAction::Requeue);
            return Ok(Some(Action::requeue(TERMINATING_REQUEUE)));
        }
        info!(
            host = %ObjectKey::of(h),
            recorded_uid = recorded,
            virtual_uid = current,
            "Virtual object was recreated, deleting stale host object"
        );
        record_action(self.name(), SyncAction::DeleteHost);
        delete_host_object(ctx, h, Some(v), "virtual object uid is different")
            .await
            .map(Some)
    }

    async fn ownership_conflict(
        &self,
        ctx: &SyncContext<K>,
        virtual_obj: &K,
        host_key: &ObjectKey,
    ) -> Error {
        let err = Error::conflict(ObjectKey::of(virtual_obj), host_key);
        publish_sync_error(ctx, virtual_obj, &err).await;
        err
    }

    /// Report a name clash found while resolving `request` on its virtual object
    async fn mapping_conflict(&self, request: &Request, err: Error) -> Error {
        record_action(self.name(), SyncAction::Noop);
        if let Request::Virtual(key) = request {
            if let Ok(Some(virtual_obj)) = self.ctx.virtual_client.get(key).await {
                publish_sync_error(&self.ctx, &virtual_obj, &err).await;
            }
        }
        err
    }
}

async fn publish_sync_error<K: SyncObject>(ctx: &SyncContext<K>, virtual_obj: &K, err: &Error) {
    ctx.events
        .publish(
            &object_reference(virtual_obj),
            EventType::Warning,
            reasons::SYNC_ERROR,
            actions::SYNC,
            Some(err.to_string()),
        )
        .await;
}
