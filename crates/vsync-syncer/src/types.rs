//! Synchronizer contract and registration
//!
//! A kind plugs into the engine with a [`Registration`]: a translator, a
//! [`Syncer`] for the directional handlers and optional lifecycle hooks.
//! Hooks are plain `Option` fields so the capability set of a kind is
//! visible at registration time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use vsync_common::{ObjectKey, Result, SyncObject};
use vsync_translate::Translator;

use crate::context::SyncContext;
use crate::host;
use crate::runner::WatchSources;

/// What the dispatch layer should do after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Wait for the next watch event
    AwaitChange,
    /// Requeue with the error backoff of the identity
    Requeue,
    /// Requeue after a fixed delay (capped by the configured ceiling)
    RequeueAfter(Duration),
}

impl Action {
    /// Wait for the next watch event
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// Requeue after `after`
    pub fn requeue(after: Duration) -> Self {
        Self::RequeueAfter(after)
    }

    /// True unless the pass waits for a change
    pub fn is_requeue(&self) -> bool {
        !matches!(self, Self::AwaitChange)
    }
}

/// A reconciliation request
///
/// Host requests come from host watch events; the core resolves the
/// virtual identity from the host object before reconciling.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Request {
    /// Identity of a virtual object
    Virtual(ObjectKey),
    /// Identity of a host object
    Host(ObjectKey),
}

impl Request {
    /// The key carried by the request
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Virtual(key) | Self::Host(key) => key,
        }
    }

    /// True for requests triggered by host objects
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host(_))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Virtual(key) => write!(f, "{key}"),
            Self::Host(key) => write!(f, "host#{key}"),
        }
    }
}

/// Directional handlers of one kind
#[async_trait]
pub trait Syncer<K: SyncObject>: Send + Sync {
    /// The virtual object exists, the host object does not
    async fn sync_to_host(&self, ctx: &SyncContext<K>, virtual_obj: &K) -> Result<Action>;

    /// Both objects exist and belong together
    async fn sync(&self, ctx: &SyncContext<K>, host: &K, virtual_obj: &K) -> Result<Action>;

    /// The host object exists, the virtual object does not; deletes the host copy by default
    async fn sync_to_virtual(&self, ctx: &SyncContext<K>, host: &K) -> Result<Action> {
        host::delete_host_object(ctx, host, None, "virtual object was deleted").await
    }
}

// =============================================================================
// Lifecycle hooks
// =============================================================================

/// Runs around every pass, before any object is fetched
#[async_trait]
pub trait Starter<K: SyncObject>: Send + Sync {
    /// Return `true` to skip the pass
    async fn reconcile_start(&self, ctx: &SyncContext<K>, key: &ObjectKey) -> Result<bool>;

    /// Always runs after [`Starter::reconcile_start`], even when it failed or skipped
    async fn reconcile_end(&self);
}

/// Adds watch sources to the controller of a kind
pub trait ControllerModifier<K: SyncObject>: Send + Sync {
    /// Register extra sources; they emit requests for this kind
    fn modify_controller(&self, ctx: &SyncContext<K>, sources: &mut WatchSources) -> Result<()>;
}

/// Extra exclusion rules of a kind, checked on top of the ownership marker
pub trait ObjectExcluder<K: SyncObject>: Send + Sync {
    /// True if the virtual object must be left alone
    fn exclude_virtual(&self, obj: &K) -> bool;

    /// True if the host object must be left alone
    fn exclude_physical(&self, obj: &K) -> bool;
}

/// One-time set-up before the first pass
#[async_trait]
pub trait Initializer<K: SyncObject>: Send + Sync {
    /// Prepare the kind (create host prerequisites, warm caches)
    async fn init(&self, ctx: &SyncContext<K>) -> Result<()>;
}

/// Creates virtual objects from host objects for host-authoritative kinds
#[async_trait]
pub trait UpSyncHandler<K: SyncObject>: Send + Sync {
    /// The host object exists, the virtual object does not
    async fn sync_to_virtual(&self, ctx: &SyncContext<K>, host: &K) -> Result<Action>;
}

/// Behaviour switches of a kind
#[derive(Clone, Debug, Default)]
pub struct SyncerOptions {
    /// Keep host objects whose recorded virtual UID differs from the virtual object
    pub disable_uid_deletion: bool,
    /// Cache the last seen objects and requeue passes that observe older versions
    pub object_caching: bool,
}

/// Everything the engine needs to run one kind
pub struct Registration<K: SyncObject> {
    /// Synchronizer name
    pub name: String,
    /// Identity and metadata translation
    pub translator: Arc<dyn Translator<K>>,
    /// Directional handlers
    pub syncer: Arc<dyn Syncer<K>>,
    /// Optional pre/post pass hook
    pub starter: Option<Arc<dyn Starter<K>>>,
    /// Optional extra watch sources
    pub modifier: Option<Arc<dyn ControllerModifier<K>>>,
    /// Optional extra exclusion rules
    pub excluder: Option<Arc<dyn ObjectExcluder<K>>>,
    /// Optional one-time set-up
    pub initializer: Option<Arc<dyn Initializer<K>>>,
    /// Optional host-to-virtual creation
    pub up_sync: Option<Arc<dyn UpSyncHandler<K>>>,
    /// Behaviour switches
    pub options: SyncerOptions,
}

impl<K: SyncObject> Registration<K> {
    /// Registration named after the translator, without hooks
    pub fn new(translator: Arc<dyn Translator<K>>, syncer: Arc<dyn Syncer<K>>) -> Self {
        Self {
            name: translator.name().to_string(),
            translator,
            syncer,
            starter: None,
            modifier: None,
            excluder: None,
            initializer: None,
            up_sync: None,
            options: SyncerOptions::default(),
        }
    }

    /// Set the starter hook
    pub fn with_starter(mut self, starter: Arc<dyn Starter<K>>) -> Self {
        self.starter = Some(starter);
        self
    }

    /// Set the controller modifier
    pub fn with_modifier(mut self, modifier: Arc<dyn ControllerModifier<K>>) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// Set extra exclusion rules
    pub fn with_excluder(mut self, excluder: Arc<dyn ObjectExcluder<K>>) -> Self {
        self.excluder = Some(excluder);
        self
    }

    /// Set the initializer
    pub fn with_initializer(mut self, initializer: Arc<dyn Initializer<K>>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Set the up-sync handler
    pub fn with_up_sync(mut self, handler: Arc<dyn UpSyncHandler<K>>) -> Self {
        self.up_sync = Some(handler);
        self
    }

    /// Set behaviour switches
    pub fn with_options(mut self, options: SyncerOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_requests_render_with_prefix() {
        let virt = Request::Virtual(ObjectKey::new("default", "a"));
        let host = Request::Host(ObjectKey::new("test-ns", "a-x-default-x-suffix"));
        assert_eq!(virt.to_string(), "default/a");
        assert_eq!(host.to_string(), "host#test-ns/a-x-default-x-suffix");
        assert!(host.is_host());
        assert_eq!(virt.key().name, "a");
    }

    #[test]
    fn only_await_change_stops_requeueing() {
        assert!(!Action::await_change().is_requeue());
        assert!(Action::Requeue.is_requeue());
        assert!(Action::requeue(Duration::from_secs(1)).is_requeue());
    }
}
