//! Kubernetes Event recording for synchronizers.
//!
//! Events land on the virtual object so tenants see why their object was
//! not projected (`kubectl describe` in the virtual cluster).
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "SyncError")
    /// * `action` - What action was taken (e.g. "Sync")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `<syncer>-syncer`.
    pub fn new(client: Client, syncer_name: &str) -> Self {
        let reporter = Reporter {
            controller: format!("{syncer_name}-syncer"),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// The object could not be synchronized
    pub const SYNC_ERROR: &str = "SyncError";
    /// The host copy was removed
    pub const DELETED_HOST_OBJECT: &str = "DeletedHostObject";
    /// A host copy was created
    pub const CREATED_HOST_OBJECT: &str = "CreatedHostObject";
}

/// Well-known event action strings.
pub mod actions {
    /// Synchronizing virtual and host objects
    pub const SYNC: &str = "Sync";
    /// Deleting an object
    pub const DELETE: &str = "Delete";
    /// Creating an object
    pub const CREATE: &str = "Create";
}
