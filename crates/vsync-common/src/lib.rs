//! Common types for vsync: object identities, cluster clients, errors and telemetry

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod object;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{KubeObjectClient, ObjectClient};
pub use config::SyncConfig;
pub use error::Error;
pub use object::{GroupVersionKind, KindedKey, NameMapping, ObjectKey, ResourceKind, SyncObject};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Annotations written onto host objects
// =============================================================================

/// Name of the virtual object a host object was translated from
pub const NAME_ANNOTATION: &str = "vcluster.loft.sh/object-name";

/// Namespace of the virtual object a host object was translated from
pub const NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-namespace";

/// UID of the virtual object a host object was translated from
pub const UID_ANNOTATION: &str = "vcluster.loft.sh/object-uid";

/// Group/version/kind of the virtual object a host object was translated from
pub const KIND_ANNOTATION: &str = "vcluster.loft.sh/object-kind";

/// Expected host name, used to reject copied or renamed host objects
pub const HOST_NAME_ANNOTATION: &str = "vcluster.loft.sh/object-host-name";

/// Expected host namespace, used to reject copied or moved host objects
pub const HOST_NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-host-namespace";

/// Newline separated list of annotation keys copied from the virtual object
pub const MANAGED_ANNOTATIONS_ANNOTATION: &str = "vcluster.loft.sh/managed-annotations";

/// Newline separated list of label keys copied from the virtual object
pub const MANAGED_LABELS_ANNOTATION: &str = "vcluster.loft.sh/managed-labels";

/// When set to "true" a host object survives the deletion of its virtual object
pub const SKIP_BACKSYNC_ANNOTATION: &str = "vcluster.loft.sh/skip-backsync";

// =============================================================================
// Labels
// =============================================================================

/// Ownership marker, value is the instance name (or the cluster marker)
pub const MARKER_LABEL: &str = "vcluster.loft.sh/managed-by";

/// Virtual namespace of a namespaced host object
pub const NAMESPACE_LABEL: &str = "vcluster.loft.sh/namespace";

/// Names the synchronizer that owns an object; objects owned by another one are excluded
pub const CONTROLLER_LABEL: &str = "vcluster.loft.sh/controlled-by";

/// Prefix for rewritten virtual label keys
pub const LABEL_PREFIX: &str = "vcluster.loft.sh/label";
