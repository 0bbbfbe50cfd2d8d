//! Object identities shared by every layer of the engine
//!
//! An [`ObjectKey`] names an object on one side (virtual or host); a
//! [`NameMapping`] ties a virtual key to a host key for one kind.

use std::fmt;

use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Any typed Kubernetes object the engine can synchronize.
///
/// Implemented automatically for k8s-openapi types and `kube::CustomResource`
/// derived types with a static type descriptor.
pub trait SyncObject:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> SyncObject for T where
    T: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// (namespace, name) of an object; namespace is empty for cluster-scoped kinds
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace, empty for cluster-scoped objects
    #[serde(default)]
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// True if the key names nothing
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Namespace as an option, `None` for cluster-scoped keys
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Group, version and kind of a resource type
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
}

impl GroupVersionKind {
    /// Descriptor of a typed resource
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        }
    }

    /// `apiVersion` as written on objects (`v1`, `storage.k8s.io/v1`)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    // Matches the apimachinery rendering ("/v1, Kind=Secret") so kind
    // annotations stay compatible with objects written by other tooling.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

/// A resource type plus the scope information the translators need
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    /// Group, version and kind
    pub gvk: GroupVersionKind,
    /// Plural resource name (`secrets`)
    pub plural: String,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

impl ResourceKind {
    /// Descriptor of a typed resource with explicit scope
    pub fn of<K: Resource<DynamicType = ()>>(namespaced: bool) -> Self {
        Self {
            gvk: GroupVersionKind::of::<K>(),
            plural: K::plural(&()).into_owned(),
            namespaced,
        }
    }

    /// Kind name (`Secret`)
    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.gvk.fmt(f)
    }
}

/// An object key qualified by its kind, used as an index key in the mapping store
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindedKey {
    /// Kind of the object
    pub gvk: GroupVersionKind,
    /// Namespace and name
    pub key: ObjectKey,
}

impl KindedKey {
    /// Qualify a key with a kind
    pub fn new(gvk: GroupVersionKind, key: ObjectKey) -> Self {
        Self { gvk, key }
    }

    /// True if the key names nothing
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl fmt::Display for KindedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.gvk.kind, self.key)
    }
}

/// Correspondence between a virtual and a host identity of one kind
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameMapping {
    /// Kind both objects belong to
    pub gvk: GroupVersionKind,
    /// Identity in the virtual cluster
    pub virtual_key: ObjectKey,
    /// Identity in the host cluster
    pub host_key: ObjectKey,
}

impl NameMapping {
    /// Build a mapping
    pub fn new(gvk: GroupVersionKind, virtual_key: ObjectKey, host_key: ObjectKey) -> Self {
        Self {
            gvk,
            virtual_key,
            host_key,
        }
    }

    /// The virtual side as a kinded key
    pub fn virtual_object(&self) -> KindedKey {
        KindedKey::new(self.gvk.clone(), self.virtual_key.clone())
    }

    /// The host side as a kinded key
    pub fn host_object(&self) -> KindedKey {
        KindedKey::new(self.gvk.clone(), self.host_key.clone())
    }

    /// True if neither side is known
    pub fn is_empty(&self) -> bool {
        self.virtual_key.is_empty() && self.host_key.is_empty()
    }

    /// True if both sides are known
    pub fn is_complete(&self) -> bool {
        !self.virtual_key.is_empty() && !self.host_key.is_empty()
    }
}

impl fmt::Display for NameMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{}",
            self.gvk, self.virtual_key, self.host_key
        )
    }
}
