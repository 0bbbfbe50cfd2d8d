//! Translator family
//!
//! A [`Translator`] decides where a virtual object lives on the host and
//! what its host copy looks like. Three variants cover every kind:
//!
//! - [`NamespacedTranslator`]: renames and moves objects into the host namespace
//! - [`ClusterTranslator`]: renames cluster-scoped objects, no namespace
//! - [`MirrorTranslator`]: keeps identities, only strips server-owned metadata
//!
//! All three accept a naming override for kinds with special identity rules.
//! Translation never mutates its input; results are fresh copies.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use vsync_common::{
    GroupVersionKind, ObjectKey, ResourceKind, SyncConfig, SyncObject, HOST_NAMESPACE_ANNOTATION,
    HOST_NAME_ANNOTATION, KIND_ANNOTATION, NAMESPACE_ANNOTATION, NAME_ANNOTATION,
};

use crate::metadata::{
    apply_annotations, apply_metadata, apply_metadata_update, owner_references,
    reset_object_metadata, translate_labels, translate_labels_cluster, MetadataUpdate,
};
use crate::naming::{annotation, marker, NamingPolicy};

/// Custom host name for a virtual key
pub type HostNameFn = Arc<dyn Fn(&ObjectKey) -> String + Send + Sync>;

/// Identity and metadata translation for kind `K`
pub trait Translator<K: SyncObject>: Send + Sync {
    /// Synchronizer name, used in logs, events and the controller label
    fn name(&self) -> &str;

    /// Kind descriptor
    fn kind(&self) -> &ResourceKind;

    /// Host identity for a virtual identity; empty if the virtual key is empty
    fn virtual_to_host(&self, key: &ObjectKey, obj: Option<&K>) -> ObjectKey;

    /// Virtual identity from the back-reference annotations of a host object.
    ///
    /// `None` if the object has no back-reference or the annotations were
    /// copied from another object or written by another instance.
    fn host_to_virtual_by_annotations(&self, host: &K) -> Option<ObjectKey>;

    /// True if the host object was written by this instance
    fn is_managed(&self, host: &K) -> bool;

    /// Host copy of a virtual object, ready to be created
    fn translate_metadata(&self, virtual_obj: &K) -> K;

    /// Labels and annotations the existing host object should carry
    fn translate_metadata_update(&self, virtual_obj: &K, host: &K) -> MetadataUpdate;
}

/// Settings shared by the renaming translators
#[derive(Clone)]
struct Rules {
    name: String,
    kind: ResourceKind,
    naming: NamingPolicy,
    owner: Option<OwnerReference>,
    sync_labels: Vec<String>,
    excluded_annotations: Vec<String>,
    host_name: Option<HostNameFn>,
}

impl Rules {
    fn new(name: String, kind: ResourceKind, config: &SyncConfig) -> Self {
        Self {
            name,
            kind,
            naming: NamingPolicy::from_config(config),
            owner: config.owner.clone(),
            sync_labels: config.sync_labels.clone(),
            excluded_annotations: Vec::new(),
            host_name: None,
        }
    }

    /// Back-reference of a host object whose marker must equal `expected_marker`
    fn back_reference<K: SyncObject>(&self, host: &K, expected_marker: &str) -> Option<ObjectKey> {
        let name = annotation(host, NAME_ANNOTATION);
        if name.is_empty() {
            return None;
        }

        let current = marker(host);
        if !current.is_empty() && current != expected_marker {
            return None;
        }

        let kind = annotation(host, KIND_ANNOTATION);
        if !kind.is_empty() && kind != self.kind.gvk.to_string() {
            return None;
        }

        let key = ObjectKey::of(host);
        let host_name = annotation(host, HOST_NAME_ANNOTATION);
        if !host_name.is_empty() && host_name != key.name {
            return None;
        }
        let host_namespace = annotation(host, HOST_NAMESPACE_ANNOTATION);
        if !host_namespace.is_empty() && host_namespace != key.namespace {
            return None;
        }

        Some(ObjectKey::new(annotation(host, NAMESPACE_ANNOTATION), name))
    }
}

impl fmt::Debug for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rules")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("naming", &self.naming)
            .field("custom_host_name", &self.host_name.is_some())
            .finish()
    }
}

macro_rules! builder_methods {
    () => {
        /// Annotations that never cross the boundary (scheduler hints and similar)
        pub fn with_excluded_annotations(mut self, excluded: Vec<String>) -> Self {
            self.rules.excluded_annotations = excluded;
            self
        }

        /// Replace the default naming scheme
        pub fn with_host_name(
            mut self,
            host_name: impl Fn(&ObjectKey) -> String + Send + Sync + 'static,
        ) -> Self {
            self.rules.host_name = Some(Arc::new(host_name));
            self
        }

        /// Naming policy of this translator
        pub fn naming(&self) -> &NamingPolicy {
            &self.rules.naming
        }
    };
}

// =============================================================================
// Namespaced
// =============================================================================

/// Translator for namespaced kinds projected into the host namespace
#[derive(Debug)]
pub struct NamespacedTranslator<K> {
    rules: Rules,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SyncObject> NamespacedTranslator<K> {
    /// Translator for the synchronizer `name`
    pub fn new(name: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            rules: Rules::new(name.into(), ResourceKind::of::<K>(true), config),
            _kind: PhantomData,
        }
    }

    builder_methods!();

    fn host_name(&self, key: &ObjectKey) -> String {
        match &self.rules.host_name {
            Some(f) if !key.is_empty() => f(key),
            _ => self.rules.naming.host_name(&key.name, &key.namespace),
        }
    }
}

impl<K: SyncObject> Translator<K> for NamespacedTranslator<K> {
    fn name(&self) -> &str {
        &self.rules.name
    }

    fn kind(&self) -> &ResourceKind {
        &self.rules.kind
    }

    fn virtual_to_host(&self, key: &ObjectKey, _obj: Option<&K>) -> ObjectKey {
        if key.is_empty() {
            return ObjectKey::default();
        }
        ObjectKey::new(self.rules.naming.host_namespace(), self.host_name(key))
    }

    fn host_to_virtual_by_annotations(&self, host: &K) -> Option<ObjectKey> {
        self.rules.back_reference(host, self.rules.naming.suffix())
    }

    fn is_managed(&self, host: &K) -> bool {
        self.rules
            .naming
            .is_managed_with(host, |name, namespace| {
                self.host_name(&ObjectKey::new(namespace, name))
            })
    }

    fn translate_metadata(&self, virtual_obj: &K) -> K {
        let virtual_key = ObjectKey::of(virtual_obj);
        let host_key = self.virtual_to_host(&virtual_key, Some(virtual_obj));
        let vmeta = virtual_obj.meta();

        let mut host = virtual_obj.clone();
        let meta = host.meta_mut();
        reset_object_metadata(meta);
        meta.name = Some(host_key.name.clone());
        if !virtual_key.namespace.is_empty() {
            meta.namespace = Some(host_key.namespace.clone());
            meta.owner_references = owner_references(self.rules.owner.as_ref(), vmeta);
        }

        let annotations = apply_annotations(
            vmeta,
            &GroupVersionKind::of::<K>(),
            Some(&host_key),
            None,
            &self.rules.excluded_annotations,
        );
        let labels = translate_labels(
            &self.rules.naming,
            vmeta.labels.as_ref(),
            &virtual_key.namespace,
            None,
            &self.rules.sync_labels,
        );
        MetadataUpdate {
            changed: true,
            annotations,
            labels,
        }
        .apply_to(meta);
        host
    }

    fn translate_metadata_update(&self, virtual_obj: &K, host: &K) -> MetadataUpdate {
        let vmeta = virtual_obj.meta();
        let hmeta = host.meta();
        let annotations = apply_annotations(
            vmeta,
            &GroupVersionKind::of::<K>(),
            Some(&ObjectKey::of(host)),
            hmeta.annotations.as_ref(),
            &self.rules.excluded_annotations,
        );
        let labels = translate_labels(
            &self.rules.naming,
            vmeta.labels.as_ref(),
            vmeta.namespace.as_deref().unwrap_or_default(),
            hmeta.labels.as_ref(),
            &self.rules.sync_labels,
        );
        apply_metadata_update(hmeta, annotations, labels)
    }
}

// =============================================================================
// Cluster-scoped
// =============================================================================

/// Translator for cluster-scoped kinds; host objects carry the cluster marker
#[derive(Debug)]
pub struct ClusterTranslator<K> {
    rules: Rules,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SyncObject> ClusterTranslator<K> {
    /// Translator for the synchronizer `name`
    pub fn new(name: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            rules: Rules::new(name.into(), ResourceKind::of::<K>(false), config),
            _kind: PhantomData,
        }
    }

    builder_methods!();

    fn host_name(&self, key: &ObjectKey) -> String {
        match &self.rules.host_name {
            Some(f) if !key.is_empty() => f(key),
            _ => self.rules.naming.host_name_cluster(&key.name),
        }
    }
}

impl<K: SyncObject> Translator<K> for ClusterTranslator<K> {
    fn name(&self) -> &str {
        &self.rules.name
    }

    fn kind(&self) -> &ResourceKind {
        &self.rules.kind
    }

    fn virtual_to_host(&self, key: &ObjectKey, _obj: Option<&K>) -> ObjectKey {
        if key.is_empty() {
            return ObjectKey::default();
        }
        ObjectKey::cluster(self.host_name(key))
    }

    fn host_to_virtual_by_annotations(&self, host: &K) -> Option<ObjectKey> {
        self.rules
            .back_reference(host, &self.rules.naming.marker_cluster())
    }

    fn is_managed(&self, host: &K) -> bool {
        self.rules.naming.is_managed_cluster(host)
    }

    fn translate_metadata(&self, virtual_obj: &K) -> K {
        let virtual_key = ObjectKey::of(virtual_obj);
        let host_key = self.virtual_to_host(&virtual_key, Some(virtual_obj));
        let vmeta = virtual_obj.meta();

        let mut host = virtual_obj.clone();
        let meta = host.meta_mut();
        reset_object_metadata(meta);
        meta.name = Some(host_key.name.clone());
        meta.namespace = None;

        let annotations = apply_annotations(
            vmeta,
            &GroupVersionKind::of::<K>(),
            Some(&host_key),
            None,
            &self.rules.excluded_annotations,
        );
        let labels = translate_labels_cluster(
            &self.rules.naming,
            vmeta.labels.as_ref(),
            None,
            &self.rules.sync_labels,
        );
        MetadataUpdate {
            changed: true,
            annotations,
            labels,
        }
        .apply_to(meta);
        host
    }

    fn translate_metadata_update(&self, virtual_obj: &K, host: &K) -> MetadataUpdate {
        let vmeta = virtual_obj.meta();
        let hmeta = host.meta();
        let annotations = apply_annotations(
            vmeta,
            &GroupVersionKind::of::<K>(),
            Some(&ObjectKey::of(host)),
            hmeta.annotations.as_ref(),
            &self.rules.excluded_annotations,
        );
        let labels = translate_labels_cluster(
            &self.rules.naming,
            vmeta.labels.as_ref(),
            hmeta.labels.as_ref(),
            &self.rules.sync_labels,
        );
        apply_metadata_update(hmeta, annotations, labels)
    }
}

// =============================================================================
// Mirror
// =============================================================================

/// Identity-preserving translator for cluster-global kinds.
///
/// Every host object is considered managed; labels and annotations are
/// copied as-is with managed-key bookkeeping.
#[derive(Debug)]
pub struct MirrorTranslator<K> {
    rules: Rules,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SyncObject> MirrorTranslator<K> {
    /// Translator for the synchronizer `name`
    pub fn new(name: impl Into<String>, namespaced: bool, config: &SyncConfig) -> Self {
        Self {
            rules: Rules::new(name.into(), ResourceKind::of::<K>(namespaced), config),
            _kind: PhantomData,
        }
    }

    builder_methods!();
}

impl<K: SyncObject> Translator<K> for MirrorTranslator<K> {
    fn name(&self) -> &str {
        &self.rules.name
    }

    fn kind(&self) -> &ResourceKind {
        &self.rules.kind
    }

    fn virtual_to_host(&self, key: &ObjectKey, _obj: Option<&K>) -> ObjectKey {
        match &self.rules.host_name {
            Some(f) if !key.is_empty() => ObjectKey::new(key.namespace.clone(), f(key)),
            _ => key.clone(),
        }
    }

    fn host_to_virtual_by_annotations(&self, host: &K) -> Option<ObjectKey> {
        Some(ObjectKey::of(host))
    }

    fn is_managed(&self, _host: &K) -> bool {
        true
    }

    fn translate_metadata(&self, obj: &K) -> K {
        let mut copy = obj.clone();
        reset_object_metadata(copy.meta_mut());
        copy
    }

    fn translate_metadata_update(&self, source: &K, target: &K) -> MetadataUpdate {
        let smeta = source.meta();
        let tmeta = target.meta();
        let (labels, annotations) = apply_metadata(
            smeta.annotations.as_ref(),
            tmeta.annotations.as_ref(),
            smeta.labels.as_ref(),
            tmeta.labels.as_ref(),
            &self.rules.excluded_annotations,
        );
        apply_metadata_update(tmeta, annotations, labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::api::scheduling::v1::PriorityClass;
    use k8s_openapi::api::storage::v1::CSIDriver;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use vsync_common::{CONTROLLER_LABEL, MARKER_LABEL, UID_ANNOTATION};

    fn config() -> SyncConfig {
        SyncConfig::new("suffix", "test-ns")
    }

    fn virtual_secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("a".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("123".to_string()),
                resource_version: Some("5".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                finalizers: Some(vec!["example.com/guard".to_string()]),
                ..Default::default()
            },
            data: Some(BTreeMap::new()),
            ..Default::default()
        }
    }

    // =========================================================================
    // Namespaced
    // =========================================================================

    /// Story: a virtual secret gets a deterministic host identity and back-references
    #[test]
    fn story_virtual_secret_is_translated_into_host_namespace() {
        let translator = NamespacedTranslator::<Secret>::new("secret", &config());
        let vobj = virtual_secret();
        let host = translator.translate_metadata(&vobj);

        assert_eq!(host.metadata.name.as_deref(), Some("a-x-default-x-suffix"));
        assert_eq!(host.metadata.namespace.as_deref(), Some("test-ns"));
        assert!(host.metadata.uid.is_none());
        assert!(host.metadata.resource_version.is_none());
        assert!(host.metadata.finalizers.is_none());

        let annotations = host.metadata.annotations.clone().unwrap();
        assert_eq!(annotations[NAME_ANNOTATION], "a");
        assert_eq!(annotations[NAMESPACE_ANNOTATION], "default");
        assert_eq!(annotations[UID_ANNOTATION], "123");
        assert_eq!(host.metadata.labels.clone().unwrap()[MARKER_LABEL], "suffix");

        // source is untouched
        assert_eq!(vobj.metadata.uid.as_deref(), Some("123"));
        assert!(vobj.metadata.annotations.is_none());
    }

    /// Story: host identity resolves back to the virtual identity
    #[test]
    fn story_back_reference_round_trips() {
        let translator = NamespacedTranslator::<Secret>::new("secret", &config());
        let host = translator.translate_metadata(&virtual_secret());
        assert!(translator.is_managed(&host));
        assert_eq!(
            translator.host_to_virtual_by_annotations(&host),
            Some(ObjectKey::new("default", "a"))
        );
    }

    #[test]
    fn back_reference_rejects_foreign_markers_and_copies() {
        let translator = NamespacedTranslator::<Secret>::new("secret", &config());
        let host = translator.translate_metadata(&virtual_secret());

        let mut other_instance = host.clone();
        other_instance
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(MARKER_LABEL.to_string(), "other".to_string());
        assert!(translator.host_to_virtual_by_annotations(&other_instance).is_none());

        let mut copied = host.clone();
        copied.metadata.name = Some("copy".to_string());
        assert!(translator.host_to_virtual_by_annotations(&copied).is_none());
        assert!(!translator.is_managed(&copied));

        let mut unannotated = host;
        unannotated.metadata.annotations = None;
        assert!(translator.host_to_virtual_by_annotations(&unannotated).is_none());
    }

    #[test]
    fn owner_reference_is_attached_to_namespaced_copies() {
        let owner = OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            name: "vcluster".to_string(),
            uid: "owner".to_string(),
            ..Default::default()
        };
        let translator =
            NamespacedTranslator::<Secret>::new("secret", &config().with_owner(owner));
        let host = translator.translate_metadata(&virtual_secret());
        assert_eq!(host.metadata.owner_references.unwrap()[0].name, "vcluster");
    }

    #[test]
    fn metadata_update_is_stable_and_preserves_controller_label() {
        let translator = NamespacedTranslator::<Secret>::new("secret", &config());
        let vobj = virtual_secret();
        let mut host = translator.translate_metadata(&vobj);
        host.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(CONTROLLER_LABEL.to_string(), "secret".to_string());

        let update = translator.translate_metadata_update(&vobj, &host);
        assert!(!update.changed);
        assert_eq!(update.labels[CONTROLLER_LABEL], "secret");

        let mut changed = vobj.clone();
        changed
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("team".to_string(), "b".to_string());
        let update = translator.translate_metadata_update(&changed, &host);
        assert!(update.changed);
        assert_eq!(update.annotations["team"], "b");
    }

    #[test]
    fn naming_override_replaces_default_scheme() {
        let translator = NamespacedTranslator::<Secret>::new("secret", &config())
            .with_host_name(|key| format!("custom-{}", key.name));
        let key = ObjectKey::new("default", "a");
        assert_eq!(
            translator.virtual_to_host(&key, None),
            ObjectKey::new("test-ns", "custom-a")
        );
        let host = translator.translate_metadata(&virtual_secret());
        assert!(translator.is_managed(&host));
        assert_eq!(translator.virtual_to_host(&ObjectKey::default(), None), ObjectKey::default());
    }

    // =========================================================================
    // Cluster-scoped
    // =========================================================================

    #[test]
    fn cluster_scoped_objects_lose_namespace_and_carry_cluster_marker() {
        let translator = ClusterTranslator::<PriorityClass>::new("priorityclass", &config());
        let vobj = PriorityClass {
            metadata: ObjectMeta {
                name: Some("high".to_string()),
                uid: Some("9".to_string()),
                ..Default::default()
            },
            value: 1000,
            ..Default::default()
        };
        let host = translator.translate_metadata(&vobj);

        assert_eq!(host.metadata.name.as_deref(), Some("vcluster-high-x-test-ns-x-suffix"));
        assert!(host.metadata.namespace.is_none());
        assert_eq!(host.value, 1000);
        assert!(translator.is_managed(&host));
        assert_eq!(
            translator.host_to_virtual_by_annotations(&host),
            Some(ObjectKey::cluster("high"))
        );
        assert!(!host
            .metadata
            .annotations
            .unwrap()
            .contains_key(NAMESPACE_ANNOTATION));
    }

    // =========================================================================
    // Mirror
    // =========================================================================

    #[test]
    fn mirror_keeps_identity_and_copies_metadata() {
        let translator = MirrorTranslator::<CSIDriver>::new("csidriver", false, &config());
        let host = CSIDriver {
            metadata: ObjectMeta {
                name: Some("ebs.csi.aws.com".to_string()),
                uid: Some("h1".to_string()),
                resource_version: Some("3".to_string()),
                labels: Some(BTreeMap::from([("tier".to_string(), "storage".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = ObjectKey::of(&host);
        assert_eq!(translator.virtual_to_host(&key, None), key);
        assert_eq!(translator.host_to_virtual_by_annotations(&host), Some(key));
        assert!(translator.is_managed(&host));

        let copy = translator.translate_metadata(&host);
        assert_eq!(copy.metadata.name, host.metadata.name);
        assert!(copy.metadata.uid.is_none());
        assert_eq!(copy.metadata.labels, host.metadata.labels);

        let mut stale = copy.clone();
        stale.metadata.labels = None;
        let update = translator.translate_metadata_update(&host, &stale);
        assert!(update.changed);
        assert_eq!(update.labels["tier"], "storage");
    }
}
