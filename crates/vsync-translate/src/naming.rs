//! Deterministic host naming
//!
//! [`NamingPolicy`] is built from the engine's [`SyncConfig`] and carries the
//! two values every naming decision depends on: the instance suffix and the
//! host namespace. Two policies with different values can coexist in one
//! process.

use kube::Resource;
use tracing::debug;

use vsync_common::kube_utils::{safe_concat_name, sha256_hex};
use vsync_common::{
    GroupVersionKind, SyncConfig, KIND_ANNOTATION, LABEL_PREFIX, MARKER_LABEL,
    NAMESPACE_ANNOTATION, NAME_ANNOTATION,
};

/// Naming and ownership rules of one engine instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingPolicy {
    suffix: String,
    host_namespace: String,
}

impl NamingPolicy {
    /// Policy with an explicit suffix and host namespace
    pub fn new(suffix: impl Into<String>, host_namespace: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            host_namespace: host_namespace.into(),
        }
    }

    /// Policy for an engine configuration
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.name.clone(), config.host_namespace.clone())
    }

    /// Instance suffix, also the marker label value for namespaced objects
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Namespace every namespaced virtual object is projected into
    pub fn host_namespace(&self) -> &str {
        &self.host_namespace
    }

    /// Host name of a namespaced virtual object, empty if `name` is empty.
    ///
    /// Parts that could be mistaken for the `-x-` separator get a digest of
    /// the full identity appended, so `c/a-x-b` and `b-x-c/a` stay apart.
    pub fn host_name(&self, name: &str, namespace: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        if is_separator_ambiguous(name) || is_separator_ambiguous(namespace) {
            let digest = sha256_hex(&format!("{namespace}/{name}"));
            return safe_concat_name(&[name, "x", namespace, "x", &self.suffix, &digest[..10]]);
        }
        safe_concat_name(&[name, "x", namespace, "x", &self.suffix])
    }

    /// Host name of a cluster-scoped virtual object, empty if `name` is empty
    pub fn host_name_cluster(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        if is_separator_ambiguous(name) {
            let digest = sha256_hex(name);
            return safe_concat_name(&[
                "vcluster",
                name,
                "x",
                &self.host_namespace,
                "x",
                &self.suffix,
                &digest[..10],
            ]);
        }
        safe_concat_name(&["vcluster", name, "x", &self.host_namespace, "x", &self.suffix])
    }

    /// Host key of a virtual label key
    pub fn label_key(&self, key: &str) -> String {
        let digest = sha256_hex(key);
        safe_concat_name(&[LABEL_PREFIX, &self.suffix, "x", &digest[..10]])
    }

    /// Host key of a virtual label key on a cluster-scoped object
    pub fn label_key_cluster(&self, key: &str) -> String {
        let digest = sha256_hex(key);
        safe_concat_name(&[
            LABEL_PREFIX,
            &self.host_namespace,
            "x",
            &self.suffix,
            "x",
            &digest[..10],
        ])
    }

    /// Marker label value for cluster-scoped host objects
    pub fn marker_cluster(&self) -> String {
        safe_concat_name(&[&self.host_namespace, "x", &self.suffix])
    }

    /// True if a namespaced host object was written by this instance with the default naming
    pub fn is_managed<K: Resource<DynamicType = ()>>(&self, obj: &K) -> bool {
        self.is_managed_with(obj, |name, namespace| self.host_name(name, namespace))
    }

    /// True if a namespaced host object was written by this instance.
    ///
    /// `expected_name` maps the back-reference annotations (name, namespace)
    /// to the host name the object must carry; a copied or renamed object
    /// fails this check.
    pub fn is_managed_with<K, F>(&self, obj: &K, expected_name: F) -> bool
    where
        K: Resource<DynamicType = ()>,
        F: Fn(&str, &str) -> String,
    {
        let meta = obj.meta();
        let namespace = meta.namespace.as_deref().unwrap_or_default();
        if !namespace.is_empty() && namespace != self.host_namespace {
            return false;
        }
        if label(obj, MARKER_LABEL) != self.suffix {
            return false;
        }

        let virtual_name = annotation(obj, NAME_ANNOTATION);
        if virtual_name.is_empty() {
            return false;
        }
        let expected = expected_name(virtual_name, annotation(obj, NAMESPACE_ANNOTATION));
        let name = meta.name.as_deref().unwrap_or_default();
        if name != expected {
            debug!(
                object = name,
                expected_name = %expected,
                "Host object doesn't match, because name annotation is wrong"
            );
            return false;
        }

        let kind = annotation(obj, KIND_ANNOTATION);
        if !kind.is_empty() && kind != GroupVersionKind::of::<K>().to_string() {
            debug!(object = name, existing_kind = kind, "Host object kind annotation doesn't match");
            return false;
        }
        true
    }

    /// True if a cluster-scoped host object carries this instance's cluster marker
    pub fn is_managed_cluster<K: Resource>(&self, obj: &K) -> bool {
        label(obj, MARKER_LABEL) == self.marker_cluster()
    }
}

/// True if a name part contains or borders on the `-x-` separator
fn is_separator_ambiguous(part: &str) -> bool {
    part.contains("-x-") || part.starts_with("x-") || part.ends_with("-x")
}

fn label<'a, K: Resource>(obj: &'a K, key: &str) -> &'a str {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

pub(crate) fn annotation<'a, K: Resource>(obj: &'a K, key: &str) -> &'a str {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

pub(crate) fn marker<'a, K: Resource>(obj: &'a K) -> &'a str {
    label(obj, MARKER_LABEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn policy() -> NamingPolicy {
        NamingPolicy::new("suffix", "test-ns")
    }

    fn host_secret(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Secret {
        let map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("test-ns".to_string()),
                labels: Some(map(labels)),
                annotations: Some(map(annotations)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn host_names_follow_the_concat_scheme() {
        let p = policy();
        assert_eq!(p.host_name("a", "default"), "a-x-default-x-suffix");
        assert_eq!(p.host_name("", "default"), "");
        assert_eq!(p.host_name_cluster("high"), "vcluster-high-x-test-ns-x-suffix");
        assert_eq!(p.marker_cluster(), "test-ns-x-suffix");
    }

    #[test]
    fn distinct_identities_never_share_a_host_name() {
        let p = policy();
        let long = "n".repeat(70);
        assert_ne!(p.host_name(&long, "ns-a"), p.host_name(&long, "ns-b"));
        assert_eq!(p.host_name(&long, "ns-a").len(), 63);
    }

    #[test]
    fn separator_lookalikes_get_distinct_host_names() {
        let p = policy();
        let first = p.host_name("a-x-b", "c");
        let second = p.host_name("a", "b-x-c");
        assert_ne!(first, second);
        assert!(first.starts_with("a-x-b-x-c-x-suffix-"));
        assert_ne!(first, "a-x-b-x-c-x-suffix");

        // a trailing or leading "x" segment borders the separator
        assert_ne!(p.host_name("a-x", "b"), p.host_name("a", "x-b"));
        assert_ne!(p.host_name_cluster("a-x-b"), p.host_name_cluster("a-x-c"));
        assert_eq!(p.host_name("web", "default"), "web-x-default-x-suffix");
    }

    #[test]
    fn label_keys_are_prefixed_and_hashed() {
        let p = policy();
        let key = p.label_key("app");
        assert!(key.starts_with("vcluster.loft.sh/label-suffix-x-"));
        assert_eq!(key.len(), "vcluster.loft.sh/label-suffix-x-".len() + 10);
        assert_ne!(key, p.label_key("tier"));
        assert!(p.label_key_cluster("app").starts_with("vcluster.loft.sh/label-test-ns-x-suffix-x-"));
    }

    #[test]
    fn managed_objects_are_recognized() {
        let p = policy();
        let managed = host_secret(
            "a-x-default-x-suffix",
            &[(MARKER_LABEL, "suffix")],
            &[(NAME_ANNOTATION, "a"), (NAMESPACE_ANNOTATION, "default")],
        );
        assert!(p.is_managed(&managed));
    }

    #[test]
    fn copied_or_foreign_objects_are_not_managed() {
        let p = policy();

        // renamed copy keeps the annotations of the original
        let copied = host_secret(
            "copy",
            &[(MARKER_LABEL, "suffix")],
            &[(NAME_ANNOTATION, "a"), (NAMESPACE_ANNOTATION, "default")],
        );
        assert!(!p.is_managed(&copied));

        let other_instance = host_secret(
            "a-x-default-x-suffix",
            &[(MARKER_LABEL, "other")],
            &[(NAME_ANNOTATION, "a"), (NAMESPACE_ANNOTATION, "default")],
        );
        assert!(!p.is_managed(&other_instance));

        let no_marker = host_secret("a-x-default-x-suffix", &[], &[]);
        assert!(!p.is_managed(&no_marker));

        let wrong_kind = host_secret(
            "a-x-default-x-suffix",
            &[(MARKER_LABEL, "suffix")],
            &[
                (NAME_ANNOTATION, "a"),
                (NAMESPACE_ANNOTATION, "default"),
                (KIND_ANNOTATION, "/v1, Kind=ConfigMap"),
            ],
        );
        assert!(!p.is_managed(&wrong_kind));
    }

    #[test]
    fn cluster_marker_decides_cluster_ownership() {
        let p = policy();
        let mut obj = host_secret("x", &[(MARKER_LABEL, "test-ns-x-suffix")], &[]);
        obj.metadata.namespace = None;
        assert!(p.is_managed_cluster(&obj));
        assert!(!NamingPolicy::new("suffix", "other-ns").is_managed_cluster(&obj));
    }
}
