//! Exclusion predicate
//!
//! Decides whether an observed object belongs to the synchronizer that is
//! reconciling it. An object controlled by another synchronizer is never
//! touched; a host object this instance did not write is either ignored or,
//! when a virtual object wants its name, reported as a conflict.

use kube::Resource;

use vsync_common::CONTROLLER_LABEL;

/// Outcome of checking a host object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostExclusion {
    /// Owned by this synchronizer
    Included,
    /// Owned by another synchronizer or rejected by an excluder
    Excluded,
    /// Not written by this instance
    Unmanaged,
}

/// Value of a label, empty if unset
pub fn label_value<'a, K: Resource>(obj: &'a K, key: &str) -> &'a str {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

/// Value of an annotation, empty if unset
pub fn annotation_value<'a, K: Resource>(obj: &'a K, key: &str) -> &'a str {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

/// Synchronizer named by the controlled-by label or annotation
pub fn controlled_by<K: Resource>(obj: &K) -> Option<&str> {
    [
        label_value(obj, CONTROLLER_LABEL),
        annotation_value(obj, CONTROLLER_LABEL),
    ]
    .into_iter()
    .find(|v| !v.is_empty())
}

/// True if another synchronizer than `syncer` controls the object
pub fn controlled_by_other<K: Resource>(obj: &K, syncer: &str) -> bool {
    controlled_by(obj).is_some_and(|owner| owner != syncer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Secret {
        let map = |pairs: &[(&str, &str)]| {
            Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            )
        };
        Secret {
            metadata: ObjectMeta {
                name: Some("a".to_string()),
                labels: map(labels),
                annotations: map(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn unmarked_objects_belong_to_everyone() {
        let obj = secret(&[], &[]);
        assert_eq!(controlled_by(&obj), None);
        assert!(!controlled_by_other(&obj, "secret"));
    }

    #[test]
    fn marker_in_label_or_annotation_excludes_other_syncers() {
        let by_label = secret(&[(CONTROLLER_LABEL, "ingress")], &[]);
        let by_annotation = secret(&[], &[(CONTROLLER_LABEL, "ingress")]);

        for obj in [&by_label, &by_annotation] {
            assert_eq!(controlled_by(obj), Some("ingress"));
            assert!(controlled_by_other(obj, "secret"));
            assert!(!controlled_by_other(obj, "ingress"));
        }
    }
}
