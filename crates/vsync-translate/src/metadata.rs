//! Metadata rewriting across the virtual/host boundary
//!
//! Annotations are copied with bookkeeping: the host copy lists the keys it
//! took from the virtual object in [`MANAGED_ANNOTATIONS_ANNOTATION`], so a
//! later update can drop keys that were removed from the virtual object
//! without touching keys that only ever existed on the host.
//!
//! Labels are rewritten to prefixed, hashed keys so virtual label selectors
//! can never match unrelated host objects.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use vsync_common::{
    GroupVersionKind, ObjectKey, CONTROLLER_LABEL, HOST_NAMESPACE_ANNOTATION,
    HOST_NAME_ANNOTATION, KIND_ANNOTATION, MANAGED_ANNOTATIONS_ANNOTATION,
    MANAGED_LABELS_ANNOTATION, MARKER_LABEL, NAMESPACE_ANNOTATION, NAMESPACE_LABEL,
    NAME_ANNOTATION, UID_ANNOTATION,
};

use crate::naming::NamingPolicy;

/// String map used for labels and annotations
pub type StringMap = BTreeMap<String, String>;

/// Annotations owned by the engine itself; never copied from a source object
const IDENTITY_ANNOTATIONS: [&str; 6] = [
    NAME_ANNOTATION,
    UID_ANNOTATION,
    KIND_ANNOTATION,
    NAMESPACE_ANNOTATION,
    HOST_NAME_ANNOTATION,
    HOST_NAMESPACE_ANNOTATION,
];

/// Result of recomputing metadata against an existing target object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataUpdate {
    /// True if `annotations` or `labels` differ from the target object
    pub changed: bool,
    /// Annotations the target should carry
    pub annotations: StringMap,
    /// Labels the target should carry
    pub labels: StringMap,
}

impl MetadataUpdate {
    /// Write the computed labels and annotations into object metadata
    pub fn apply_to(self, meta: &mut ObjectMeta) {
        meta.annotations = non_empty(self.annotations);
        meta.labels = non_empty(self.labels);
    }
}

fn non_empty(map: StringMap) -> Option<StringMap> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Clear everything the API server owns, keeping name, namespace, labels and annotations
pub fn reset_object_metadata(meta: &mut ObjectMeta) {
    meta.generate_name = None;
    meta.self_link = None;
    meta.uid = None;
    meta.resource_version = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.owner_references = None;
    meta.finalizers = None;
    meta.managed_fields = None;
}

/// Owner reference to the owning workload, if one is configured and complete.
///
/// The reference is marked as controller when the virtual object itself has
/// a controlling owner.
pub fn owner_references(
    owner: Option<&OwnerReference>,
    virtual_meta: &ObjectMeta,
) -> Option<Vec<OwnerReference>> {
    let owner = owner?;
    if owner.name.is_empty()
        || owner.uid.is_empty()
        || owner.api_version.is_empty()
        || owner.kind.is_empty()
    {
        return None;
    }

    let is_controller = virtual_meta
        .owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true));
    Some(vec![OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(is_controller),
        block_owner_deletion: None,
    }])
}

/// Merge `from` into `to`, returning the merged map and the sorted,
/// newline-joined list of keys taken from `from`.
///
/// Excluded keys are never copied from `from`; on `to` they survive when
/// their value is non-empty. Keys of `to` that were copied before
/// (`previously_managed`) are dropped unless `from` still has them.
fn apply_maps(
    from: Option<&StringMap>,
    to: Option<&StringMap>,
    previously_managed: &str,
    excluded: &[&str],
) -> (StringMap, String) {
    let mut merged = StringMap::new();
    let mut managed = Vec::new();

    for (key, value) in from.into_iter().flatten() {
        if excluded.contains(&key.as_str()) {
            continue;
        }
        merged.insert(key.clone(), value.clone());
        managed.push(key.as_str());
    }

    for (key, value) in to.into_iter().flatten() {
        if excluded.contains(&key.as_str()) {
            if !value.is_empty() {
                merged.insert(key.clone(), value.clone());
            }
            continue;
        }
        if managed.contains(&key.as_str()) || previously_managed.split('\n').any(|k| k == key) {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }

    managed.sort_unstable();
    (merged, managed.join("\n"))
}

fn set_or_remove(map: &mut StringMap, key: &str, value: &str) {
    if value.is_empty() {
        map.remove(key);
    } else {
        map.insert(key.to_string(), value.to_string());
    }
}

/// Annotations for a host object translated from `virtual_meta`.
///
/// `target` is the current host annotation map (`None` on create). The
/// result carries the back-reference annotations (name, namespace, uid,
/// kind) and, when `host_key` is given, the expected host identity.
pub fn apply_annotations(
    virtual_meta: &ObjectMeta,
    kind: &GroupVersionKind,
    host_key: Option<&ObjectKey>,
    target: Option<&StringMap>,
    excluded: &[String],
) -> StringMap {
    let mut excluded_keys: Vec<&str> = vec![MANAGED_ANNOTATIONS_ANNOTATION, MANAGED_LABELS_ANNOTATION];
    excluded_keys.extend(IDENTITY_ANNOTATIONS);
    excluded_keys.extend(excluded.iter().map(String::as_str));

    let previously_managed = target
        .and_then(|t| t.get(MANAGED_ANNOTATIONS_ANNOTATION))
        .map(String::as_str)
        .unwrap_or_default();
    let (mut merged, managed) = apply_maps(
        virtual_meta.annotations.as_ref(),
        target,
        previously_managed,
        &excluded_keys,
    );
    set_or_remove(&mut merged, MANAGED_ANNOTATIONS_ANNOTATION, &managed);

    merged.insert(
        NAME_ANNOTATION.to_string(),
        virtual_meta.name.clone().unwrap_or_default(),
    );
    merged.insert(
        UID_ANNOTATION.to_string(),
        virtual_meta.uid.clone().unwrap_or_default(),
    );
    set_or_remove(
        &mut merged,
        NAMESPACE_ANNOTATION,
        virtual_meta.namespace.as_deref().unwrap_or_default(),
    );
    merged.insert(KIND_ANNOTATION.to_string(), kind.to_string());

    if let Some(host_key) = host_key {
        merged.insert(HOST_NAME_ANNOTATION.to_string(), host_key.name.clone());
        set_or_remove(&mut merged, HOST_NAMESPACE_ANNOTATION, &host_key.namespace);
    }
    merged
}

/// Merge labels and annotations from a source into a target object, with
/// managed-key bookkeeping for both maps.
///
/// Returns `(labels, annotations)`. Used where an object is copied without
/// renaming keys (mirrored kinds, back-sync).
pub fn apply_metadata(
    from_annotations: Option<&StringMap>,
    to_annotations: Option<&StringMap>,
    from_labels: Option<&StringMap>,
    to_labels: Option<&StringMap>,
    excluded_annotations: &[String],
) -> (StringMap, StringMap) {
    let mut excluded: Vec<&str> = vec![MANAGED_ANNOTATIONS_ANNOTATION, MANAGED_LABELS_ANNOTATION];
    excluded.extend(excluded_annotations.iter().map(String::as_str));

    let previous = |key: &str| {
        to_annotations
            .and_then(|t| t.get(key))
            .map(String::as_str)
            .unwrap_or_default()
    };
    let (mut annotations, managed_annotations) = apply_maps(
        from_annotations,
        to_annotations,
        previous(MANAGED_ANNOTATIONS_ANNOTATION),
        &excluded,
    );
    set_or_remove(&mut annotations, MANAGED_ANNOTATIONS_ANNOTATION, &managed_annotations);

    let (labels, managed_labels) = apply_maps(
        from_labels,
        to_labels,
        previous(MANAGED_LABELS_ANNOTATION),
        &[MANAGED_ANNOTATIONS_ANNOTATION, MANAGED_LABELS_ANNOTATION],
    );
    set_or_remove(&mut annotations, MANAGED_LABELS_ANNOTATION, &managed_labels);

    (labels, annotations)
}

/// True if `key` is selected by a sync label pattern (`prefix/*` or an exact key)
fn sync_label_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(prefix) => key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/')),
        None => pattern == key,
    }
}

fn rewrite_labels(
    virtual_labels: Option<&StringMap>,
    target_labels: Option<&StringMap>,
    sync_labels: &[String],
    convert: impl Fn(&str) -> String,
) -> StringMap {
    let mut labels = StringMap::new();
    for (key, value) in virtual_labels.into_iter().flatten() {
        labels.insert(convert(key), value.clone());
    }
    for (key, value) in virtual_labels.into_iter().flatten() {
        if sync_labels.iter().any(|p| sync_label_matches(p, key)) {
            labels.insert(key.clone(), value.clone());
        }
    }

    if let Some(controller) = target_labels
        .and_then(|t| t.get(CONTROLLER_LABEL))
        .filter(|c| !c.is_empty())
    {
        labels.insert(CONTROLLER_LABEL.to_string(), controller.clone());
    }
    labels
}

/// Labels for a namespaced host object.
///
/// Virtual keys are rewritten, `sync_labels` are copied verbatim, the
/// controller label of the current host object survives, and the marker and
/// virtual namespace labels are set.
pub fn translate_labels(
    naming: &NamingPolicy,
    virtual_labels: Option<&StringMap>,
    virtual_namespace: &str,
    target_labels: Option<&StringMap>,
    sync_labels: &[String],
) -> StringMap {
    let mut labels = rewrite_labels(virtual_labels, target_labels, sync_labels, |k| {
        naming.label_key(k)
    });
    labels.insert(MARKER_LABEL.to_string(), naming.suffix().to_string());
    set_or_remove(&mut labels, NAMESPACE_LABEL, virtual_namespace);
    labels
}

/// Labels for a cluster-scoped host object
pub fn translate_labels_cluster(
    naming: &NamingPolicy,
    virtual_labels: Option<&StringMap>,
    target_labels: Option<&StringMap>,
    sync_labels: &[String],
) -> StringMap {
    let mut labels = rewrite_labels(virtual_labels, target_labels, sync_labels, |k| {
        naming.label_key_cluster(k)
    });
    labels.insert(MARKER_LABEL.to_string(), naming.marker_cluster());
    labels
}

/// Compare recomputed labels and annotations with the current target metadata
pub fn apply_metadata_update(
    target_meta: &ObjectMeta,
    annotations: StringMap,
    labels: StringMap,
) -> MetadataUpdate {
    // An absent map and an empty map are the same state
    let changed = target_meta.annotations.clone().unwrap_or_default() != annotations
        || target_meta.labels.clone().unwrap_or_default() != labels;
    MetadataUpdate {
        changed,
        annotations,
        labels,
    }
}
