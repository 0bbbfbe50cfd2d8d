//! Shared Kubernetes helpers: deterministic naming, hashing, metadata checks
//! and client construction.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};

use crate::Error;

/// Maximum length of a DNS-1123 label, the limit for most object names
pub const MAX_NAME_LENGTH: usize = 63;

// =============================================================================
// Naming
// =============================================================================

/// Hex encoded SHA-256 of the input.
///
/// The output is persisted in object names and label keys.
pub fn sha256_hex(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Join name parts with `-`, hashing the result if it exceeds 63 characters.
///
/// Long names keep their first 52 characters and get the first 10 hex
/// characters of the SHA-256 of the full joined string appended, so two
/// different inputs sharing a prefix still produce different names. A `.`
/// directly before the separator is dropped to keep the result valid.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }

    let digest = sha256_hex(&full);
    let prefix: String = full.chars().take(52).collect();
    format!("{}-{}", prefix, &digest[..10]).replace(".-", "-")
}

// =============================================================================
// Metadata checks
// =============================================================================

/// True if the object carries a deletion timestamp
pub fn is_terminating<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Reference to an object for event recording
pub fn object_reference<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    obj.object_ref(&())
}

/// True if `cached` was observed at a newer resource version than `fetched`.
///
/// Resource versions are opaque strings; they are compared numerically when
/// both parse, which holds for the etcd-backed API server. Anything else is
/// treated as not newer.
pub fn newer_resource_version<K: Resource>(cached: &K, fetched: &K) -> bool {
    let parse = |obj: &K| {
        obj.meta()
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
    };
    match (parse(cached), parse(fetched)) {
        (Some(cached), Some(fetched)) => cached > fetched,
        _ => false,
    }
}

// =============================================================================
// Client construction
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients, must exceed the watch timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path.
///
/// Without a path the configuration is inferred (in-cluster service account
/// or `KUBECONFIG`), which is how the host cluster is reached.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn secret_with_version(rv: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("a".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn short_names_are_joined() {
        assert_eq!(safe_concat_name(&["a", "x", "default", "x", "suffix"]), "a-x-default-x-suffix");
    }

    #[test]
    fn long_names_are_truncated_and_hashed() {
        let long = "a".repeat(80);
        let name = safe_concat_name(&[&long, "x", "default", "x", "suffix"]);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with(&"a".repeat(52)));

        // Same prefix, different tail must not collide
        let other = safe_concat_name(&[&long, "x", "other", "x", "suffix"]);
        assert_ne!(name, other);
    }

    #[test]
    fn dot_before_separator_is_removed() {
        let mut base = "b".repeat(51);
        base.push('.');
        let name = safe_concat_name(&[&base, "padding-that-makes-this-too-long-for-a-label"]);
        assert!(!name.contains(".-"));
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn terminating_objects_are_detected() {
        let mut secret = secret_with_version("1");
        assert!(!is_terminating(&secret));
        secret.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(is_terminating(&secret));
    }

    #[test]
    fn resource_versions_compare_numerically() {
        assert!(newer_resource_version(&secret_with_version("10"), &secret_with_version("9")));
        assert!(!newer_resource_version(&secret_with_version("9"), &secret_with_version("10")));
        assert!(!newer_resource_version(&secret_with_version("abc"), &secret_with_version("1")));
    }
}
