//! Engine configuration
//!
//! One [`SyncConfig`] value is built at start-up and handed to every
//! translator and controller. Nothing in the engine reads process-global
//! naming state, so several independently configured engines can share a
//! process.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::Deserialize;

/// Default number of reconciliations running in parallel per kind
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 10;

/// Default interval between mapping garbage collection runs
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(180);

/// Default upper bound for requeue delays
pub const DEFAULT_REQUEUE_CEILING: Duration = Duration::from_secs(300);

/// Translation policy and runtime knobs for one engine instance
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Instance name, used as naming suffix and ownership marker value
    pub name: String,

    /// Host namespace all namespaced virtual objects are projected into
    pub host_namespace: String,

    /// Owning workload; namespaced host objects get an owner reference to it
    #[serde(skip)]
    pub owner: Option<OwnerReference>,

    /// Virtual label keys copied verbatim to the host (`prefix/*` matches a prefix)
    pub sync_labels: Vec<String>,

    /// Parallel reconciliations per kind
    pub max_concurrent_reconciles: usize,

    /// Interval between mapping garbage collection runs
    #[serde(with = "duration_secs")]
    pub gc_interval: Duration,

    /// Upper bound for error backoff and explicit requeue delays
    #[serde(with = "duration_secs")]
    pub requeue_ceiling: Duration,

    /// First delay after a failed reconciliation
    #[serde(with = "duration_secs")]
    pub error_backoff_base: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            name: "vcluster".to_string(),
            host_namespace: "vcluster".to_string(),
            owner: None,
            sync_labels: Vec::new(),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            gc_interval: DEFAULT_GC_INTERVAL,
            requeue_ceiling: DEFAULT_REQUEUE_CEILING,
            error_backoff_base: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    /// Config for an instance named `name` projecting into `host_namespace`
    pub fn new(name: impl Into<String>, host_namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host_namespace: host_namespace.into(),
            ..Default::default()
        }
    }

    /// Set the owning workload reference
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Set the labels that are copied verbatim
    pub fn with_sync_labels(mut self, labels: Vec<String>) -> Self {
        self.sync_labels = labels;
        self
    }

    /// Clamp a requeue delay to the configured ceiling
    pub fn clamp_requeue(&self, delay: Duration) -> Duration {
        delay.min(self.requeue_ceiling)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
