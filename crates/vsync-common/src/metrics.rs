//! Metrics registry for vsync observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciliation outcome and latency per synchronizer
//! - Actions taken by the decision matrix
//! - Name mapping store size and garbage collection

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for vsync metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("vsync"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of reconciliation duration
///
/// Labels:
/// - `syncer`: synchronizer name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("vsync_reconcile_duration_seconds")
        .with_description("Duration of object reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `syncer`: synchronizer name
/// - `error_type`: transient, permanent, panic
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vsync_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of decision matrix actions
///
/// Labels:
/// - `syncer`: synchronizer name
/// - `action`: see [`SyncAction`]
pub static SYNC_ACTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vsync_sync_actions_total")
        .with_description("Total number of synchronization actions by type")
        .with_unit("{actions}")
        .build()
});

// ============================================================================
// Mapping Store Metrics
// ============================================================================

/// Gauge of name mappings held by the store
pub static MAPPINGS_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("vsync_mappings_total")
        .with_description("Number of name mappings in the store")
        .with_unit("{mappings}")
        .build()
});

/// Counter of mappings removed by garbage collection
pub static MAPPINGS_GC_REMOVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vsync_mappings_gc_removed_total")
        .with_description("Total number of name mappings removed by garbage collection")
        .with_unit("{mappings}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Labels for the decision matrix action metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Virtual object translated and created on the host
    CreateHost,
    /// Both sides present, handed to the update handler
    UpdateHost,
    /// Host object removed
    DeleteHost,
    /// Host-only object handed to the up-sync handler
    SyncToVirtual,
    /// Pass deferred to a later requeue
    Requeue,
    /// Nothing to do
    Noop,
}

impl SyncAction {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateHost => "create_host",
            Self::UpdateHost => "update_host",
            Self::DeleteHost => "delete_host",
            Self::SyncToVirtual => "sync_to_virtual",
            Self::Requeue => "requeue",
            Self::Noop => "noop",
        }
    }
}

/// Record a decision matrix action
pub fn record_action(syncer: &str, action: SyncAction) {
    SYNC_ACTIONS.add(
        1,
        &[
            KeyValue::new("syncer", syncer.to_string()),
            KeyValue::new("action", action.as_str()),
        ],
    );
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a reconciliation with timing
pub struct ReconcileTimer {
    syncer: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(syncer: impl Into<String>) -> Self {
        Self {
            syncer: syncer.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("syncer", self.syncer),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("syncer", self.syncer.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("syncer", self.syncer),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_labels() {
        assert_eq!(SyncAction::CreateHost.as_str(), "create_host");
        assert_eq!(SyncAction::SyncToVirtual.as_str(), "sync_to_virtual");
        assert_eq!(SyncAction::Noop.as_str(), "noop");
    }

    #[test]
    fn timers_record_without_provider() {
        // Without a meter provider the global meter is a no-op
        ReconcileTimer::start("secret").success();
        ReconcileTimer::start("secret").error("transient");
        record_action("secret", SyncAction::Requeue);
        MAPPINGS_TOTAL.record(3, &[]);
    }
}
