//! Reconciliation engine for vsync synchronizers
//!
//! A kind registers a translator and a [`Syncer`] in a [`Registration`];
//! [`SyncController`] reconciles each request against both clusters and
//! [`SyncerRunner`] wires the watches, the dedup queue and the bounded
//! worker pool around it. [`FakeSyncController`] covers kinds whose
//! virtual objects are synthesized from other virtual objects.

#![deny(missing_docs)]

pub mod cache;
pub mod context;
pub mod dispatch;
pub mod exclude;
pub mod fake;
pub mod host;
pub mod reconcile;
pub mod runner;
pub mod types;

pub use context::SyncContext;
pub use dispatch::{run_workers, KeyedLock, WorkQueue, WorkerOptions};
pub use exclude::HostExclusion;
pub use fake::{FakeSyncController, FakeSyncer};
pub use reconcile::SyncController;
pub use runner::{watch_kind, Observed, SyncerRunner, WatchSources, WATCH_TIMEOUT_SECS};
pub use types::{
    Action, ControllerModifier, Initializer, ObjectExcluder, Registration, Request, Starter,
    Syncer, SyncerOptions, UpSyncHandler,
};
