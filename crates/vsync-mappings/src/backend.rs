//! Persistence for name mappings
//!
//! A [`Backend`] stores [`Mapping`] records and streams changes so several
//! store instances (one per replica) converge. Every record carries the id of
//! the store that wrote it; a store ignores events it caused itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use vsync_common::{NameMapping, Result};

/// A persisted name mapping and the extra mappings it owns
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// The owning virtual/host pair
    #[serde(flatten)]
    pub name_mapping: NameMapping,

    /// Pairs recorded while reconciling the owner (referenced secrets, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<NameMapping>,

    /// Id of the store that last wrote this record
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
}

impl Mapping {
    /// Record for a pair without references
    pub fn new(name_mapping: NameMapping) -> Self {
        Self {
            name_mapping,
            references: Vec::new(),
            sender: String::new(),
        }
    }

    /// Attach references
    pub fn with_references(mut self, references: Vec<NameMapping>) -> Self {
        self.references = references;
        self
    }

    /// Set the writer id
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name_mapping.fmt(f)
    }
}

/// Change type of a backend event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendEventType {
    /// Record created or replaced
    Update,
    /// Record removed
    Delete,
}

/// One change observed on the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendEvent {
    /// Change type
    pub event_type: BackendEventType,
    /// Record after the change (for deletes: the removed record)
    pub mapping: Mapping,
}

/// Stream of event batches; an `Err` item reports a broken watch
pub type BackendWatch = BoxStream<'static, Result<Vec<BackendEvent>>>;

/// Durable storage for mappings
#[async_trait]
pub trait Backend: Send + Sync {
    /// All stored records
    async fn list(&self) -> Result<Vec<Mapping>>;

    /// Create or replace a record
    async fn save(&self, mapping: &Mapping) -> Result<()>;

    /// Remove a record; removing a missing record is not an error
    async fn delete(&self, mapping: &Mapping) -> Result<()>;

    /// Stream changes made after the call
    async fn watch(&self) -> Result<BackendWatch>;
}

type WatchSender = mpsc::UnboundedSender<Result<Vec<BackendEvent>>>;

/// Process-local backend; mappings do not survive a restart
#[derive(Default)]
pub struct MemoryBackend {
    mappings: Mutex<HashMap<NameMapping, Mapping>>,
    watches: Mutex<Vec<WatchSender>>,
}

impl MemoryBackend {
    /// Empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open watches
    pub fn watch_count(&self) -> usize {
        self.watches
            .lock()
            .map(|mut w| {
                w.retain(|tx| !tx.is_closed());
                w.len()
            })
            .unwrap_or_default()
    }

    fn notify(&self, event: BackendEvent) {
        if let Ok(mut watches) = self.watches.lock() {
            watches.retain(|tx| tx.unbounded_send(Ok(vec![event.clone()])).is_ok());
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list(&self) -> Result<Vec<Mapping>> {
        Ok(self
            .mappings
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save(&self, mapping: &Mapping) -> Result<()> {
        if let Ok(mut mappings) = self.mappings.lock() {
            mappings.insert(mapping.name_mapping.clone(), mapping.clone());
        }
        self.notify(BackendEvent {
            event_type: BackendEventType::Update,
            mapping: mapping.clone(),
        });
        Ok(())
    }

    async fn delete(&self, mapping: &Mapping) -> Result<()> {
        if let Ok(mut mappings) = self.mappings.lock() {
            mappings.remove(&mapping.name_mapping);
        }
        self.notify(BackendEvent {
            event_type: BackendEventType::Delete,
            mapping: mapping.clone(),
        });
        Ok(())
    }

    async fn watch(&self) -> Result<BackendWatch> {
        let (tx, rx) = mpsc::unbounded();
        if let Ok(mut watches) = self.watches.lock() {
            watches.push(tx);
        }
        Ok(rx.boxed())
    }
}
