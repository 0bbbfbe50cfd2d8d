//! Name mappings between virtual and host objects
//!
//! The [`Store`] keeps every known virtual/host pair, persists it through a
//! [`Backend`] and garbage collects pairs whose objects are gone. Mappers
//! resolve names per kind and record what they resolve.

#![deny(missing_docs)]

pub mod backend;
pub mod existence;
pub mod mapper;
pub mod store;

pub use backend::{Backend, BackendEvent, BackendEventType, Mapping, MemoryBackend};
pub use existence::{KubeObjectExistence, ObjectExistence};
pub use mapper::{GenericMapper, Mapper, Recorder};
pub use store::{Store, VerifyMapping, GARBAGE_COLLECTION_INTERVAL};
