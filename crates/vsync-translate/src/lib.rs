//! Translation between virtual and host objects
//!
//! Naming ([`NamingPolicy`]), metadata rewriting ([`metadata`]), label
//! selector rewriting ([`selector`]) and the per-kind [`Translator`] family.

#![deny(missing_docs)]

pub mod metadata;
pub mod naming;
pub mod selector;
pub mod translator;

pub use metadata::MetadataUpdate;
pub use naming::NamingPolicy;
pub use translator::{
    ClusterTranslator, HostNameFn, MirrorTranslator, NamespacedTranslator, Translator,
};
