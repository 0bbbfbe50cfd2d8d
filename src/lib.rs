//! vsync - keeps objects of a virtual cluster in step with a host namespace
//!
//! The engine itself lives in the workspace crates (`vsync-translate`,
//! `vsync-mappings`, `vsync-syncer`). This crate wires concrete resource
//! kinds into it and provides the start-up helpers the binary uses.

#![deny(missing_docs)]

pub mod retry;
pub mod syncers;
