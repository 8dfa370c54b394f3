//! Flotilla dispatcher: applies one manifest to one member cluster with
//! optimistic-concurrency conflict resolution and per-cluster version
//! tracking for drift detection.

#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{allow_update, object_needs_update, Dispatcher};
pub use registry::VersionRegistry;
