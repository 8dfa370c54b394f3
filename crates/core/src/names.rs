//! Deterministic name derivation for Works and execution namespaces.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::error::SyncError;

/// Per-cluster execution namespaces are `flotilla-es-<cluster>`.
const EXECUTION_NAMESPACE_PREFIX: &str = "flotilla-es-";

fn stable_hash(parts: &[&str]) -> u32 {
    let mut hasher = FxHasher::default();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish() as u32
}

/// Stable Work name for a resource template. Identical input always yields
/// the identical name, so regeneration upserts instead of duplicating.
pub fn work_name(kind: &str, name: &str, namespace: Option<&str>) -> String {
    let base = match namespace {
        Some(ns) => format!("{}-{}", ns, name),
        None => name.to_string(),
    };
    format!(
        "{}-{}-{:08x}",
        base.to_ascii_lowercase(),
        kind.to_ascii_lowercase(),
        stable_hash(&[kind, namespace.unwrap_or(""), name])
    )
}

pub fn execution_namespace(cluster: &str) -> String {
    format!("{}{}", EXECUTION_NAMESPACE_PREFIX, cluster)
}

/// Recover the target cluster from a Work's namespace.
pub fn cluster_from_execution_namespace(namespace: &str) -> Result<String, SyncError> {
    namespace
        .strip_prefix(EXECUTION_NAMESPACE_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            SyncError::Internal(format!(
                "namespace {} is not an execution namespace",
                namespace
            ))
        })
}

/// Label value linking a Work back to its owning binding.
pub fn binding_reference_key(namespace: Option<&str>, name: &str) -> String {
    format!("{:08x}", stable_hash(&[namespace.unwrap_or(""), name]))
}
