//! Per-kind pluggable interpretation strategies.
//!
//! The interpreter is an external collaborator: the pipeline only asks
//! whether a hook exists for (kind, operation) and invokes it. The fake
//! implementation registers closures per kind, builder style.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ReviseReplica,
    Retain,
    InterpretDependency,
    InterpretStatus,
    InterpretHealth,
    AggregateStatus,
}

/// Lookup key for hook registration: apiVersion + kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KindRef {
    pub api_version: String,
    pub kind: String,
}

impl KindRef {
    pub fn of(manifest: &Manifest) -> Self {
        Self {
            api_version: manifest.api_version().to_string(),
            kind: manifest.kind().to_string(),
        }
    }
}

impl std::fmt::Display for KindRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentObjectReference {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedStatusItem {
    pub cluster_name: String,
    pub status: Option<Value>,
    pub applied: bool,
}

pub trait ResourceInterpreter: Send + Sync {
    fn hook_enabled(&self, kind: &KindRef, operation: Operation) -> bool;

    /// Rewrite the per-cluster desired replica figure into the manifest.
    fn revise_replica(
        &self,
        manifest: Manifest,
        replicas: i64,
        cluster: &str,
    ) -> Result<Manifest, SyncError>;

    /// Kind-specific retention on top of the generic retain pass.
    fn retain(&self, desired: Manifest, observed: &Manifest) -> Result<Manifest, SyncError>;

    fn get_dependencies(
        &self,
        manifest: &Manifest,
    ) -> Result<Vec<DependentObjectReference>, SyncError>;

    fn reflect_status(&self, manifest: &Manifest) -> Result<Option<Value>, SyncError>;

    fn interpret_health(&self, manifest: &Manifest) -> Result<bool, SyncError>;

    fn aggregate_status(
        &self,
        manifest: Manifest,
        items: &[AggregatedStatusItem],
    ) -> Result<Manifest, SyncError>;
}

type ReviseReplicaFn = Box<dyn Fn(Manifest, i64, &str) -> Result<Manifest, SyncError> + Send + Sync>;
type RetainFn = Box<dyn Fn(Manifest, &Manifest) -> Result<Manifest, SyncError> + Send + Sync>;
type DependenciesFn =
    Box<dyn Fn(&Manifest) -> Result<Vec<DependentObjectReference>, SyncError> + Send + Sync>;
type ReflectStatusFn = Box<dyn Fn(&Manifest) -> Result<Option<Value>, SyncError> + Send + Sync>;
type InterpretHealthFn = Box<dyn Fn(&Manifest) -> Result<bool, SyncError> + Send + Sync>;
type AggregateStatusFn =
    Box<dyn Fn(Manifest, &[AggregatedStatusItem]) -> Result<Manifest, SyncError> + Send + Sync>;

/// Closure-backed interpreter; a hook is enabled iff one was registered for
/// the kind. With no registrations it is the "no hooks anywhere" interpreter.
#[derive(Default)]
pub struct FakeInterpreter {
    revise_replica: FxHashMap<KindRef, ReviseReplicaFn>,
    retain: FxHashMap<KindRef, RetainFn>,
    dependencies: FxHashMap<KindRef, DependenciesFn>,
    reflect_status: FxHashMap<KindRef, ReflectStatusFn>,
    interpret_health: FxHashMap<KindRef, InterpretHealthFn>,
    aggregate_status: FxHashMap<KindRef, AggregateStatusFn>,
}

impl FakeInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_revise_replica<F>(mut self, kind: KindRef, f: F) -> Self
    where
        F: Fn(Manifest, i64, &str) -> Result<Manifest, SyncError> + Send + Sync + 'static,
    {
        self.revise_replica.insert(kind, Box::new(f));
        self
    }

    pub fn with_retain<F>(mut self, kind: KindRef, f: F) -> Self
    where
        F: Fn(Manifest, &Manifest) -> Result<Manifest, SyncError> + Send + Sync + 'static,
    {
        self.retain.insert(kind, Box::new(f));
        self
    }

    pub fn with_get_dependencies<F>(mut self, kind: KindRef, f: F) -> Self
    where
        F: Fn(&Manifest) -> Result<Vec<DependentObjectReference>, SyncError>
            + Send
            + Sync
            + 'static,
    {
        self.dependencies.insert(kind, Box::new(f));
        self
    }

    pub fn with_reflect_status<F>(mut self, kind: KindRef, f: F) -> Self
    where
        F: Fn(&Manifest) -> Result<Option<Value>, SyncError> + Send + Sync + 'static,
    {
        self.reflect_status.insert(kind, Box::new(f));
        self
    }

    pub fn with_interpret_health<F>(mut self, kind: KindRef, f: F) -> Self
    where
        F: Fn(&Manifest) -> Result<bool, SyncError> + Send + Sync + 'static,
    {
        self.interpret_health.insert(kind, Box::new(f));
        self
    }

    pub fn with_aggregate_status<F>(mut self, kind: KindRef, f: F) -> Self
    where
        F: Fn(Manifest, &[AggregatedStatusItem]) -> Result<Manifest, SyncError>
            + Send
            + Sync
            + 'static,
    {
        self.aggregate_status.insert(kind, Box::new(f));
        self
    }

    fn missing(kind: &KindRef, operation: Operation) -> SyncError {
        SyncError::Internal(format!("no {:?} hook registered for {}", operation, kind))
    }
}

impl ResourceInterpreter for FakeInterpreter {
    fn hook_enabled(&self, kind: &KindRef, operation: Operation) -> bool {
        match operation {
            Operation::ReviseReplica => self.revise_replica.contains_key(kind),
            Operation::Retain => self.retain.contains_key(kind),
            Operation::InterpretDependency => self.dependencies.contains_key(kind),
            Operation::InterpretStatus => self.reflect_status.contains_key(kind),
            Operation::InterpretHealth => self.interpret_health.contains_key(kind),
            Operation::AggregateStatus => self.aggregate_status.contains_key(kind),
        }
    }

    fn revise_replica(
        &self,
        manifest: Manifest,
        replicas: i64,
        cluster: &str,
    ) -> Result<Manifest, SyncError> {
        let kind = KindRef::of(&manifest);
        let f = self
            .revise_replica
            .get(&kind)
            .ok_or_else(|| Self::missing(&kind, Operation::ReviseReplica))?;
        f(manifest, replicas, cluster)
    }

    fn retain(&self, desired: Manifest, observed: &Manifest) -> Result<Manifest, SyncError> {
        let kind = KindRef::of(observed);
        let f = self
            .retain
            .get(&kind)
            .ok_or_else(|| Self::missing(&kind, Operation::Retain))?;
        f(desired, observed)
    }

    fn get_dependencies(
        &self,
        manifest: &Manifest,
    ) -> Result<Vec<DependentObjectReference>, SyncError> {
        let kind = KindRef::of(manifest);
        let f = self
            .dependencies
            .get(&kind)
            .ok_or_else(|| Self::missing(&kind, Operation::InterpretDependency))?;
        f(manifest)
    }

    fn reflect_status(&self, manifest: &Manifest) -> Result<Option<Value>, SyncError> {
        let kind = KindRef::of(manifest);
        let f = self
            .reflect_status
            .get(&kind)
            .ok_or_else(|| Self::missing(&kind, Operation::InterpretStatus))?;
        f(manifest)
    }

    fn interpret_health(&self, manifest: &Manifest) -> Result<bool, SyncError> {
        let kind = KindRef::of(manifest);
        let f = self
            .interpret_health
            .get(&kind)
            .ok_or_else(|| Self::missing(&kind, Operation::InterpretHealth))?;
        f(manifest)
    }

    fn aggregate_status(
        &self,
        manifest: Manifest,
        items: &[AggregatedStatusItem],
    ) -> Result<Manifest, SyncError> {
        let kind = KindRef::of(&manifest);
        let f = self
            .aggregate_status
            .get(&kind)
            .ok_or_else(|| Self::missing(&kind, Operation::AggregateStatus))?;
        f(manifest, items)
    }
}
