//! Control-plane Work store.
//!
//! The store behaves like the orchestrator's own API: writes are optimistic
//! (a stale `resource_version` is a conflict), status is a separate write,
//! and deletion honors finalizers. A Work with pending cleanup is only
//! marked deletion-requested until its last finalizer is cleared.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use flotilla_core::names;
use flotilla_core::work::{BINDING_NAME_ANNOTATION, BINDING_NAMESPACE_ANNOTATION, BINDING_REFERENCE_LABEL};
use flotilla_core::{SyncError, Work};

#[async_trait]
pub trait WorkStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Work>, SyncError>;

    async fn create(&self, work: Work) -> Result<Work, SyncError>;

    /// Full-object write (spec, labels, annotations, finalizers). Status is
    /// untouched; a stale resource version is a conflict.
    async fn update(&self, work: Work) -> Result<Work, SyncError>;

    /// Status-only write; a stale resource version is a conflict.
    async fn update_status(&self, work: Work) -> Result<Work, SyncError>;

    /// Request deletion. With finalizers present the Work is only marked;
    /// it is reclaimed when the last finalizer is removed.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), SyncError>;

    /// Works owned by a binding, via the back-reference label with the
    /// annotation double-check guarding against reference-key collisions.
    async fn list_by_binding(
        &self,
        binding_namespace: Option<&str>,
        binding_name: &str,
    ) -> Result<Vec<Work>, SyncError>;
}

#[derive(Default)]
struct Inner {
    works: FxHashMap<(String, String), Work>,
    next_rv: u64,
    fail_updates: u32,
    fail_status_updates: u32,
}

impl Inner {
    fn bump_rv(&mut self) -> u64 {
        self.next_rv += 1;
        self.next_rv
    }
}

#[derive(Default)]
pub struct MemoryWorkStore {
    inner: Mutex<Inner>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().works.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities of every stored Work, for resync sweeps.
    pub fn all_refs(&self) -> Vec<flotilla_core::WorkRef> {
        let inner = self.inner.lock().unwrap();
        let mut refs: Vec<_> = inner.works.values().map(Work::work_ref).collect();
        refs.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        refs
    }

    /// Make the next `n` full-object writes conflict, as if a concurrent
    /// writer kept winning.
    pub fn fail_next_updates(&self, n: u32) {
        self.inner.lock().unwrap().fail_updates = n;
    }

    /// Make the next `n` status writes conflict, as if a concurrent writer
    /// kept winning.
    pub fn fail_next_status_updates(&self, n: u32) {
        self.inner.lock().unwrap().fail_status_updates = n;
    }
}

fn key_of(work: &Work) -> (String, String) {
    (work.namespace.clone(), work.name.clone())
}

fn stale(work: &Work) -> SyncError {
    SyncError::Conflict(format!(
        "work {}/{} resourceVersion {} is stale",
        work.namespace, work.name, work.resource_version
    ))
}

#[async_trait]
impl WorkStore for MemoryWorkStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Work>, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .works
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, mut work: Work) -> Result<Work, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let key = key_of(&work);
        if inner.works.contains_key(&key) {
            return Err(SyncError::Conflict(format!(
                "work {}/{} already exists",
                work.namespace, work.name
            )));
        }
        work.resource_version = inner.bump_rv();
        work.deletion_requested = false;
        inner.works.insert(key, work.clone());
        Ok(work)
    }

    async fn update(&self, work: Work) -> Result<Work, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_updates > 0 {
            inner.fail_updates -= 1;
            return Err(stale(&work));
        }
        let key = key_of(&work);
        let current = inner
            .works
            .get(&key)
            .ok_or_else(|| SyncError::NotFound(format!("work {}/{}", work.namespace, work.name)))?;
        if current.resource_version != work.resource_version {
            return Err(stale(&work));
        }

        let mut next = work;
        next.status = current.status.clone();
        next.deletion_requested = current.deletion_requested;
        if next.deletion_requested && next.finalizers.is_empty() {
            // last finalizer cleared on a deletion-requested Work: reclaim it
            debug!(work = %next.work_ref(), "work reclaimed");
            inner.works.remove(&key);
            return Ok(next);
        }
        next.resource_version = inner.bump_rv();
        inner.works.insert(key, next.clone());
        Ok(next)
    }

    async fn update_status(&self, work: Work) -> Result<Work, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_status_updates > 0 {
            inner.fail_status_updates -= 1;
            return Err(stale(&work));
        }
        let key = key_of(&work);
        let current = inner
            .works
            .get(&key)
            .ok_or_else(|| SyncError::NotFound(format!("work {}/{}", work.namespace, work.name)))?;
        if current.resource_version != work.resource_version {
            return Err(stale(&work));
        }
        let mut next = current.clone();
        next.status = work.status;
        next.resource_version = inner.bump_rv();
        inner.works.insert(key, next.clone());
        Ok(next)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = inner.works.get(&key).cloned() else {
            return Err(SyncError::NotFound(format!("work {}/{}", namespace, name)));
        };
        if current.finalizers.is_empty() {
            inner.works.remove(&key);
        } else {
            let mut marked = current;
            marked.deletion_requested = true;
            marked.resource_version = inner.bump_rv();
            inner.works.insert(key, marked);
        }
        Ok(())
    }

    async fn list_by_binding(
        &self,
        binding_namespace: Option<&str>,
        binding_name: &str,
    ) -> Result<Vec<Work>, SyncError> {
        let reference = names::binding_reference_key(binding_namespace, binding_name);
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Work> = inner
            .works
            .values()
            .filter(|w| w.labels.get(BINDING_REFERENCE_LABEL) == Some(&reference))
            .filter(|w| {
                // reference keys are hashes; confirm via annotations
                w.annotations.get(BINDING_NAME_ANNOTATION).map(String::as_str)
                    == Some(binding_name)
                    && w.annotations
                        .get(BINDING_NAMESPACE_ANNOTATION)
                        .map(String::as_str)
                        == binding_namespace
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(out)
    }
}
