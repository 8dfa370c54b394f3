//! Flotilla work reconciler: the control loop that converges one Work's
//! manifests against its target cluster, plus the queue and worker pool
//! driving it.

#![forbid(unsafe_code)]

pub mod cache;
pub mod events;
pub mod queue;
pub mod reconciler;

pub use cache::{LiveObjectCache, ObjectCache};
pub use events::{Event, EventKind, EventSink, MemoryEventSink, TracingEventSink};
pub use queue::{run_workers, RequeuePolicy, WorkQueue};
pub use reconciler::WorkReconciler;

use async_trait::async_trait;

use flotilla_cluster::memory::MemoryCluster;
use flotilla_core::{Manifest, ResourceKey, SyncError};

/// The fake cluster doubles as its own informer cache in tests.
#[async_trait]
impl ObjectCache for MemoryCluster {
    async fn get(
        &self,
        _cluster: &str,
        key: &ResourceKey,
    ) -> Result<Option<Manifest>, SyncError> {
        Ok(self.lookup(key))
    }
}
