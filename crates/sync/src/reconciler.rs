//! Per-Work reconciliation state machine.
//!
//! Active: apply every manifest through the dispatcher and summarize into
//! the Applied condition. Deleting: clean up remote objects, then release
//! the finalizer. A Work missing from the store is already done.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics::histogram;
use tracing::{info, warn};

use flotilla_cluster::ClusterGateway;
use flotilla_core::work::{
    set_status_condition, EXECUTION_FINALIZER, REASON_APPLIED_FAILED, REASON_APPLIED_SUCCESSFUL,
    WORK_APPLIED_CONDITION, WORK_NAME_LABEL,
};
use flotilla_core::{
    names, retry_on_conflict, AggregateError, BackoffPolicy, Condition, ConditionStatus, Manifest,
    ResourceKey, SyncError, Work, WorkRef,
};
use flotilla_dispatch::Dispatcher;
use flotilla_store::WorkStore;

use crate::cache::ObjectCache;
use crate::events::{EventKind, EventSink};

pub const EVENT_REASON_SYNC_SUCCEED: &str = "SyncWorkloadSucceed";
pub const EVENT_REASON_SYNC_FAILED: &str = "SyncWorkloadFailed";

pub struct WorkReconciler {
    store: Arc<dyn WorkStore>,
    dispatcher: Arc<Dispatcher>,
    gateway: Arc<dyn ClusterGateway>,
    cache: Arc<dyn ObjectCache>,
    events: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
}

impl WorkReconciler {
    pub fn new(
        store: Arc<dyn WorkStore>,
        dispatcher: Arc<Dispatcher>,
        gateway: Arc<dyn ClusterGateway>,
        cache: Arc<dyn ObjectCache>,
        events: Arc<dyn EventSink>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            dispatcher,
            gateway,
            cache,
            events,
            backoff,
        }
    }

    /// One full pass for the referenced Work. An error means the caller
    /// should requeue; a missing Work means there is nothing left to do.
    pub async fn reconcile(&self, work_ref: &WorkRef) -> Result<(), SyncError> {
        let Some(work) = self.store.get(&work_ref.namespace, &work_ref.name).await? else {
            return Ok(());
        };
        let cluster = names::cluster_from_execution_namespace(&work.namespace)?;
        let state = self.gateway.state(&cluster)?;

        if work.deletion_requested {
            if state.ready {
                self.try_delete_workload(&cluster, &work).await?;
            } else if !state.terminating {
                // deleting against an unreachable cluster would abandon a
                // possibly-running workload
                return Err(SyncError::ClusterNotReady(cluster));
            }
            // remote cleanup done, or the cluster is being decommissioned and
            // cleanup can never succeed; either way release the finalizer
            return self.remove_finalizer(work).await;
        }

        if !state.ready {
            return Err(SyncError::ClusterNotReady(cluster));
        }

        self.sync_to_cluster(&cluster, &work).await
    }

    async fn sync_to_cluster(&self, cluster: &str, work: &Work) -> Result<(), SyncError> {
        let start = Instant::now();
        let total = work.spec.manifests.len();
        let mut errs = AggregateError::new();
        let mut succeeded = 0usize;

        for raw in &work.spec.manifests {
            let manifest = match Manifest::from_value(raw.clone()) {
                Ok(m) => m,
                Err(err) => {
                    warn!(work = %work.work_ref(), error = %err, "skipping malformed manifest");
                    errs.push(err);
                    continue;
                }
            };
            let key = ResourceKey::of(&manifest);
            match self.apply_manifest(cluster, &manifest).await {
                Ok(()) => {
                    succeeded += 1;
                    self.events.event(
                        EventKind::Normal,
                        &work.work_ref(),
                        EVENT_REASON_SYNC_SUCCEED,
                        format!("Applied {} to cluster {}", key, cluster),
                    );
                }
                Err(err) => {
                    warn!(work = %work.work_ref(), key = %key, cluster = %cluster, error = %err, "failed to apply manifest");
                    self.events.event(
                        EventKind::Warning,
                        &work.work_ref(),
                        EVENT_REASON_SYNC_FAILED,
                        format!("Failed to apply {} to cluster {}: {}", key, cluster, err),
                    );
                    errs.push(err);
                }
            }
        }

        let result = if errs.is_empty() { "success" } else { "error" };
        histogram!(
            "work_sync_duration_seconds",
            start.elapsed().as_secs_f64(),
            "result" => result
        );

        if !errs.is_empty() {
            let message = errs.progress_message(succeeded, total);
            if let Err(status_err) = self
                .update_applied_condition(
                    work,
                    ConditionStatus::False,
                    REASON_APPLIED_FAILED,
                    message,
                )
                .await
            {
                warn!(work = %work.work_ref(), error = %status_err, "failed to update applied condition");
                errs.push(status_err);
            }
            return Err(errs.into());
        }

        self.update_applied_condition(
            work,
            ConditionStatus::True,
            REASON_APPLIED_SUCCESSFUL,
            "Manifests have been successfully applied".into(),
        )
        .await?;
        info!(work = %work.work_ref(), cluster = %cluster, manifests = total, "work synced");
        Ok(())
    }

    /// Create when absent; otherwise update only when drift is detected.
    async fn apply_manifest(&self, cluster: &str, manifest: &Manifest) -> Result<(), SyncError> {
        let key = ResourceKey::of(manifest);
        match self.cache.get(cluster, &key).await? {
            None => self.dispatcher.create(cluster, manifest).await,
            Some(observed) => {
                if self.dispatcher.needs_update(cluster, manifest, &observed).await {
                    self.dispatcher.update(cluster, manifest, &observed).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn try_delete_workload(&self, cluster: &str, work: &Work) -> Result<(), SyncError> {
        for raw in &work.spec.manifests {
            let manifest = Manifest::from_value(raw.clone())?;
            let key = ResourceKey::of(&manifest);
            let Some(observed) = self.cache.get(cluster, &key).await? else {
                continue;
            };
            // never delete an object this work order does not own
            if observed.label(WORK_NAME_LABEL) != manifest.label(WORK_NAME_LABEL) {
                info!(
                    cluster = %cluster,
                    key = %key,
                    "abort deleting resource: exists in cluster but not managed by this work"
                );
                continue;
            }
            self.dispatcher.delete(cluster, &manifest).await?;
        }
        Ok(())
    }

    async fn remove_finalizer(&self, mut work: Work) -> Result<(), SyncError> {
        if !work.has_finalizer(EXECUTION_FINALIZER) {
            return Ok(());
        }
        work.remove_finalizer(EXECUTION_FINALIZER);
        self.store.update(work).await?;
        Ok(())
    }

    /// Write the Applied condition, retrying conflicts with a re-fetched
    /// Work; the first attempt reuses the one already in hand.
    async fn update_applied_condition(
        &self,
        work: &Work,
        status: ConditionStatus,
        reason: &str,
        message: String,
    ) -> Result<(), SyncError> {
        let store = Arc::clone(&self.store);
        let work_ref = work.work_ref();
        let reason = reason.to_string();
        let cached = Arc::new(Mutex::new(Some(work.clone())));

        retry_on_conflict(&self.backoff, move || {
            let store = Arc::clone(&store);
            let cached = Arc::clone(&cached);
            let work_ref = work_ref.clone();
            let condition = Condition::new(
                WORK_APPLIED_CONDITION,
                status,
                &reason,
                message.clone(),
            );
            async move {
                let taken = cached.lock().unwrap().take();
                let mut work = match taken {
                    Some(w) => w,
                    None => store
                        .get(&work_ref.namespace, &work_ref.name)
                        .await?
                        .ok_or_else(|| SyncError::NotFound(format!("work {}", work_ref)))?,
                };
                set_status_condition(&mut work.status.conditions, condition);
                store.update_status(work).await?;
                Ok(())
            }
        })
        .await
    }
}
