//! Flotilla work generation: turns a binding's scheduling decision into one
//! work order per target cluster.
//!
//! Order matters: target-set merge, per-kind replica revision, completions
//! spreading, then override policies last (they may rewrite anything), then
//! the deterministic-identity upsert.

#![forbid(unsafe_code)]

pub mod overrides;
pub mod spread;

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use flotilla_core::interpret::{KindRef, Operation, ResourceInterpreter};
use flotilla_core::work::{
    APPLIED_CLUSTER_OVERRIDES_ANNOTATION, APPLIED_OVERRIDES_ANNOTATION, BINDING_NAME_ANNOTATION,
    BINDING_NAMESPACE_ANNOTATION, BINDING_REFERENCE_LABEL, CONFLICT_RESOLUTION_ANNOTATION,
    EXECUTION_FINALIZER, TEMPLATE_UID_ANNOTATION, WORK_NAMESPACE_LABEL, WORK_NAME_LABEL,
    WORK_PERMANENT_ID_LABEL,
};
use flotilla_core::{
    names, retry_on_conflict, BackoffPolicy, Manifest, SyncError, Work, WorkSpec, WorkStatus,
};
use flotilla_store::WorkStore;

pub use overrides::{AppliedOverrideItem, AppliedOverrides, NoOverrides, OverrideManager};
pub use spread::{CompletionsSpreader, EvenSpreader};

const JOB_KIND: &str = "Job";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCluster {
    pub name: String,
    pub replicas: i64,
}

/// Target clusters contributed because another binding depends on this
/// resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingSnapshot {
    pub namespace: Option<String>,
    pub name: String,
    pub clusters: Vec<TargetCluster>,
}

/// The control-plane record linking a resource template to its scheduling
/// decision. `namespace` is `None` for cluster-scoped bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub namespace: Option<String>,
    pub name: String,
    pub clusters: Vec<TargetCluster>,
    #[serde(default)]
    pub required_by: Vec<BindingSnapshot>,
    /// Explicit conflict-resolution directive to stamp on the propagated
    /// manifests (e.g. "overwrite").
    #[serde(default)]
    pub conflict_resolution: Option<String>,
}

/// Decision clusters merged with required-by clusters, deduplicated by name.
/// A name already present wins over a later-seen duplicate.
pub fn merge_target_clusters(
    decision: &[TargetCluster],
    required_by: &[BindingSnapshot],
) -> Vec<TargetCluster> {
    let mut out = decision.to_vec();
    let mut seen: FxHashSet<String> = decision.iter().map(|t| t.name.clone()).collect();
    for snapshot in required_by {
        for target in &snapshot.clusters {
            if seen.insert(target.name.clone()) {
                out.push(target.clone());
            }
        }
    }
    out
}

pub struct WorkGenerator {
    store: Arc<dyn WorkStore>,
    interpreter: Arc<dyn ResourceInterpreter>,
    overrides: Arc<dyn OverrideManager>,
    spreader: Arc<dyn CompletionsSpreader>,
    backoff: BackoffPolicy,
}

impl WorkGenerator {
    pub fn new(
        store: Arc<dyn WorkStore>,
        interpreter: Arc<dyn ResourceInterpreter>,
        overrides: Arc<dyn OverrideManager>,
        spreader: Arc<dyn CompletionsSpreader>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            interpreter,
            overrides,
            spreader,
            backoff,
        }
    }

    /// Create or update exactly one Work per target cluster of the binding.
    /// No side effects when the merged target set is empty.
    pub async fn ensure_work(
        &self,
        template: &Manifest,
        binding: &Binding,
    ) -> Result<(), SyncError> {
        let targets = merge_target_clusters(&binding.clusters, &binding.required_by);
        if targets.is_empty() {
            debug!(binding = %binding.name, "no target clusters, nothing to ensure");
            return Ok(());
        }

        // A parallel Job spreads its completions across clusters; a work-queue
        // style Job leaves the field unset and is propagated as-is.
        let mut job_completions = Vec::new();
        if template.kind() == JOB_KIND {
            if let Some(total) = template.completions() {
                job_completions = self.spreader.spread(total, &targets)?;
                let sum: i64 = job_completions.iter().map(|t| t.replicas).sum();
                if sum != total {
                    return Err(SyncError::Internal(format!(
                        "completions partition sums to {}, want {}",
                        sum, total
                    )));
                }
            }
        }

        let kind = KindRef::of(template);
        for (i, target) in targets.iter().enumerate() {
            let mut manifest = template.clone();

            if self.interpreter.hook_enabled(&kind, Operation::ReviseReplica) {
                manifest =
                    self.interpreter
                        .revise_replica(manifest, target.replicas, &target.name)?;
            }
            if !job_completions.is_empty() {
                manifest.set_completions(job_completions[i].replicas);
            }

            // overrides run last: they hold the highest priority
            let (cluster_overrides, namespace_overrides) = self
                .overrides
                .apply_override_policies(&mut manifest, &target.name)?;

            let work_name = names::work_name(template.kind(), template.name(), template.namespace());
            let work_namespace = names::execution_namespace(&target.name);
            let reference =
                names::binding_reference_key(binding.namespace.as_deref(), &binding.name);

            manifest.merge_label(BINDING_REFERENCE_LABEL, &reference);
            manifest.merge_label(WORK_NAME_LABEL, &work_name);
            manifest.merge_label(WORK_NAMESPACE_LABEL, &work_namespace);

            let mut labels = BTreeMap::new();
            labels.insert(BINDING_REFERENCE_LABEL.to_string(), reference);

            let mut annotations = BTreeMap::new();
            if let Some(ns) = &binding.namespace {
                annotations.insert(BINDING_NAMESPACE_ANNOTATION.to_string(), ns.clone());
                manifest.merge_annotation(BINDING_NAMESPACE_ANNOTATION, ns);
            }
            annotations.insert(BINDING_NAME_ANNOTATION.to_string(), binding.name.clone());
            manifest.merge_annotation(BINDING_NAME_ANNOTATION, &binding.name);

            if let Some(resolution) = &binding.conflict_resolution {
                annotations.insert(CONFLICT_RESOLUTION_ANNOTATION.to_string(), resolution.clone());
                manifest.merge_annotation(CONFLICT_RESOLUTION_ANNOTATION, resolution);
            }

            if let Some(applied) = &cluster_overrides {
                if !applied.is_empty() {
                    annotations.insert(
                        APPLIED_CLUSTER_OVERRIDES_ANNOTATION.to_string(),
                        applied.to_annotation_value()?,
                    );
                }
            }
            if let Some(applied) = &namespace_overrides {
                if !applied.is_empty() {
                    annotations.insert(
                        APPLIED_OVERRIDES_ANNOTATION.to_string(),
                        applied.to_annotation_value()?,
                    );
                }
            }

            let meta = WorkMeta {
                name: work_name,
                namespace: work_namespace,
                labels,
                annotations,
                finalizers: vec![EXECUTION_FINALIZER.to_string()],
            };
            self.create_or_update_work(meta, manifest, template).await?;
        }
        Ok(())
    }

    async fn create_or_update_work(
        &self,
        mut meta: WorkMeta,
        mut manifest: Manifest,
        template: &Manifest,
    ) -> Result<(), SyncError> {
        if let Some(uid) = template.uid() {
            let uid = uid.to_string();
            meta.annotations
                .insert(TEMPLATE_UID_ANNOTATION.to_string(), uid.clone());
            manifest.merge_annotation(TEMPLATE_UID_ANNOTATION, &uid);
        }

        // Identity survives version churn through the permanent-ID label:
        // carried over from any pre-existing Work, minted otherwise.
        let existing = self.store.get(&meta.namespace, &meta.name).await?;
        let permanent_id = existing
            .as_ref()
            .and_then(|w| w.labels.get(WORK_PERMANENT_ID_LABEL).cloned())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        meta.labels
            .insert(WORK_PERMANENT_ID_LABEL.to_string(), permanent_id.clone());
        manifest.merge_label(WORK_PERMANENT_ID_LABEL, &permanent_id);

        manifest.record_managed_keys();
        let manifest_json = manifest.into_value();

        let store = Arc::clone(&self.store);
        retry_on_conflict(&self.backoff, move || {
            let store = Arc::clone(&store);
            let meta = meta.clone();
            let manifest_json = manifest_json.clone();
            async move {
                match store.get(&meta.namespace, &meta.name).await? {
                    None => {
                        let work = Work {
                            name: meta.name,
                            namespace: meta.namespace,
                            labels: meta.labels,
                            annotations: meta.annotations,
                            finalizers: meta.finalizers,
                            deletion_requested: false,
                            resource_version: 0,
                            spec: WorkSpec {
                                manifests: vec![manifest_json],
                            },
                            status: WorkStatus::default(),
                        };
                        let created = store.create(work).await?;
                        info!(work = %created.work_ref(), "created work");
                        Ok(())
                    }
                    Some(mut current) => {
                        if current.deletion_requested {
                            return Err(SyncError::Internal(format!(
                                "work {}/{} is being deleted",
                                meta.namespace, meta.name
                            )));
                        }
                        // merge, don't replace, so labels set by others survive
                        current.labels.extend(meta.labels);
                        current.annotations.extend(meta.annotations);
                        current.finalizers = meta.finalizers;
                        current.spec = WorkSpec {
                            manifests: vec![manifest_json],
                        };
                        let updated = store.update(current).await?;
                        debug!(work = %updated.work_ref(), "updated work");
                        Ok(())
                    }
                }
            }
        })
        .await
    }
}

#[derive(Clone)]
struct WorkMeta {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    finalizers: Vec<String>,
}
