//! The Work order: per-cluster unit of desired state, plus the condition
//! machinery its status is reported through.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Labels stamped on Works and propagated manifests.
pub const WORK_NAME_LABEL: &str = "flotilla.dev/work-name";
pub const WORK_NAMESPACE_LABEL: &str = "flotilla.dev/work-namespace";
pub const WORK_PERMANENT_ID_LABEL: &str = "flotilla.dev/permanent-id";
pub const BINDING_REFERENCE_LABEL: &str = "flotilla.dev/binding-ref";

/// Annotations carried for audit and conflict policy.
pub const BINDING_NAMESPACE_ANNOTATION: &str = "flotilla.dev/binding-namespace";
pub const BINDING_NAME_ANNOTATION: &str = "flotilla.dev/binding-name";
pub const TEMPLATE_UID_ANNOTATION: &str = "flotilla.dev/template-uid";
pub const APPLIED_OVERRIDES_ANNOTATION: &str = "flotilla.dev/applied-overrides";
pub const APPLIED_CLUSTER_OVERRIDES_ANNOTATION: &str = "flotilla.dev/applied-cluster-overrides";
pub const CONFLICT_RESOLUTION_ANNOTATION: &str = "flotilla.dev/conflict-resolution";
pub const CONFLICT_RESOLUTION_OVERWRITE: &str = "overwrite";
pub const MANAGED_LABELS_ANNOTATION: &str = "flotilla.dev/managed-labels";
pub const MANAGED_ANNOTATIONS_ANNOTATION: &str = "flotilla.dev/managed-annotations";

/// Finalizer marking that remote cleanup is still owed.
pub const EXECUTION_FINALIZER: &str = "flotilla.dev/execution-controller";

pub const WORK_APPLIED_CONDITION: &str = "Applied";
pub const REASON_APPLIED_SUCCESSFUL: &str = "AppliedSuccessful";
pub const REASON_APPLIED_FAILED: &str = "AppliedFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: String,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: Utc::now(),
        }
    }
}

/// Upsert a condition by type. The transition timestamp only moves when the
/// status value actually changes.
pub fn set_status_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        Some(existing) => {
            if existing.status != new.status {
                existing.last_transition_time = new.last_transition_time;
            }
            existing.status = new.status;
            existing.reason = new.reason;
            existing.message = new.message;
        }
        None => conditions.push(new),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkSpec {
    /// Post-revision, post-override documents, applied in listed order.
    pub manifests: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// One Work per (binding, target cluster). The namespace encodes the target
/// cluster; labels/annotations carry the binding back-reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Set by the store when deletion was requested but finalizers remain.
    #[serde(default)]
    pub deletion_requested: bool,
    /// Store-managed optimistic-concurrency version.
    #[serde(default)]
    pub resource_version: u64,
    pub spec: WorkSpec,
    #[serde(default)]
    pub status: WorkStatus,
}

impl Work {
    pub fn work_ref(&self) -> WorkRef {
        WorkRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn applied_condition(&self) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == WORK_APPLIED_CONDITION)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

/// Work identity, the unit the queue and workers operate on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for WorkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
