//! Override-policy application surface.
//!
//! Rule matching and mutation live in the policy engine; the generator only
//! invokes it per cluster and records what was applied for audit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flotilla_core::{Manifest, SyncError};

/// One applied override, for the audit annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOverrideItem {
    pub policy: String,
    pub overriders: Value,
}

/// Ordered record of the overrides applied to one manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedOverrides {
    pub items: Vec<AppliedOverrideItem>,
}

impl AppliedOverrides {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_annotation_value(&self) -> Result<String, SyncError> {
        serde_json::to_string(&self.items).map_err(|e| SyncError::Internal(e.to_string()))
    }
}

/// Applies override policies to a manifest bound for one cluster. Returns
/// the cluster-scoped and namespace-scoped audit records. Overrides run
/// last: they may rewrite anything earlier stages set.
pub trait OverrideManager: Send + Sync {
    fn apply_override_policies(
        &self,
        manifest: &mut Manifest,
        cluster: &str,
    ) -> Result<(Option<AppliedOverrides>, Option<AppliedOverrides>), SyncError>;
}

/// No policies configured.
#[derive(Default)]
pub struct NoOverrides;

impl OverrideManager for NoOverrides {
    fn apply_override_policies(
        &self,
        _manifest: &mut Manifest,
        _cluster: &str,
    ) -> Result<(Option<AppliedOverrides>, Option<AppliedOverrides>), SyncError> {
        Ok((None, None))
    }
}
