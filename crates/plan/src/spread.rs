//! Completions-spreading contract.
//!
//! The weighting formula belongs to the placement engine. The only contract
//! the generator relies on: the partition is deterministic for identical
//! input and sums exactly to the total.

use flotilla_core::SyncError;

use crate::TargetCluster;

pub trait CompletionsSpreader: Send + Sync {
    fn spread(&self, total: i64, targets: &[TargetCluster]) -> Result<Vec<TargetCluster>, SyncError>;
}

/// Even split with the remainder going to the first clusters in decision
/// order. Deliberately unweighted; real deployments plug in the placement
/// engine's divider.
#[derive(Default)]
pub struct EvenSpreader;

impl CompletionsSpreader for EvenSpreader {
    fn spread(&self, total: i64, targets: &[TargetCluster]) -> Result<Vec<TargetCluster>, SyncError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let n = targets.len() as i64;
        let share = total / n;
        let remainder = total % n;
        Ok(targets
            .iter()
            .enumerate()
            .map(|(i, t)| TargetCluster {
                name: t.name.clone(),
                replicas: share + i64::from((i as i64) < remainder),
            })
            .collect())
    }
}
