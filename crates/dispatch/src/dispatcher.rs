//! Create/Update/Delete of one manifest against one member cluster, with
//! ownership policy, cluster-field retention and version recording.

use std::sync::{Arc, Mutex};

use metrics::counter;
use tracing::{info, warn};

use flotilla_cluster::{ClusterGateway, RestMapper};
use flotilla_core::interpret::{KindRef, Operation, ResourceInterpreter};
use flotilla_core::work::{
    CONFLICT_RESOLUTION_ANNOTATION, CONFLICT_RESOLUTION_OVERWRITE, WORK_NAMESPACE_LABEL,
    WORK_NAME_LABEL,
};
use flotilla_core::{retry_on_conflict, BackoffPolicy, Manifest, ResourceKey, SyncError, VersionToken};

use crate::registry::VersionRegistry;

pub struct Dispatcher {
    registry: Arc<VersionRegistry>,
    gateway: Arc<dyn ClusterGateway>,
    mapper: Arc<dyn RestMapper>,
    interpreter: Arc<dyn ResourceInterpreter>,
    backoff: BackoffPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<VersionRegistry>,
        gateway: Arc<dyn ClusterGateway>,
        mapper: Arc<dyn RestMapper>,
        interpreter: Arc<dyn ResourceInterpreter>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            registry,
            gateway,
            mapper,
            interpreter,
            backoff,
        }
    }

    pub fn registry(&self) -> &Arc<VersionRegistry> {
        &self.registry
    }

    /// Create the object in the cluster and record the token from the
    /// creation response.
    pub async fn create(&self, cluster: &str, desired: &Manifest) -> Result<(), SyncError> {
        let client = self.gateway.client(cluster)?;
        let endpoint = self
            .mapper
            .endpoint_for(desired.api_version(), desired.kind())?;
        let key = ResourceKey::of(desired);

        let mut slot = self.registry.lock_for_write(cluster, &key).await;
        let created = client.create(&endpoint, desired).await?;
        *slot = Some(VersionToken::of(&created));

        counter!("dispatch_create_total", 1u64);
        info!(cluster = %cluster, key = %key, version = %VersionToken::of(&created), "created resource");
        Ok(())
    }

    /// Update the object if ownership policy allows it. A denied update is
    /// not an error; the warning is the only side effect. Conflicts are
    /// retried with the observed object re-fetched once an attempt staled it.
    pub async fn update(
        &self,
        cluster: &str,
        desired: &Manifest,
        observed: &Manifest,
    ) -> Result<(), SyncError> {
        if !allow_update(desired, observed) {
            warn!(
                cluster = %cluster,
                key = %ResourceKey::of(desired),
                "resource exists but is not managed by this control plane and no \
                 conflict-resolution directive is set; refusing to update"
            );
            counter!("dispatch_update_denied_total", 1u64);
            return Ok(());
        }

        let client = self.gateway.client(cluster)?;
        let endpoint = self
            .mapper
            .endpoint_for(desired.api_version(), desired.kind())?;
        let key = ResourceKey::of(desired);

        // First attempt consumes the caller's observed snapshot; any retry
        // re-fetches because a failed write proves the snapshot stale.
        let cached = Arc::new(Mutex::new(Some(observed.clone())));
        let registry = Arc::clone(&self.registry);
        let interpreter = Arc::clone(&self.interpreter);
        let desired = desired.clone();
        let cluster_name = cluster.to_string();

        let new_token = retry_on_conflict(&self.backoff, move || {
            let client = Arc::clone(&client);
            let endpoint = endpoint.clone();
            let desired = desired.clone();
            let cached = Arc::clone(&cached);
            let registry = Arc::clone(&registry);
            let interpreter = Arc::clone(&interpreter);
            let cluster = cluster_name.clone();
            let key = key.clone();
            async move {
                let taken = cached.lock().unwrap().take();
                let observed = match taken {
                    Some(snapshot) => snapshot,
                    None => {
                        client
                            .get(&endpoint, desired.namespace(), desired.name())
                            .await?
                    }
                };
                let retained = retain_cluster_fields(interpreter.as_ref(), desired, &observed)?;
                let mut slot = registry.lock_for_write(&cluster, &key).await;
                let updated = client.replace(&endpoint, &retained).await?;
                let token = VersionToken::of(&updated);
                *slot = Some(token.clone());
                Ok(token)
            }
        })
        .await?;

        counter!("dispatch_update_total", 1u64);
        info!(cluster = %cluster, key = %ResourceKey::of(observed), version = %new_token, "updated resource");
        Ok(())
    }

    /// Delete with background propagation; absence is success. The version
    /// record is cleared either way.
    pub async fn delete(&self, cluster: &str, manifest: &Manifest) -> Result<(), SyncError> {
        let client = self.gateway.client(cluster)?;
        let endpoint = self
            .mapper
            .endpoint_for(manifest.api_version(), manifest.kind())?;
        let key = ResourceKey::of(manifest);

        match client
            .delete(&endpoint, manifest.namespace(), manifest.name())
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.registry.forget(cluster, &key);

        counter!("dispatch_delete_total", 1u64);
        info!(cluster = %cluster, key = %key, "deleted resource");
        Ok(())
    }

    /// Drift check against the recorded token. No record means drift.
    pub async fn needs_update(&self, cluster: &str, desired: &Manifest, observed: &Manifest) -> bool {
        let key = ResourceKey::of(observed);
        match self.registry.recorded(cluster, &key).await {
            None => true,
            Some(recorded) => object_needs_update(desired, observed, &recorded),
        }
    }
}

/// The observed object may be updated iff it originates from the same work
/// order, or the desired object carries an explicit overwrite directive.
pub fn allow_update(desired: &Manifest, observed: &Manifest) -> bool {
    if desired.label(WORK_NAME_LABEL) == observed.label(WORK_NAME_LABEL)
        && desired.label(WORK_NAMESPACE_LABEL) == observed.label(WORK_NAMESPACE_LABEL)
    {
        return true;
    }
    desired.annotation(CONFLICT_RESOLUTION_ANNOTATION).as_deref()
        == Some(CONFLICT_RESOLUTION_OVERWRITE)
}

/// Token comparison with the generation caveat: a matching generation token
/// still requires metadata equivalence, because metadata-only edits don't
/// move the generation.
pub fn object_needs_update(
    desired: &Manifest,
    observed: &Manifest,
    recorded: &VersionToken,
) -> bool {
    let target = VersionToken::of(observed);
    if recorded != &target {
        return true;
    }
    target.is_generation() && !object_meta_equivalent(desired, observed)
}

fn object_meta_equivalent(desired: &Manifest, observed: &Manifest) -> bool {
    if desired.name() != observed.name() || desired.namespace() != observed.namespace() {
        return false;
    }
    // Compare through the same retain policy an update would apply, so
    // cluster-owned keys don't read as drift.
    let mut retained = desired.clone();
    retained.retain_labels(observed);
    retained.retain_annotations(observed);
    retained.labels() == observed.labels() && retained.annotations() == observed.annotations()
}

/// Graft cluster-owned fields onto the desired document before a write:
/// current revision, finalizers, owner references, unmanaged labels and
/// annotations, then the per-kind retain hook if one is registered.
fn retain_cluster_fields(
    interpreter: &dyn ResourceInterpreter,
    mut desired: Manifest,
    observed: &Manifest,
) -> Result<Manifest, SyncError> {
    if let Some(rv) = observed.resource_version() {
        desired.set_resource_version(rv);
    }
    desired.copy_metadata_field_from(observed, "finalizers");
    desired.copy_metadata_field_from(observed, "ownerReferences");
    desired.retain_annotations(observed);
    desired.retain_labels(observed);

    let kind = KindRef::of(&desired);
    if interpreter.hook_enabled(&kind, Operation::Retain) {
        return interpreter.retain(desired, observed);
    }
    Ok(desired)
}
