//! In-memory fakes: a member cluster with revision/generation bookkeeping,
//! a static REST mapper, and a gateway with mutable reachability state.
//! The rest of the workspace tests the pipeline against these.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use flotilla_core::{Manifest, ResourceKey, SyncError};

use crate::{ClusterClient, ClusterGateway, ClusterState, ResourceEndpoint, RestMapper};

/// Failure to inject into the next write against a named object.
#[derive(Debug, Clone, Copy)]
pub enum InjectedFailure {
    Conflict,
    Remote,
}

fn object_key(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        api_version,
        kind,
        namespace.unwrap_or(""),
        name
    )
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<String, Manifest>,
    next_rv: u64,
    next_uid: u64,
    fail_writes: FxHashMap<String, VecDeque<InjectedFailure>>,
}

impl Inner {
    fn take_failure(&mut self, name: &str) -> Option<SyncError> {
        let queue = self.fail_writes.get_mut(name)?;
        let failure = queue.pop_front()?;
        Some(match failure {
            InjectedFailure::Conflict => {
                SyncError::Conflict(format!("injected conflict on {}", name))
            }
            InjectedFailure::Remote => SyncError::Remote(format!("injected failure on {}", name)),
        })
    }

    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

/// A fake member cluster. Revisions increase monotonically on every write;
/// with generation tracking on, spec changes also bump `metadata.generation`
/// the way the API server does for workload kinds.
pub struct MemoryCluster {
    inner: Mutex<Inner>,
    track_generation: bool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            track_generation: false,
        }
    }

    pub fn with_generation_tracking() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            track_generation: true,
        }
    }

    /// Insert an object verbatim, assigning a revision if it has none.
    pub fn seed(&self, mut manifest: Manifest) -> Manifest {
        let mut inner = self.inner.lock().unwrap();
        if manifest.resource_version().is_none() {
            let rv = inner.bump_rv();
            manifest.set_resource_version(&rv);
        }
        let key = ResourceKey::of(&manifest).to_string();
        inner.objects.insert(key, manifest.clone());
        manifest
    }

    pub fn lookup(&self, key: &ResourceKey) -> Option<Manifest> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&key.to_string())
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    /// Fail the next write (create or replace) against the named object.
    pub fn fail_next_write(&self, name: &str, failure: InjectedFailure) {
        self.inner
            .lock()
            .unwrap()
            .fail_writes
            .entry(name.to_string())
            .or_default()
            .push_back(failure);
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Manifest, SyncError> {
        let key = object_key(&endpoint.api_version(), &endpoint.kind, namespace, name);
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&key)
            .cloned()
            .ok_or(SyncError::NotFound(key))
    }

    async fn create(
        &self,
        endpoint: &ResourceEndpoint,
        manifest: &Manifest,
    ) -> Result<Manifest, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.take_failure(manifest.name()) {
            return Err(err);
        }
        let key = object_key(
            &endpoint.api_version(),
            &endpoint.kind,
            manifest.namespace(),
            manifest.name(),
        );
        if inner.objects.contains_key(&key) {
            return Err(SyncError::Conflict(format!("{} already exists", key)));
        }
        let mut stored = manifest.clone();
        let rv = inner.bump_rv();
        stored.set_resource_version(&rv);
        if stored.uid().is_none() {
            inner.next_uid += 1;
            let uid = format!("mem-uid-{}", inner.next_uid);
            stored.set_uid(&uid);
        }
        if self.track_generation {
            stored.set_generation(1);
        }
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(
        &self,
        endpoint: &ResourceEndpoint,
        manifest: &Manifest,
    ) -> Result<Manifest, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.take_failure(manifest.name()) {
            return Err(err);
        }
        let key = object_key(
            &endpoint.api_version(),
            &endpoint.kind,
            manifest.namespace(),
            manifest.name(),
        );
        let current = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        match manifest.resource_version() {
            Some(rv) if Some(rv) == current.resource_version() => {}
            Some(rv) => {
                return Err(SyncError::Conflict(format!(
                    "stale resourceVersion {} for {}",
                    rv, key
                )))
            }
            None => {
                return Err(SyncError::Conflict(format!(
                    "missing resourceVersion for {}",
                    key
                )))
            }
        }
        let mut stored = manifest.clone();
        let rv = inner.bump_rv();
        stored.set_resource_version(&rv);
        if let Some(uid) = current.uid() {
            stored.set_uid(uid);
        }
        if self.track_generation {
            let spec_changed =
                manifest.as_value().get("spec") != current.as_value().get("spec");
            let generation = current.generation() + i64::from(spec_changed);
            stored.set_generation(generation.max(1));
        }
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), SyncError> {
        let key = object_key(&endpoint.api_version(), &endpoint.kind, namespace, name);
        self.inner
            .lock()
            .unwrap()
            .objects
            .remove(&key)
            .map(|_| ())
            .ok_or(SyncError::NotFound(key))
    }
}

/// Fixed kind-to-endpoint table; an unregistered kind is an endpoint-mapping
/// failure, which tests lean on.
#[derive(Default)]
pub struct StaticRestMapper {
    endpoints: FxHashMap<(String, String), ResourceEndpoint>,
}

impl StaticRestMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(
        mut self,
        api_version: &str,
        kind: &str,
        plural: &str,
        namespaced: bool,
    ) -> Self {
        let (group, version) = crate::split_api_version(api_version);
        self.endpoints.insert(
            (api_version.to_string(), kind.to_string()),
            ResourceEndpoint {
                group,
                version,
                kind: kind.to_string(),
                plural: plural.to_string(),
                namespaced,
            },
        );
        self
    }

    /// Common kinds most tests need.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_kind("v1", "ConfigMap", "configmaps", true)
            .with_kind("v1", "Secret", "secrets", true)
            .with_kind("v1", "Namespace", "namespaces", false)
            .with_kind("apps/v1", "Deployment", "deployments", true)
            .with_kind("batch/v1", "Job", "jobs", true)
    }
}

impl RestMapper for StaticRestMapper {
    fn endpoint_for(&self, api_version: &str, kind: &str) -> Result<ResourceEndpoint, SyncError> {
        self.endpoints
            .get(&(api_version.to_string(), kind.to_string()))
            .cloned()
            .ok_or_else(|| SyncError::EndpointMapping {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                detail: "no mapping registered".into(),
            })
    }
}

struct GatewayEntry {
    state: ClusterState,
    client: Arc<MemoryCluster>,
}

/// Gateway over fake clusters with mutable reachability.
#[derive(Default)]
pub struct MemoryClusterGateway {
    clusters: Mutex<FxHashMap<String, GatewayEntry>>,
}

impl MemoryClusterGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cluster(&self, name: &str) -> Arc<MemoryCluster> {
        self.add(name, MemoryCluster::new())
    }

    pub fn add_cluster_with_generations(&self, name: &str) -> Arc<MemoryCluster> {
        self.add(name, MemoryCluster::with_generation_tracking())
    }

    fn add(&self, name: &str, cluster: MemoryCluster) -> Arc<MemoryCluster> {
        let client = Arc::new(cluster);
        self.clusters.lock().unwrap().insert(
            name.to_string(),
            GatewayEntry {
                state: ClusterState {
                    ready: true,
                    terminating: false,
                },
                client: Arc::clone(&client),
            },
        );
        client
    }

    pub fn set_state(&self, name: &str, ready: bool, terminating: bool) {
        if let Some(entry) = self.clusters.lock().unwrap().get_mut(name) {
            entry.state = ClusterState { ready, terminating };
        }
    }
}

impl ClusterGateway for MemoryClusterGateway {
    fn state(&self, cluster: &str) -> Result<ClusterState, SyncError> {
        self.clusters
            .lock()
            .unwrap()
            .get(cluster)
            .map(|e| e.state)
            .ok_or_else(|| SyncError::UnknownCluster(cluster.to_string()))
    }

    fn client(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, SyncError> {
        self.clusters
            .lock()
            .unwrap()
            .get(cluster)
            .map(|e| {
                let client: Arc<dyn ClusterClient> = e.client.clone();
                client
            })
            .ok_or_else(|| SyncError::UnknownCluster(cluster.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm_endpoint() -> ResourceEndpoint {
        StaticRestMapper::with_defaults()
            .endpoint_for("v1", "ConfigMap")
            .unwrap()
    }

    fn configmap(name: &str) -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns"},
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_assigns_revision_and_uid() {
        let cluster = MemoryCluster::new();
        let created = cluster.create(&cm_endpoint(), &configmap("a")).await.unwrap();
        assert!(created.resource_version().is_some());
        assert!(created.uid().is_some());

        let err = cluster
            .create(&cm_endpoint(), &configmap("a"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn replace_enforces_resource_version() {
        let cluster = MemoryCluster::new();
        let created = cluster.create(&cm_endpoint(), &configmap("a")).await.unwrap();

        let mut stale = created.clone();
        stale.set_resource_version("999");
        assert!(cluster
            .replace(&cm_endpoint(), &stale)
            .await
            .unwrap_err()
            .is_conflict());

        let updated = cluster.replace(&cm_endpoint(), &created).await.unwrap();
        assert_ne!(updated.resource_version(), created.resource_version());
    }

    #[tokio::test]
    async fn generation_tracks_spec_changes_only() {
        let ep = StaticRestMapper::with_defaults()
            .endpoint_for("apps/v1", "Deployment")
            .unwrap();
        let cluster = MemoryCluster::with_generation_tracking();
        let dep = Manifest::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "ns"},
            "spec": {"replicas": 1}
        }))
        .unwrap();
        let created = cluster.create(&ep, &dep).await.unwrap();
        assert_eq!(created.generation(), 1);

        // metadata-only change keeps the generation
        let mut relabeled = created.clone();
        relabeled.merge_label("touched", "yes");
        let updated = cluster.replace(&ep, &relabeled).await.unwrap();
        assert_eq!(updated.generation(), 1);

        // spec change bumps it
        let mut scaled = updated.clone();
        scaled.set_replicas(5);
        let updated = cluster.replace(&ep, &scaled).await.unwrap();
        assert_eq!(updated.generation(), 2);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let cluster = MemoryCluster::new();
        cluster.fail_next_write("a", InjectedFailure::Conflict);
        assert!(cluster
            .create(&cm_endpoint(), &configmap("a"))
            .await
            .unwrap_err()
            .is_conflict());
        assert!(cluster.create(&cm_endpoint(), &configmap("a")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_of_absent_object_is_not_found() {
        let cluster = MemoryCluster::new();
        let err = cluster
            .delete(&cm_endpoint(), Some("ns"), "ghost")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn gateway_reports_state_changes() {
        let gateway = MemoryClusterGateway::new();
        gateway.add_cluster("edge-1");
        assert!(gateway.state("edge-1").unwrap().ready);
        gateway.set_state("edge-1", false, true);
        let state = gateway.state("edge-1").unwrap();
        assert!(!state.ready);
        assert!(state.terminating);
        assert!(gateway.state("ghost").is_err());
    }
}
