//! kube-backed implementations for real member clusters.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use tracing::info;

use flotilla_core::{Manifest, SyncError};

use crate::{
    split_api_version, ClusterClient, ClusterGateway, ClusterState, ResourceEndpoint, RestMapper,
};

fn map_kube_err(err: kube::Error, what: &str) -> SyncError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => SyncError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => SyncError::Conflict(ae.message),
        other => SyncError::Remote(other.to_string()),
    }
}

fn api_for(client: &Client, endpoint: &ResourceEndpoint, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = ApiResource {
        group: endpoint.group.clone(),
        version: endpoint.version.clone(),
        api_version: endpoint.api_version(),
        kind: endpoint.kind.clone(),
        plural: endpoint.plural.clone(),
    };
    match (endpoint.namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &ar),
        _ => Api::all_with(client.clone(), &ar),
    }
}

fn to_dynamic(manifest: &Manifest) -> Result<DynamicObject, SyncError> {
    serde_json::from_value(manifest.as_value().clone())
        .map_err(|e| SyncError::MalformedManifest(e.to_string()))
}

fn from_dynamic(obj: &DynamicObject) -> Result<Manifest, SyncError> {
    let value = serde_json::to_value(obj).map_err(|e| SyncError::Remote(e.to_string()))?;
    Manifest::from_value(value)
}

/// One remote cluster reached through a kube [`Client`].
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Manifest, SyncError> {
        let api = api_for(&self.client, endpoint, namespace);
        let obj = api
            .get(name)
            .await
            .map_err(|e| map_kube_err(e, &format!("{}/{}", endpoint.kind, name)))?;
        from_dynamic(&obj)
    }

    async fn create(
        &self,
        endpoint: &ResourceEndpoint,
        manifest: &Manifest,
    ) -> Result<Manifest, SyncError> {
        let api = api_for(&self.client, endpoint, manifest.namespace());
        let obj = to_dynamic(manifest)?;
        let created = api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, &format!("{}/{}", endpoint.kind, manifest.name())))?;
        from_dynamic(&created)
    }

    async fn replace(
        &self,
        endpoint: &ResourceEndpoint,
        manifest: &Manifest,
    ) -> Result<Manifest, SyncError> {
        let api = api_for(&self.client, endpoint, manifest.namespace());
        let obj = to_dynamic(manifest)?;
        let updated = api
            .replace(manifest.name(), &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, &format!("{}/{}", endpoint.kind, manifest.name())))?;
        from_dynamic(&updated)
    }

    async fn delete(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), SyncError> {
        let api = api_for(&self.client, endpoint, namespace);
        // Background propagation explicitly: a few remote kinds (Job being
        // the notorious one) default to orphaning their dependents.
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        api.delete(name, &dp)
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(e, &format!("{}/{}", endpoint.kind, name)))
    }
}

/// REST mapper backed by a completed API discovery run.
pub struct DiscoveryRestMapper {
    discovery: Discovery,
}

impl DiscoveryRestMapper {
    /// Run discovery once and keep the result for synchronous lookups.
    pub async fn discover(client: Client) -> Result<Self, SyncError> {
        let discovery = Discovery::new(client)
            .run()
            .await
            .map_err(|e| SyncError::Remote(format!("discovery failed: {}", e)))?;
        Ok(Self { discovery })
    }
}

impl RestMapper for DiscoveryRestMapper {
    fn endpoint_for(&self, api_version: &str, kind: &str) -> Result<ResourceEndpoint, SyncError> {
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind {
            group: group.clone(),
            version: version.clone(),
            kind: kind.to_string(),
        };
        for g in self.discovery.groups() {
            for (ar, caps) in g.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    return Ok(ResourceEndpoint {
                        group,
                        version,
                        kind: kind.to_string(),
                        plural: ar.plural.clone(),
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                    });
                }
            }
        }
        Err(SyncError::EndpointMapping {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            detail: "kind not served by cluster".into(),
        })
    }
}

/// Gateway over a fixed set of kube-connected clusters. Reachability is
/// delegated to the control plane's cluster inventory; a cluster present
/// here is considered ready.
#[derive(Default)]
pub struct KubeClusterGateway {
    clusters: FxHashMap<String, Arc<dyn ClusterClient>>,
}

impl KubeClusterGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, client: Client) {
        info!(cluster = %name, "registered member cluster");
        self.clusters
            .insert(name.to_string(), Arc::new(KubeClusterClient::new(client)));
    }
}

impl ClusterGateway for KubeClusterGateway {
    fn state(&self, cluster: &str) -> Result<ClusterState, SyncError> {
        if self.clusters.contains_key(cluster) {
            Ok(ClusterState {
                ready: true,
                terminating: false,
            })
        } else {
            Err(SyncError::UnknownCluster(cluster.to_string()))
        }
    }

    fn client(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, SyncError> {
        self.clusters
            .get(cluster)
            .cloned()
            .ok_or_else(|| SyncError::UnknownCluster(cluster.to_string()))
    }
}
