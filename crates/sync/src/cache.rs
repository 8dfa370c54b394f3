//! Observed-state lookup for remote objects.

use async_trait::async_trait;

use flotilla_cluster::{ClusterGateway, RestMapper};
use flotilla_core::{Manifest, ResourceKey, SyncError};
use std::sync::Arc;

/// Where the reconciler reads the live remote object from. Backed by an
/// informer cache in a full deployment; the direct-fetch implementation
/// below is the fallback.
#[async_trait]
pub trait ObjectCache: Send + Sync {
    async fn get(&self, cluster: &str, key: &ResourceKey)
        -> Result<Option<Manifest>, SyncError>;
}

/// Cache that always fetches straight from the cluster; absence maps to
/// `None` rather than an error.
pub struct LiveObjectCache {
    gateway: Arc<dyn ClusterGateway>,
    mapper: Arc<dyn RestMapper>,
}

impl LiveObjectCache {
    pub fn new(gateway: Arc<dyn ClusterGateway>, mapper: Arc<dyn RestMapper>) -> Self {
        Self { gateway, mapper }
    }
}

#[async_trait]
impl ObjectCache for LiveObjectCache {
    async fn get(
        &self,
        cluster: &str,
        key: &ResourceKey,
    ) -> Result<Option<Manifest>, SyncError> {
        let client = self.gateway.client(cluster)?;
        let endpoint = self.mapper.endpoint_for(&key.api_version, &key.kind)?;
        match client
            .get(&endpoint, key.namespace.as_deref(), &key.name)
            .await
        {
            Ok(manifest) => Ok(Some(manifest)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
