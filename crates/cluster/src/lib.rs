//! Remote-cluster access for the sync pipeline.
//!
//! The dispatcher only ever talks to a cluster through the traits here: a
//! REST mapper resolving a kind to its collection endpoint, a client doing
//! the CRUD, and a gateway answering reachability and handing out clients.
//! `kube` provides the real implementations; `memory` provides the in-process
//! fakes the rest of the workspace tests against.

#![forbid(unsafe_code)]

pub mod kube_impl;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flotilla_core::{Manifest, SyncError};

/// Remote collection endpoint for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEndpoint {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceEndpoint {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Maps a kind descriptor to its remote collection endpoint.
pub trait RestMapper: Send + Sync {
    fn endpoint_for(&self, api_version: &str, kind: &str) -> Result<ResourceEndpoint, SyncError>;
}

/// Reachability snapshot for one target cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub ready: bool,
    /// The cluster itself is being decommissioned; owed remote cleanup is
    /// skipped rather than waited for.
    pub terminating: bool,
}

/// Hands out per-cluster clients and answers the reachability pre-check.
pub trait ClusterGateway: Send + Sync {
    fn state(&self, cluster: &str) -> Result<ClusterState, SyncError>;
    fn client(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, SyncError>;
}

/// CRUD against one remote cluster, in terms of manifests.
///
/// `delete` uses background propagation semantics; absence surfaces as a
/// not-found error and the caller decides whether that is benign.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Manifest, SyncError>;

    async fn create(
        &self,
        endpoint: &ResourceEndpoint,
        manifest: &Manifest,
    ) -> Result<Manifest, SyncError>;

    async fn replace(
        &self,
        endpoint: &ResourceEndpoint,
        manifest: &Manifest,
    ) -> Result<Manifest, SyncError>;

    async fn delete(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), SyncError>;
}

/// Split an `apiVersion` string into (group, version).
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}
