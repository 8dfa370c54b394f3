use thiserror::Error;

/// Error taxonomy for the sync pipeline.
///
/// Classification drives control flow: conflicts are retried with backoff,
/// not-found is benign for deletes, and everything else bubbles up to the
/// worker which requeues the Work through the rate-limited queue.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("no endpoint for {api_version}/{kind}: {detail}")]
    EndpointMapping {
        api_version: String,
        kind: String,
        detail: String,
    },

    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("cluster {0} not ready")]
    ClusterNotReady(String),

    #[error("unknown cluster {0}")]
    UnknownCluster(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("store: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict(_))
    }

    /// Errors worth requeueing the Work for, as opposed to per-manifest
    /// failures that only feed the Applied condition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Conflict(_) | SyncError::ClusterNotReady(_) | SyncError::Remote(_)
        )
    }
}

/// Ordered collection of per-manifest failures.
///
/// Sibling manifests keep processing after one fails; the collected errors
/// are summarized into the Work's Applied condition with a `(succeeded/total)`
/// progress marker.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<SyncError>,
}

impl std::error::Error for AggregateError {}

impl AggregateError {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, err: SyncError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[SyncError] {
        &self.errors
    }

    /// Condition message for a partially failed apply pass.
    pub fn progress_message(&self, succeeded: usize, total: usize) -> String {
        format!(
            "Failed to apply all manifests ({}/{}): {}",
            succeeded, total, self
        )
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for err in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
            first = false;
        }
        Ok(())
    }
}
