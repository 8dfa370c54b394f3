//! Version tokens for drift detection.
//!
//! A token is derived from a write response: the object's generation when it
//! exposes a nonzero one, otherwise its raw revision string. Generation
//! tokens order numerically; revision tokens only compare for equality.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::manifest::Manifest;

const GENERATION_PREFIX: &str = "gen:";
const REVISION_PREFIX: &str = "rv:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionToken {
    Generation(i64),
    Revision(String),
}

impl VersionToken {
    /// Token for the given object, as observed or as returned by a write.
    pub fn of(manifest: &Manifest) -> Self {
        let generation = manifest.generation();
        if generation != 0 {
            VersionToken::Generation(generation)
        } else {
            VersionToken::Revision(
                manifest
                    .resource_version()
                    .unwrap_or_default()
                    .to_string(),
            )
        }
    }

    pub fn is_generation(&self) -> bool {
        matches!(self, VersionToken::Generation(_))
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        if let Some(rest) = s.strip_prefix(GENERATION_PREFIX) {
            let generation: i64 = rest
                .parse()
                .map_err(|_| SyncError::Internal(format!("invalid version token: {}", s)))?;
            if generation == 0 {
                return Err(SyncError::Internal(format!(
                    "generation should not be 0: {}",
                    s
                )));
            }
            return Ok(VersionToken::Generation(generation));
        }
        if let Some(rest) = s.strip_prefix(REVISION_PREFIX) {
            rest.parse::<u64>()
                .map_err(|_| SyncError::Internal(format!("invalid version token: {}", s)))?;
            return Ok(VersionToken::Revision(rest.to_string()));
        }
        Err(SyncError::Internal(format!(
            "unknown version token: {}",
            s
        )))
    }

    /// Ordering is only defined between two generation tokens; any pair
    /// involving a revision token is equality-only.
    pub fn compare(&self, other: &VersionToken) -> Option<Ordering> {
        match (self, other) {
            (VersionToken::Generation(a), VersionToken::Generation(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionToken::Generation(g) => write!(f, "{}{}", GENERATION_PREFIX, g),
            VersionToken::Revision(rv) => write!(f, "{}{}", REVISION_PREFIX, rv),
        }
    }
}
