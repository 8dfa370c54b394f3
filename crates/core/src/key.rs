use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

/// Identity of one remote object: kind + apiVersion + namespace + name.
/// The rendered form is the version-registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn of(manifest: &Manifest) -> Self {
        Self {
            api_version: manifest.api_version().to_string(),
            kind: manifest.kind().to_string(),
            namespace: manifest.namespace().map(str::to_string),
            name: manifest.name().to_string(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.api_version,
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}
