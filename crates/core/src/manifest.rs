//! Tagged JSON manifest with narrow typed accessors.
//!
//! A manifest is an opaque JSON document; only the handful of fields the
//! pipeline actually inspects (identity, versions, labels/annotations,
//! replicas/completions) get typed accessors. Everything else passes through
//! untouched.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::work::{MANAGED_ANNOTATIONS_ANNOTATION, MANAGED_LABELS_ANNOTATION};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    /// Wrap a JSON document, validating the identity fields every operation
    /// depends on (apiVersion, kind, metadata.name).
    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SyncError::MalformedManifest("document is not an object".into()))?;
        for field in ["apiVersion", "kind"] {
            match obj.get(field).and_then(Value::as_str) {
                Some(s) if !s.is_empty() => {}
                _ => {
                    return Err(SyncError::MalformedManifest(format!(
                        "missing {}",
                        field
                    )))
                }
            }
        }
        match obj
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
        {
            Some(s) if !s.is_empty() => {}
            _ => return Err(SyncError::MalformedManifest("missing metadata.name".into())),
        }
        Ok(Self(value))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    fn str_at(&self, path: &[&str]) -> Option<&str> {
        let mut cur = &self.0;
        for seg in path {
            cur = cur.get(seg)?;
        }
        cur.as_str()
    }

    pub fn api_version(&self) -> &str {
        self.str_at(&["apiVersion"]).unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.str_at(&["kind"]).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"]).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_at(&["metadata", "namespace"])
    }

    pub fn uid(&self) -> Option<&str> {
        self.str_at(&["metadata", "uid"])
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.str_at(&["metadata", "resourceVersion"])
    }

    pub fn generation(&self) -> i64 {
        self.0
            .get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let obj = self.0.as_object_mut().expect("manifest is an object");
        obj.entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .expect("metadata is an object")
    }

    fn spec_mut(&mut self) -> &mut Map<String, Value> {
        let obj = self.0.as_object_mut().expect("manifest is an object");
        obj.entry("spec")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .expect("spec is an object")
    }

    pub fn set_resource_version(&mut self, rv: &str) {
        self.metadata_mut()
            .insert("resourceVersion".into(), Value::String(rv.to_string()));
    }

    pub fn set_generation(&mut self, generation: i64) {
        self.metadata_mut()
            .insert("generation".into(), Value::Number(generation.into()));
    }

    pub fn set_uid(&mut self, uid: &str) {
        self.metadata_mut()
            .insert("uid".into(), Value::String(uid.to_string()));
    }

    /// Copy a metadata field verbatim from another manifest, removing it when
    /// the source doesn't carry one. Used by the retain pipeline for
    /// finalizers and ownerReferences.
    pub fn copy_metadata_field_from(&mut self, other: &Manifest, field: &str) {
        let source = other
            .0
            .get("metadata")
            .and_then(|m| m.get(field))
            .cloned();
        let meta = self.metadata_mut();
        match source {
            Some(v) => {
                meta.insert(field.to_string(), v);
            }
            None => {
                meta.remove(field);
            }
        }
    }

    fn string_map_at(&self, field: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(map) = self
            .0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(Value::as_object)
        {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    out.insert(k.clone(), s.to_string());
                }
            }
        }
        out
    }

    fn set_string_map(&mut self, field: &str, map: BTreeMap<String, String>) {
        let value = Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        );
        self.metadata_mut().insert(field.to_string(), value);
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map_at("labels")
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map_at("annotations")
    }

    pub fn set_labels(&mut self, labels: BTreeMap<String, String>) {
        self.set_string_map("labels", labels);
    }

    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        self.set_string_map("annotations", annotations);
    }

    pub fn label(&self, key: &str) -> Option<String> {
        self.str_at(&["metadata", "labels", key]).map(str::to_string)
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.str_at(&["metadata", "annotations", key])
            .map(str::to_string)
    }

    /// Insert one label, keeping whatever else the map holds.
    pub fn merge_label(&mut self, key: &str, value: &str) {
        let mut labels = self.labels();
        labels.insert(key.to_string(), value.to_string());
        self.set_labels(labels);
    }

    /// Insert one annotation, keeping whatever else the map holds.
    pub fn merge_annotation(&mut self, key: &str, value: &str) {
        let mut annotations = self.annotations();
        annotations.insert(key.to_string(), value.to_string());
        self.set_annotations(annotations);
    }

    pub fn replicas(&self) -> Option<i64> {
        self.0
            .get("spec")
            .and_then(|s| s.get("replicas"))
            .and_then(Value::as_i64)
    }

    pub fn set_replicas(&mut self, replicas: i64) {
        self.spec_mut()
            .insert("replicas".into(), Value::Number(replicas.into()));
    }

    pub fn completions(&self) -> Option<i64> {
        self.0
            .get("spec")
            .and_then(|s| s.get("completions"))
            .and_then(Value::as_i64)
    }

    pub fn set_completions(&mut self, completions: i64) {
        self.spec_mut()
            .insert("completions".into(), Value::Number(completions.into()));
    }

    /// Record which label/annotation keys this control plane manages, so the
    /// retain pass can tell our keys apart from ones a remote controller set.
    pub fn record_managed_keys(&mut self) {
        let label_keys: BTreeSet<String> = self.labels().into_keys().collect();
        let mut annotation_keys: BTreeSet<String> = self.annotations().into_keys().collect();
        annotation_keys.insert(MANAGED_LABELS_ANNOTATION.to_string());
        annotation_keys.insert(MANAGED_ANNOTATIONS_ANNOTATION.to_string());
        self.merge_annotation(MANAGED_ANNOTATIONS_ANNOTATION, &join_keys(&annotation_keys));
        self.merge_annotation(MANAGED_LABELS_ANNOTATION, &join_keys(&label_keys));
    }

    pub fn managed_label_keys(&self) -> BTreeSet<String> {
        split_keys(self.annotation(MANAGED_LABELS_ANNOTATION))
    }

    pub fn managed_annotation_keys(&self) -> BTreeSet<String> {
        split_keys(self.annotation(MANAGED_ANNOTATIONS_ANNOTATION))
    }

    /// Keep observed labels whose keys this system does not manage and the
    /// desired document does not set itself.
    pub fn retain_labels(&mut self, observed: &Manifest) {
        let managed = self.managed_label_keys();
        let mut ours = self.labels();
        for (k, v) in observed.labels() {
            if !managed.contains(&k) && !ours.contains_key(&k) {
                ours.insert(k, v);
            }
        }
        self.set_labels(ours);
    }

    /// Annotation counterpart of [`Manifest::retain_labels`].
    pub fn retain_annotations(&mut self, observed: &Manifest) {
        let managed = self.managed_annotation_keys();
        let mut ours = self.annotations();
        for (k, v) in observed.annotations() {
            if !managed.contains(&k) && !ours.contains_key(&k) {
                ours.insert(k, v);
            }
        }
        self.set_annotations(ours);
    }
}

fn join_keys(keys: &BTreeSet<String>) -> String {
    keys.iter().cloned().collect::<Vec<_>>().join(",")
}

fn split_keys(value: Option<String>) -> BTreeSet<String> {
    value
        .map(|v| {
            v.split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
