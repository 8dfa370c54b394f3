#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use flotilla_core::interpret::{FakeInterpreter, KindRef, ResourceInterpreter};
use flotilla_core::work::{
    APPLIED_OVERRIDES_ANNOTATION, BINDING_NAME_ANNOTATION, BINDING_REFERENCE_LABEL,
    CONFLICT_RESOLUTION_ANNOTATION, CONFLICT_RESOLUTION_OVERWRITE, EXECUTION_FINALIZER,
    TEMPLATE_UID_ANNOTATION, WORK_NAME_LABEL, WORK_PERMANENT_ID_LABEL,
};
use flotilla_core::{names, BackoffPolicy, Manifest, SyncError};
use flotilla_plan::{
    AppliedOverrideItem, AppliedOverrides, Binding, BindingSnapshot, CompletionsSpreader,
    EvenSpreader, NoOverrides, OverrideManager, TargetCluster, WorkGenerator,
};
use flotilla_store::{MemoryWorkStore, WorkStore};

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        duration: Duration::from_millis(1),
        jitter: 0.0,
        ..BackoffPolicy::default()
    }
}

fn generator_with(
    store: Arc<MemoryWorkStore>,
    interpreter: Arc<dyn ResourceInterpreter>,
    overrides: Arc<dyn OverrideManager>,
    spreader: Arc<dyn CompletionsSpreader>,
) -> WorkGenerator {
    WorkGenerator::new(store, interpreter, overrides, spreader, fast_backoff())
}

fn generator(store: Arc<MemoryWorkStore>) -> WorkGenerator {
    generator_with(
        store,
        Arc::new(FakeInterpreter::new()),
        Arc::new(NoOverrides),
        Arc::new(EvenSpreader),
    )
}

fn deployment_template() -> Manifest {
    Manifest::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": "web",
            "namespace": "shop",
            "uid": "tpl-uid-1",
            "labels": {"app": "web"}
        },
        "spec": {"replicas": 1}
    }))
    .unwrap()
}

fn job_template(completions: Option<i64>) -> Manifest {
    let mut value = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {"name": "crunch", "namespace": "shop", "uid": "tpl-uid-2"},
        "spec": {"parallelism": 2}
    });
    if let Some(total) = completions {
        value["spec"]["completions"] = json!(total);
    }
    Manifest::from_value(value).unwrap()
}

fn binding(clusters: &[(&str, i64)]) -> Binding {
    Binding {
        namespace: Some("shop".into()),
        name: "web-binding".into(),
        clusters: clusters
            .iter()
            .map(|(name, replicas)| TargetCluster {
                name: name.to_string(),
                replicas: *replicas,
            })
            .collect(),
        required_by: Vec::new(),
        conflict_resolution: None,
    }
}

async fn work_for(
    store: &MemoryWorkStore,
    template: &Manifest,
    cluster: &str,
) -> flotilla_core::Work {
    let name = names::work_name(template.kind(), template.name(), template.namespace());
    store
        .get(&names::execution_namespace(cluster), &name)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("no work for cluster {}", cluster))
}

fn manifest_of(work: &flotilla_core::Work) -> Manifest {
    assert_eq!(work.spec.manifests.len(), 1);
    Manifest::from_value(work.spec.manifests[0].clone()).unwrap()
}

#[tokio::test]
async fn creates_one_work_per_target_cluster() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = deployment_template();

    gen.ensure_work(&template, &binding(&[("edge-1", 2), ("edge-2", 3)]))
        .await
        .unwrap();

    assert_eq!(store.len(), 2);
    for cluster in ["edge-1", "edge-2"] {
        let work = work_for(&store, &template, cluster).await;
        assert!(work.has_finalizer(EXECUTION_FINALIZER));
        assert!(work.labels.contains_key(BINDING_REFERENCE_LABEL));
        assert!(work.labels.contains_key(WORK_PERMANENT_ID_LABEL));
        assert_eq!(
            work.annotations.get(BINDING_NAME_ANNOTATION).map(String::as_str),
            Some("web-binding")
        );
        assert_eq!(
            work.annotations.get(TEMPLATE_UID_ANNOTATION).map(String::as_str),
            Some("tpl-uid-1")
        );

        let manifest = manifest_of(&work);
        assert_eq!(manifest.label(WORK_NAME_LABEL).as_deref(), Some(work.name.as_str()));
        assert_eq!(
            manifest.label(WORK_PERMANENT_ID_LABEL),
            work.labels.get(WORK_PERMANENT_ID_LABEL).cloned()
        );
        // the propagated manifest records what it manages
        assert!(!manifest.managed_label_keys().is_empty());
    }
}

#[tokio::test]
async fn empty_target_set_has_no_side_effects() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    gen.ensure_work(&deployment_template(), &binding(&[]))
        .await
        .unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn required_by_clusters_are_merged_in() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = deployment_template();

    let mut b = binding(&[("edge-1", 2)]);
    b.required_by = vec![BindingSnapshot {
        namespace: Some("shop".into()),
        name: "consumer".into(),
        clusters: vec![
            TargetCluster {
                name: "edge-1".into(),
                replicas: 9,
            },
            TargetCluster {
                name: "edge-3".into(),
                replicas: 1,
            },
        ],
    }];
    gen.ensure_work(&template, &b).await.unwrap();

    assert_eq!(store.len(), 2);
    work_for(&store, &template, "edge-1").await;
    work_for(&store, &template, "edge-3").await;

    let listed = store.list_by_binding(Some("shop"), "web-binding").await.unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn replica_revision_hook_runs_per_cluster() {
    let store = Arc::new(MemoryWorkStore::new());
    let interpreter = FakeInterpreter::new().with_revise_replica(
        KindRef {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
        },
        |mut manifest, replicas, _cluster| {
            manifest.set_replicas(replicas);
            Ok(manifest)
        },
    );
    let gen = generator_with(
        Arc::clone(&store),
        Arc::new(interpreter),
        Arc::new(NoOverrides),
        Arc::new(EvenSpreader),
    );
    let template = deployment_template();

    gen.ensure_work(&template, &binding(&[("edge-1", 2), ("edge-2", 5)]))
        .await
        .unwrap();

    let m1 = manifest_of(&work_for(&store, &template, "edge-1").await);
    let m2 = manifest_of(&work_for(&store, &template, "edge-2").await);
    assert_eq!(m1.replicas(), Some(2));
    assert_eq!(m2.replicas(), Some(5));
}

#[tokio::test]
async fn job_completions_are_divided_across_clusters() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = job_template(Some(7));

    gen.ensure_work(&template, &binding(&[("edge-1", 0), ("edge-2", 0)]))
        .await
        .unwrap();

    let m1 = manifest_of(&work_for(&store, &template, "edge-1").await);
    let m2 = manifest_of(&work_for(&store, &template, "edge-2").await);
    assert_eq!(m1.completions().unwrap() + m2.completions().unwrap(), 7);
    assert_eq!(m1.completions(), Some(4));
    assert_eq!(m2.completions(), Some(3));
    // parallelism rides along untouched
    assert_eq!(m1.as_value()["spec"]["parallelism"], json!(2));
}

#[tokio::test]
async fn work_queue_style_job_is_not_spread() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = job_template(None);

    gen.ensure_work(&template, &binding(&[("edge-1", 0), ("edge-2", 0)]))
        .await
        .unwrap();

    let m1 = manifest_of(&work_for(&store, &template, "edge-1").await);
    assert_eq!(m1.completions(), None);
}

struct ScalingOverride;

impl OverrideManager for ScalingOverride {
    fn apply_override_policies(
        &self,
        manifest: &mut Manifest,
        cluster: &str,
    ) -> Result<(Option<AppliedOverrides>, Option<AppliedOverrides>), SyncError> {
        manifest.set_replicas(99);
        let applied = AppliedOverrides {
            items: vec![AppliedOverrideItem {
                policy: format!("scale-{}", cluster),
                overriders: json!({"replicas": 99}),
            }],
        };
        Ok((None, Some(applied)))
    }
}

#[tokio::test]
async fn overrides_run_last_and_are_recorded() {
    let store = Arc::new(MemoryWorkStore::new());
    let interpreter = FakeInterpreter::new().with_revise_replica(
        KindRef {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
        },
        |mut manifest, replicas, _cluster| {
            manifest.set_replicas(replicas);
            Ok(manifest)
        },
    );
    let gen = generator_with(
        Arc::clone(&store),
        Arc::new(interpreter),
        Arc::new(ScalingOverride),
        Arc::new(EvenSpreader),
    );
    let template = deployment_template();

    gen.ensure_work(&template, &binding(&[("edge-1", 2)]))
        .await
        .unwrap();

    let work = work_for(&store, &template, "edge-1").await;
    let manifest = manifest_of(&work);
    // the override wins over the revised replica figure
    assert_eq!(manifest.replicas(), Some(99));
    let audit = work
        .annotations
        .get(APPLIED_OVERRIDES_ANNOTATION)
        .expect("audit annotation");
    assert!(audit.contains("scale-edge-1"), "audit={}", audit);
}

#[tokio::test]
async fn permanent_id_survives_regeneration() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = deployment_template();
    let b = binding(&[("edge-1", 2)]);

    gen.ensure_work(&template, &b).await.unwrap();
    let first = work_for(&store, &template, "edge-1").await;
    let id = first.labels.get(WORK_PERMANENT_ID_LABEL).cloned().unwrap();

    gen.ensure_work(&template, &b).await.unwrap();
    let second = work_for(&store, &template, "edge-1").await;
    assert_eq!(second.labels.get(WORK_PERMANENT_ID_LABEL), Some(&id));
    assert!(second.resource_version > first.resource_version);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn upsert_replaces_manifests_in_place() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = deployment_template();
    let b = binding(&[("edge-1", 2)]);
    gen.ensure_work(&template, &b).await.unwrap();

    let mut value = template.clone().into_value();
    value["spec"]["replicas"] = json!(10);
    let changed = Manifest::from_value(value).unwrap();
    gen.ensure_work(&changed, &b).await.unwrap();

    let work = work_for(&store, &template, "edge-1").await;
    assert_eq!(manifest_of(&work).replicas(), Some(10));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn upsert_conflict_is_retried() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = deployment_template();
    let b = binding(&[("edge-1", 2)]);
    gen.ensure_work(&template, &b).await.unwrap();

    store.fail_next_updates(1);
    gen.ensure_work(&template, &b).await.unwrap();
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn ensure_against_deleting_work_fails() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = deployment_template();
    let b = binding(&[("edge-1", 2)]);
    gen.ensure_work(&template, &b).await.unwrap();

    let work = work_for(&store, &template, "edge-1").await;
    store.delete(&work.namespace, &work.name).await.unwrap();

    let err = gen.ensure_work(&template, &b).await.unwrap_err();
    assert!(err.to_string().contains("being deleted"), "err={}", err);
}

#[tokio::test]
async fn conflict_resolution_directive_is_propagated() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator(Arc::clone(&store));
    let template = deployment_template();
    let mut b = binding(&[("edge-1", 2)]);
    b.conflict_resolution = Some(CONFLICT_RESOLUTION_OVERWRITE.to_string());

    gen.ensure_work(&template, &b).await.unwrap();

    let work = work_for(&store, &template, "edge-1").await;
    assert_eq!(
        work.annotations
            .get(CONFLICT_RESOLUTION_ANNOTATION)
            .map(String::as_str),
        Some(CONFLICT_RESOLUTION_OVERWRITE)
    );
    let manifest = manifest_of(&work);
    assert_eq!(
        manifest.annotation(CONFLICT_RESOLUTION_ANNOTATION).as_deref(),
        Some(CONFLICT_RESOLUTION_OVERWRITE)
    );
}

struct LossySpreader;

impl CompletionsSpreader for LossySpreader {
    fn spread(
        &self,
        _total: i64,
        targets: &[TargetCluster],
    ) -> Result<Vec<TargetCluster>, SyncError> {
        Ok(targets.to_vec())
    }
}

#[tokio::test]
async fn sum_violating_spreader_is_rejected() {
    let store = Arc::new(MemoryWorkStore::new());
    let gen = generator_with(
        Arc::clone(&store),
        Arc::new(FakeInterpreter::new()),
        Arc::new(NoOverrides),
        Arc::new(LossySpreader),
    );
    let err = gen
        .ensure_work(&job_template(Some(7)), &binding(&[("edge-1", 0), ("edge-2", 0)]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("partition"), "err={}", err);
    assert!(store.is_empty());
}
