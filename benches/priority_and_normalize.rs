use backup_forge::backup_pipeline::normalize_and_serialize;
use backup_forge::priority_engine::{LabelRule, NamespaceOverride, PriorityEngine, PriorityPolicy};
use backup_forge::runtime_config::PipelineConfig;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn bench_priority_computation(c: &mut Criterion) {
    let engine = PriorityEngine::new(PriorityPolicy {
        namespace_overrides: vec![
            NamespaceOverride {
                namespace: "prod".to_string(),
                boost: 10,
            },
            NamespaceOverride {
                namespace: "staging".to_string(),
                boost: 5,
            },
        ],
        label_rules: vec![LabelRule {
            key: "backup-priority".to_string(),
            value: Some("high".to_string()),
            boost: 15,
        }],
        ..PriorityPolicy::default()
    });
    let labels = json!({"backup-priority": "high", "app": "web"});

    c.bench_function("priority_of_labeled_object", |b| {
        b.iter(|| {
            engine.priority_of(
                black_box("deployments"),
                black_box(Some("prod")),
                black_box(Some(&labels)),
                black_box(Some(256 * 1024)),
            )
        })
    });

    c.bench_function("priority_of_unknown_kind", |b| {
        b.iter(|| engine.priority_of(black_box("widgets"), None, None, None))
    });
}

fn bench_normalization(c: &mut Criterion) {
    let config = PipelineConfig::default();
    let object = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": "web",
            "namespace": "prod",
            "labels": {"app": "web", "tier": "frontend"},
            "managedFields": [
                {"manager": "kubectl", "operation": "Apply", "fieldsV1": {"f:spec": {}}},
                {"manager": "controller", "operation": "Update", "fieldsV1": {"f:status": {}}}
            ]
        },
        "spec": {
            "replicas": 3,
            "template": {
                "spec": {
                    "containers": [
                        {"name": "web", "image": "registry.example/web:1.2.3",
                         "env": [{"name": "MODE", "value": "prod"}]}
                    ]
                }
            }
        },
        "status": {"readyReplicas": 3, "conditions": [{"type": "Available", "status": "True"}]}
    });

    c.bench_function("normalize_and_serialize_deployment", |b| {
        b.iter(|| normalize_and_serialize(black_box(&object), &config))
    });
}

criterion_group!(benches, bench_priority_computation, bench_normalization);
criterion_main!(benches);
