//! YAML definitions, loaded, built into a graph and applied.

use std::fs;

use serde_json::json;
use tempfile::TempDir;

use nuage::core::{Definition, DependencyGraph, GraphError};
use nuage::domain::{NodeState, Operation};
use nuage::Orchestrator;

const ANALYTICS: &str = r#"
name: analytics
description: Bucket, role and delivery stream
outputs:
  stream_bucket: { ref: stream.bucket_arn }
  tag: { ref: gtm.tag }
resources:
  - name: account
    provisioner: { static: { account_id: "123456789012" } }
    outputs: [account_id]
  - name: role
    inputs:
      arn: { format: "arn:aws:iam::${account.account_id}:role/firehose" }
    outputs: [arn]
  - name: propagation
    provisioner: { delay: 0.1 }
    depends_on: [role]
  - name: stream
    depends_on: [propagation]
    inputs:
      bucket_arn: "arn:aws:s3:::analytics-raw"
      role_arn: { ref: role.arn }
      buffer_seconds: 60
    outputs: [bucket_arn]
components:
  - name: gtm
    outputs:
      tag: { ref: tag.id }
    resources:
      - name: tag
        inputs:
          id: { format: "GTM-${stream.bucket_arn}" }
        outputs: [id]
"#;

#[test]
fn test_definition_builds_scoped_graph() {
    let definition = Definition::from_yaml(ANALYTICS).unwrap();
    assert_eq!(definition.resource_count(), 5);

    let graph = DependencyGraph::build(definition.build().unwrap()).unwrap();
    let ids: Vec<&str> = graph.node_ids().map(|id| id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "analytics/account",
            "analytics/role",
            "analytics/propagation",
            "analytics/stream",
            "analytics/gtm/tag",
        ]
    );

    let levels: Vec<Vec<&str>> = graph
        .levels()
        .into_iter()
        .map(|level| level.into_iter().map(|id| id.as_str()).collect())
        .collect();
    assert_eq!(
        levels,
        vec![
            vec!["analytics/account"],
            vec!["analytics/role"],
            vec!["analytics/propagation"],
            vec!["analytics/stream"],
            vec!["analytics/gtm/tag"],
        ]
    );
}

#[tokio::test]
async fn test_definition_applies_end_to_end() {
    let definition = Definition::from_yaml(ANALYTICS).unwrap();
    let graph = DependencyGraph::build(definition.build().unwrap()).unwrap();

    let report = Orchestrator::default().apply(&graph).await;
    assert!(report.is_success(), "{:?}", report.nodes);

    let role = report.node("analytics/role").unwrap();
    assert_eq!(
        role.inputs.as_ref().unwrap()["arn"],
        json!("arn:aws:iam::123456789012:role/firehose")
    );

    let stream = report.node("analytics/stream").unwrap();
    let inputs = stream.inputs.as_ref().unwrap();
    assert_eq!(inputs["role_arn"], json!("arn:aws:iam::123456789012:role/firehose"));
    assert_eq!(inputs["buffer_seconds"], json!(60));

    assert_eq!(
        graph.outputs()["tag"].wait().await.unwrap(),
        json!("GTM-arn:aws:s3:::analytics-raw")
    );
    assert_eq!(
        graph.outputs()["stream_bucket"].wait().await.unwrap(),
        json!("arn:aws:s3:::analytics-raw")
    );
}

#[test]
fn test_cycle_in_depends_on_is_reported() {
    let yaml = r#"
name: app
resources:
  - name: a
    depends_on: [b]
  - name: b
    depends_on: [a]
"#;
    let root = Definition::from_yaml(yaml).unwrap().build().unwrap();
    match DependencyGraph::build(root) {
        Err(GraphError::CycleDetected { cycle }) => {
            let names: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
            assert_eq!(names, vec!["app/a", "app/b", "app/a"]);
        }
        other => panic!("expected a cycle, got {:?}", other.map(|g| g.len())),
    }
}

#[test]
fn test_unknown_depends_on_is_reported() {
    let yaml = "name: app\nresources:\n  - name: a\n    depends_on: [ghost]\n";
    let root = Definition::from_yaml(yaml).unwrap().build().unwrap();
    assert!(matches!(
        DependencyGraph::build(root),
        Err(GraphError::UnknownDependency { ref dependency, .. }) if dependency == "ghost"
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_provisioner_runs_from_definition_dir() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("bucket.sh"),
        "cat > /dev/null\necho \"{\\\"id\\\": \\\"bucket-1\\\", \\\"arn\\\": \\\"arn:aws:s3:::$NUAGE_RESOURCE\\\"}\"\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("stack.yaml"),
        r#"
name: data
resources:
  - name: bucket
    provisioner: { command: ["sh", "./bucket.sh"] }
    inputs:
      acl: private
    outputs: [id, arn]
  - name: stream
    inputs:
      log_group: { format: "/aws/firehose/${bucket.id}" }
      bucket_arn: { ref: bucket.arn }
"#,
    )
    .unwrap();

    let definition = Definition::from_file(&dir.path().join("stack.yaml")).unwrap();
    let graph = DependencyGraph::build(definition.build().unwrap()).unwrap();
    let report = Orchestrator::default().apply(&graph).await;

    assert!(report.is_success(), "{:?}", report.nodes);
    let bucket = report.node("data/bucket").unwrap();
    assert_eq!(bucket.operation, Some(Operation::Create));

    let stream = report.node("data/stream").unwrap();
    assert_eq!(stream.state, NodeState::Succeeded);
    let inputs = stream.inputs.as_ref().unwrap();
    assert_eq!(inputs["log_group"], json!("/aws/firehose/bucket-1"));
    assert_eq!(inputs["bucket_arn"], json!("arn:aws:s3:::data/bucket"));
}

#[test]
fn test_demo_definition_builds() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/analytics/analytics.yaml");
    let definition = Definition::from_file(&path).unwrap();
    let graph = DependencyGraph::build(definition.build().unwrap()).unwrap();

    assert_eq!(graph.len(), 7);
    assert_eq!(
        graph
            .dependencies("analytics/stream")
            .into_iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>(),
        vec!["analytics/bucket", "analytics/role", "analytics/propagation"]
    );
    assert!(graph.outputs().contains_key("container_id"));
}
