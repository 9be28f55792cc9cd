//! End-to-end scenario: a bucket, an IAM role, a policy binding the two, a
//! propagation delay and a delivery stream, plus a tag-manager subgroup that
//! consumes the stream. Applied, re-applied against the journal, changed and
//! torn down.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{Broken, CallLog, FakeCloud};
use nuage::core::{
    ComponentGroup, DependencyGraph, InputValue, Journal, Orchestrator, OutputCell,
};
use nuage::domain::{DeploymentState, NodeId, NodeState, Operation, Verdict};
use nuage::provisioners::{Provisioner, StaticProvisioner};

/// Outputs of the storage component, typed for callers
struct StorageOutputs {
    bucket_arn: OutputCell,
    bucket_name: OutputCell,
}

struct Cloud {
    log: CallLog,
    s3: Arc<FakeCloud>,
    iam: Arc<dyn Provisioner>,
    firehose: Arc<FakeCloud>,
    gtm: Arc<FakeCloud>,
}

impl Cloud {
    fn new() -> Self {
        let log = CallLog::new();
        Self {
            s3: Arc::new(FakeCloud::new("s3", &log)),
            iam: Arc::new(FakeCloud::new("iam", &log)),
            firehose: Arc::new(FakeCloud::new("firehose", &log)),
            gtm: Arc::new(FakeCloud::new("gtm", &log)),
            log,
        }
    }

    fn with_broken_iam(mut self) -> Self {
        self.iam = Arc::new(Broken);
        self
    }
}

fn storage(parent: &ComponentGroup, cloud: &Cloud, acl: &str) -> (ComponentGroup, StorageOutputs) {
    let mut group = parent.subgroup("Storage");
    let bucket = group
        .resource("Bucket", cloud.s3.clone())
        .input("acl", acl)
        .outputs(["arn", "name"])
        .build();

    let outputs = StorageOutputs {
        bucket_arn: bucket.output("arn").unwrap(),
        bucket_name: bucket.output("name").unwrap(),
    };
    group.expose("bucket_arn", outputs.bucket_arn.clone());
    group.expose("bucket_name", outputs.bucket_name.clone());
    (group, outputs)
}

fn analytics(cloud: &Cloud, acl: &str) -> DependencyGraph {
    let mut root = ComponentGroup::new("Analytics");

    let (group, storage) = storage(&root, cloud, acl);
    root.add_group(group).unwrap();

    let role = root
        .resource("Role", cloud.iam.clone())
        .input("service", "firehose.amazonaws.com")
        .outputs(["arn", "name"])
        .build();

    let policy = root
        .resource("Policy", cloud.iam.clone())
        .input("role_name", role.output("name").unwrap())
        .input(
            "resource",
            InputValue::computed(vec![storage.bucket_arn.clone()], |values| {
                json!(format!("{}/*", values[0].as_str().unwrap_or_default()))
            }),
        )
        .output("name")
        .build();

    let propagation = root
        .delay("PolicyPropagation", Duration::from_secs(10))
        .depends_on(&policy)
        .build();

    let stream = root
        .resource("Stream", cloud.firehose.clone())
        .input("bucket_arn", storage.bucket_arn.clone())
        .input("bucket_name", storage.bucket_name.clone())
        .input("role_arn", role.output("arn").unwrap())
        .depends_on(&propagation)
        .output("arn")
        .build();

    let mut gtm = root.subgroup("Gtm");
    let tag = gtm
        .resource("Tag", cloud.gtm.clone())
        .input("stream_arn", stream.output("arn").unwrap())
        .output("id")
        .build();
    gtm.expose("tag_id", tag.output("id").unwrap());
    root.add_group(gtm).unwrap();

    root.expose("stream_arn", stream.output("arn").unwrap());
    DependencyGraph::build(root).unwrap()
}

async fn journal(dir: &TempDir) -> Arc<Journal> {
    Arc::new(Journal::open(dir.path(), "prod").await.unwrap())
}

fn output(report: &nuage::ApplyReport, node: &str, name: &str) -> Value {
    report.node(node).unwrap().outputs.as_ref().unwrap()[name].clone()
}

#[tokio::test(start_paused = true)]
async fn test_apply_wires_outputs_into_dependent_inputs() {
    let cloud = Cloud::new();
    let graph = analytics(&cloud, "private");

    let report = Orchestrator::default().apply(&graph).await;
    assert_eq!(report.verdict, Verdict::Succeeded);
    assert_eq!(report.nodes.len(), 6);

    let bucket_arn = output(&report, "Analytics/Storage/Bucket", "arn");
    let role_arn = output(&report, "Analytics/Role", "arn");
    assert_eq!(bucket_arn, json!("arn:fake:s3:::Bucket"));

    let stream = report.node("Analytics/Stream").unwrap();
    let inputs = stream.inputs.as_ref().unwrap();
    assert_eq!(inputs["bucket_arn"], bucket_arn);
    assert_eq!(inputs["role_arn"], role_arn);
    assert_eq!(
        inputs["bucket_name"],
        output(&report, "Analytics/Storage/Bucket", "name")
    );

    let policy = report.node("Analytics/Policy").unwrap();
    assert_eq!(
        policy.inputs.as_ref().unwrap()["resource"],
        json!("arn:fake:s3:::Bucket/*")
    );

    // The stream waits out the propagation delay after the policy exists
    let policy_done = cloud.log.time_of("Analytics/Policy", "end").unwrap();
    let stream_started = cloud.log.time_of("Analytics/Stream", "start").unwrap();
    assert!(stream_started - policy_done >= Duration::from_secs(10));

    let tag = report.node("Analytics/Gtm/Tag").unwrap();
    assert_eq!(
        tag.inputs.as_ref().unwrap()["stream_arn"],
        output(&report, "Analytics/Stream", "arn")
    );

    // Root outputs resolve to the stream's value
    let exposed = graph.outputs()["stream_arn"].wait().await.unwrap();
    assert_eq!(exposed, json!("arn:fake:firehose:::Stream"));
}

#[tokio::test(start_paused = true)]
async fn test_reapply_against_journal_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let journal = journal(&dir).await;
    let cloud = Cloud::new();
    let orchestrator = Orchestrator::default().with_journal(journal.clone());

    let first = orchestrator
        .apply_with(&analytics(&cloud, "private"), &DeploymentState::default(), CancellationToken::new())
        .await;
    assert!(first.is_success());
    let creates = cloud.log.count("create");
    assert_eq!(creates, 5);

    let state = journal.state().await.unwrap();
    assert_eq!(state.len(), 6);

    let started = tokio::time::Instant::now();
    let second = orchestrator
        .apply_with(&analytics(&cloud, "private"), &state, CancellationToken::new())
        .await;

    assert!(second.is_success());
    for node in &second.nodes {
        assert_eq!(node.operation, Some(Operation::Unchanged), "{}", node.node_id);
        assert_eq!(node.attempts, 0);
    }
    assert_eq!(cloud.log.count("create"), creates);
    assert_eq!(cloud.log.count("update"), 0);
    // The delay is not waited out again
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(
        first.node("Analytics/Stream").unwrap().outputs,
        second.node("Analytics/Stream").unwrap().outputs
    );
}

#[tokio::test(start_paused = true)]
async fn test_changed_input_updates_only_that_resource() {
    let dir = TempDir::new().unwrap();
    let journal = journal(&dir).await;
    let cloud = Cloud::new();
    let orchestrator = Orchestrator::default().with_journal(journal.clone());

    orchestrator
        .apply_with(&analytics(&cloud, "private"), &DeploymentState::default(), CancellationToken::new())
        .await;
    let state = journal.state().await.unwrap();

    let report = orchestrator
        .apply_with(&analytics(&cloud, "log-delivery-write"), &state, CancellationToken::new())
        .await;

    assert!(report.is_success());
    assert_eq!(
        report.node("Analytics/Storage/Bucket").unwrap().operation,
        Some(Operation::Update)
    );
    assert_eq!(cloud.log.started("update"), vec!["Analytics/Storage/Bucket".to_string()]);

    // The bucket keeps its arn, so nothing downstream changes
    for id in ["Analytics/Role", "Analytics/Policy", "Analytics/Stream", "Analytics/Gtm/Tag"] {
        assert_eq!(report.node(id).unwrap().operation, Some(Operation::Unchanged), "{}", id);
    }

    let state = journal.state().await.unwrap();
    let bucket = state.get(&NodeId::new("Analytics/Storage/Bucket")).unwrap();
    assert_eq!(bucket.inputs["acl"], json!("log-delivery-write"));
    assert_eq!(state.apply_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_tears_down_dependents_first() {
    let dir = TempDir::new().unwrap();
    let journal = journal(&dir).await;
    let cloud = Cloud::new();
    let orchestrator = Orchestrator::default().with_journal(journal.clone());

    orchestrator
        .apply_with(&analytics(&cloud, "private"), &DeploymentState::default(), CancellationToken::new())
        .await;
    let state = journal.state().await.unwrap();

    let graph = analytics(&cloud, "private");
    let report = orchestrator
        .destroy(&graph, &state, CancellationToken::new())
        .await;

    assert!(report.is_success());
    assert_eq!(report.count(NodeState::Succeeded), 6);
    assert_eq!(cloud.log.count("delete"), 5);

    for node in graph.node_ids() {
        let Some(deleted_at) = cloud.log.index_of(node.as_str(), "delete", "start") else {
            continue;
        };
        for dependent in graph.transitive_dependents(node.as_str()) {
            if let Some(finished) = cloud.log.index_of(dependent.as_str(), "delete", "end") {
                assert!(finished < deleted_at, "{} deleted before its dependent {}", node, dependent);
            }
        }
    }

    assert!(!cloud.s3.exists("Analytics/Storage/Bucket"));
    assert!(!cloud.firehose.exists("Analytics/Stream"));
    assert!(!cloud.gtm.exists("Analytics/Gtm/Tag"));
    assert!(journal.state().await.unwrap().is_empty());

    // Nothing left to delete the second time round
    let again = orchestrator
        .destroy(&analytics(&cloud, "private"), &DeploymentState::default(), CancellationToken::new())
        .await;
    assert!(again.is_success());
    assert!(again.nodes.iter().all(|n| n.operation == Some(Operation::Absent)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_role_keeps_storage_and_recovers_on_reapply() {
    let dir = TempDir::new().unwrap();
    let journal = journal(&dir).await;
    let orchestrator = Orchestrator::default().with_journal(journal.clone());

    let broken = Cloud::new().with_broken_iam();
    let report = orchestrator
        .apply_with(&analytics(&broken, "private"), &DeploymentState::default(), CancellationToken::new())
        .await;

    assert_eq!(report.verdict, Verdict::Failed);
    assert_eq!(report.node("Analytics/Storage/Bucket").unwrap().state, NodeState::Succeeded);
    assert_eq!(report.node("Analytics/Role").unwrap().state, NodeState::Failed);
    for id in ["Analytics/Policy", "Analytics/PolicyPropagation", "Analytics/Stream", "Analytics/Gtm/Tag"] {
        let node = report.node(id).unwrap();
        assert_eq!(node.state, NodeState::Skipped, "{}", id);
        assert_eq!(
            node.error.as_ref().unwrap().root_cause(),
            Some(&NodeId::new("Analytics/Role"))
        );
    }

    let state = journal.state().await.unwrap();
    assert_eq!(state.len(), 1);

    // Same bucket provisioner, working IAM
    let fixed = Cloud {
        iam: Arc::new(FakeCloud::new("iam", &broken.log)),
        ..broken
    };
    let report = orchestrator
        .apply_with(&analytics(&fixed, "private"), &state, CancellationToken::new())
        .await;

    assert!(report.is_success());
    assert_eq!(
        report.node("Analytics/Storage/Bucket").unwrap().operation,
        Some(Operation::Unchanged)
    );
    assert_eq!(report.node("Analytics/Role").unwrap().operation, Some(Operation::Create));
    assert_eq!(journal.state().await.unwrap().len(), 6);
}

fn bucket_only(outputs: &[(&str, &str)]) -> DependencyGraph {
    let fixed = outputs
        .iter()
        .map(|(name, value)| (name.to_string(), json!(value)))
        .collect();
    let mut root = ComponentGroup::new("Analytics");
    root.resource("Bucket", Arc::new(StaticProvisioner::with_outputs(fixed)))
        .input("acl", "private")
        .outputs(outputs.iter().map(|(name, _)| *name))
        .build();
    DependencyGraph::build(root).unwrap()
}

#[tokio::test]
async fn test_newly_declared_output_refreshes_unchanged_resource() {
    let dir = TempDir::new().unwrap();
    let journal = journal(&dir).await;
    let orchestrator = Orchestrator::default().with_journal(journal.clone());

    let first = orchestrator
        .apply_with(&bucket_only(&[("id", "bucket-1")]), &DeploymentState::default(), CancellationToken::new())
        .await;
    assert!(first.is_success());
    let state = journal.state().await.unwrap();

    // Same inputs, one more declared output
    let graph = bucket_only(&[("id", "bucket-1"), ("arn", "arn:aws:s3:::bucket-1")]);
    let second = orchestrator
        .apply_with(&graph, &state, CancellationToken::new())
        .await;

    assert!(second.is_success(), "{:?}", second.nodes);
    let bucket = second.node("Analytics/Bucket").unwrap();
    assert_eq!(bucket.operation, Some(Operation::Update));
    assert_eq!(output(&second, "Analytics/Bucket", "arn"), json!("arn:aws:s3:::bucket-1"));
    assert_eq!(
        graph.node("Analytics/Bucket").unwrap().outputs()["arn"].wait().await.unwrap(),
        json!("arn:aws:s3:::bucket-1")
    );

    // Recorded now, so the next apply leaves it alone
    let state = journal.state().await.unwrap();
    let third = orchestrator
        .apply_with(
            &bucket_only(&[("id", "bucket-1"), ("arn", "arn:aws:s3:::bucket-1")]),
            &state,
            CancellationToken::new(),
        )
        .await;
    assert_eq!(third.node("Analytics/Bucket").unwrap().operation, Some(Operation::Unchanged));
}
