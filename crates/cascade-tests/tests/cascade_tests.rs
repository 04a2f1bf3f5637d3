//! End-to-end trigger cascade tests over PostgreSQL.
//!
//! Run with: `cargo test -p cascade-tests --test cascade_tests --features integration`

#![cfg(feature = "integration")]

use cascade_core::build::{BuildStatus, PipelineBuild};
use cascade_core::events::Event;
use cascade_core::parameter::Parameter;
use cascade_core::pipeline::PipelineType;
use cascade_core::ports::{BuildJobRepository, BuildRepository, EventBus};
use cascade_core::prerequisite::Prerequisite;
use cascade_core::trigger::{Trigger, TriggerNode};
use cascade_db::Repositories;
use cascade_scheduler::{
    BuildLifecycleManager, BuildRequest, EventDispatcher, InProcessEventBus, TriggerCascade,
    event_channel,
};
use cascade_tests::context::{PostgresOnlyContext, TestContext};
use cascade_tests::{TestScheduler, assert_completes_within, register_worker, scheduler_ports};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// Run every job of the build's current stage to `status`.
async fn finish_stage(
    ctx: &PostgresOnlyContext,
    test: &TestScheduler,
    build: &PipelineBuild,
    status: BuildStatus,
) {
    let jobs = ctx.repos.jobs.list_for_build(build.id).await.unwrap();
    for job in jobs.into_iter().filter(|j| j.status == BuildStatus::Waiting) {
        let worker = register_worker(ctx.db.pool()).await.unwrap();
        test.scheduler.take_job(job.id, worker).await.unwrap();
        test.scheduler.report_job_status(job.id, status).await.unwrap();
    }
}

/// A cascade wired the way a separate replica would be.
fn replica(repos: &Repositories, instance_id: &str) -> (TriggerCascade, EventDispatcher) {
    let ports = scheduler_ports(repos);
    let (events, dispatcher) = event_channel(Arc::new(InProcessEventBus::default()), 64);
    let lifecycle = Arc::new(BuildLifecycleManager::new(
        &ports,
        events.clone(),
        50,
        instance_id,
    ));
    let cascade = TriggerCascade::new(
        &ports,
        lifecycle,
        events,
        Duration::from_secs(30),
        instance_id,
    );
    (cascade, dispatcher)
}

#[tokio::test]
async fn test_push_cascades_to_downstream_pipeline() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let build = catalog
        .pipeline("build", PipelineType::Build, &["compile", "test"])
        .await
        .unwrap();
    let package = catalog
        .pipeline("package", PipelineType::Build, &["archive"])
        .await
        .unwrap();
    let (src, dest) = (catalog.build_node(&build), catalog.build_node(&package));

    let test = TestScheduler::start(&ctx.repos, "replica-a");
    test.scheduler
        .graph()
        .insert_trigger(
            &Trigger::new(src, dest)
                .with_parameter(Parameter::new("artifact", "{{.cds.application}}-{{.git.branch}}")),
        )
        .await
        .unwrap();
    let mut fired = test.bus.subscribe("trigger.fired.>").await.unwrap();

    let parent = test
        .scheduler
        .handle_push(src, &catalog.push("main", "feed01", "ship it"))
        .await
        .unwrap()
        .into_build()
        .unwrap();

    finish_stage(&ctx, &test, &parent, BuildStatus::Success).await;
    assert!(ctx.repos.builds.children(parent.id).await.unwrap().is_empty());

    let parent = ctx.repos.builds.get(parent.id).await.unwrap().unwrap();
    finish_stage(&ctx, &test, &parent, BuildStatus::Success).await;

    let parent = ctx.repos.builds.get(parent.id).await.unwrap().unwrap();
    assert_eq!(parent.status, BuildStatus::Success);

    let children = ctx.repos.builds.children(parent.id).await.unwrap();
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.node(), dest);
    assert_eq!(child.version, parent.version);
    assert_eq!(child.branch(), Some("main"));
    assert_eq!(child.parameters.get("artifact"), Some("api-main"));
    assert_eq!(child.parameters.get("cds.parent.buildNumber"), Some("1"));
    assert_eq!(child.parameters.get("cds.parent.pipeline"), Some("build"));

    let event = assert_completes_within(fired.next(), Duration::from_secs(5))
        .await
        .expect("stream closed")
        .unwrap();
    assert!(matches!(
        event,
        Event::TriggerFired(p) if p.parent_build_id == parent.id && p.child_build_id == child.id
    ));

    test.stop().await;
}

#[tokio::test]
async fn test_cascade_respects_prerequisites_and_environment() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let staging = catalog.add_environment("staging").await.unwrap();
    let build = catalog
        .pipeline("build", PipelineType::Build, &["compile"])
        .await
        .unwrap();
    let deploy = catalog
        .pipeline("deploy", PipelineType::Deployment, &["rollout"])
        .await
        .unwrap();
    let src = catalog.build_node(&build);
    let to_staging = TriggerNode::new(catalog.application.id, deploy.id, staging.id);
    let gated = catalog
        .pipeline("release", PipelineType::Build, &["tag"])
        .await
        .unwrap();

    let test = TestScheduler::start(&ctx.repos, "replica-a");
    test.scheduler
        .graph()
        .insert_trigger(&Trigger::new(src, to_staging))
        .await
        .unwrap();
    test.scheduler
        .graph()
        .insert_trigger(
            &Trigger::new(src, catalog.build_node(&gated))
                .with_prerequisite(Prerequisite::new("git.branch", "^release/.*$")),
        )
        .await
        .unwrap();

    let parent = test
        .scheduler
        .handle_push(src, &catalog.push("main", "beef02", "fix"))
        .await
        .unwrap()
        .into_build()
        .unwrap();
    finish_stage(&ctx, &test, &parent, BuildStatus::Success).await;

    let children = ctx.repos.builds.children(parent.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].node(), to_staging);
    assert_eq!(children[0].status, BuildStatus::Building);
    assert_eq!(children[0].parameters.get("cds.environment"), Some("staging"));

    test.stop().await;
}

#[tokio::test]
async fn test_failed_build_does_not_cascade_until_restarted() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let build = catalog
        .pipeline("build", PipelineType::Build, &["compile"])
        .await
        .unwrap();
    let package = catalog
        .pipeline("package", PipelineType::Build, &["archive"])
        .await
        .unwrap();
    let src = catalog.build_node(&build);

    let test = TestScheduler::start(&ctx.repos, "replica-a");
    test.scheduler
        .graph()
        .insert_trigger(&Trigger::new(src, catalog.build_node(&package)))
        .await
        .unwrap();

    let parent = test
        .scheduler
        .create_build(BuildRequest::manual(src, "lee"))
        .await
        .unwrap()
        .into_build()
        .unwrap();
    finish_stage(&ctx, &test, &parent, BuildStatus::Fail).await;

    let failed = ctx.repos.builds.get(parent.id).await.unwrap().unwrap();
    assert_eq!(failed.status, BuildStatus::Fail);
    assert!(ctx.repos.builds.children(parent.id).await.unwrap().is_empty());

    let restarted = test.scheduler.restart_build(parent.id).await.unwrap();
    assert_eq!(restarted.status, BuildStatus::Building);
    // The failed job is reset in place, not duplicated.
    let jobs = ctx.repos.jobs.list_for_build(parent.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, BuildStatus::Waiting);

    finish_stage(&ctx, &test, &restarted, BuildStatus::Success).await;
    assert_eq!(ctx.repos.builds.children(parent.id).await.unwrap().len(), 1);

    // Every successful run fires the triggers again.
    let rerun = test.scheduler.restart_build(parent.id).await.unwrap();
    finish_stage(&ctx, &test, &rerun, BuildStatus::Success).await;
    let children = ctx.repos.builds.children(parent.id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[1].build_number, 2);

    test.stop().await;
}

#[tokio::test]
async fn test_replicas_create_each_child_once() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let build = catalog
        .pipeline("build", PipelineType::Build, &["compile"])
        .await
        .unwrap();
    let package = catalog
        .pipeline("package", PipelineType::Build, &["archive"])
        .await
        .unwrap();
    let src = catalog.build_node(&build);
    let test = TestScheduler::start(&ctx.repos, "replica-origin");

    let parent = test
        .scheduler
        .create_build(BuildRequest::manual(src, "max"))
        .await
        .unwrap()
        .into_build()
        .unwrap();
    finish_stage(&ctx, &test, &parent, BuildStatus::Success).await;
    let parent = ctx.repos.builds.get(parent.id).await.unwrap().unwrap();
    assert_eq!(parent.status, BuildStatus::Success);

    // The edge appears after the parent finished, so only the replicas fire it.
    test.scheduler
        .graph()
        .insert_trigger(&Trigger::new(src, catalog.build_node(&package)))
        .await
        .unwrap();

    let (cascade_a, _dispatcher_a) = replica(&ctx.repos, "replica-a");
    let (cascade_b, _dispatcher_b) = replica(&ctx.repos, "replica-b");
    let (a, b) = tokio::join!(
        cascade_a.on_build_success(&parent),
        cascade_b.on_build_success(&parent)
    );
    let created = a.unwrap().len() + b.unwrap().len();
    assert_eq!(created, 1);

    // A later pass finds the child and does nothing.
    assert!(cascade_a.on_build_success(&parent).await.unwrap().is_empty());
    assert_eq!(ctx.repos.builds.children(parent.id).await.unwrap().len(), 1);

    test.stop().await;
}

#[tokio::test]
async fn test_stop_build_fails_open_jobs() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let build = catalog
        .pipeline("build", PipelineType::Build, &["compile"])
        .await
        .unwrap();
    let test = TestScheduler::start(&ctx.repos, "replica-a");

    let running = test
        .scheduler
        .create_build(BuildRequest::manual(catalog.build_node(&build), "ana"))
        .await
        .unwrap()
        .into_build()
        .unwrap();

    let stopped = test.scheduler.stop_build(running.id).await.unwrap();
    assert_eq!(stopped.status, BuildStatus::Fail);
    let jobs = ctx.repos.jobs.list_for_build(running.id).await.unwrap();
    assert!(jobs.iter().all(|j| j.status == BuildStatus::Fail));

    test.stop().await;
}
