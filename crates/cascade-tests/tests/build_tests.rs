//! Build creation integration tests: numbering, deduplication, history.
//!
//! Run with: `cargo test -p cascade-tests --test build_tests --features integration`

#![cfg(feature = "integration")]

use cascade_core::build::{BuildOutcome, BuildStatus, SuppressionReason};
use cascade_core::pipeline::PipelineType;
use cascade_core::ports::{BuildJobRepository, BuildRepository};
use cascade_scheduler::{BuildRequest, SchedulerConfig};
use cascade_tests::TestScheduler;
use cascade_tests::context::TestContext;
use cascade_tests::fixtures::commit;
use futures::future::join_all;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_concurrent_builds_get_distinct_numbers() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let pipeline = catalog
        .pipeline("build", PipelineType::Build, &["compile"])
        .await
        .unwrap();
    let node = catalog.build_node(&pipeline);

    let a = TestScheduler::start(&ctx.repos, "replica-a");
    let b = TestScheduler::start(&ctx.repos, "replica-b");

    let requests = (0..10).map(|i| {
        let scheduler = if i % 2 == 0 { &a.scheduler } else { &b.scheduler };
        scheduler.create_build(BuildRequest::manual(node, format!("user-{}", i)))
    });
    let mut numbers: Vec<i64> = join_all(requests)
        .await
        .into_iter()
        .map(|outcome| {
            outcome
                .expect("Failed to create build")
                .into_build()
                .expect("Build suppressed")
                .build_number
        })
        .collect();
    numbers.sort_unstable();

    assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
    assert_eq!(ctx.repos.builds.last_build_number(&node).await.unwrap(), 10);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_duplicate_push_suppressed() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let pipeline = catalog
        .pipeline("build", PipelineType::Build, &["compile"])
        .await
        .unwrap();
    let node = catalog.build_node(&pipeline);
    let test = TestScheduler::start(&ctx.repos, "replica-a");

    let push = catalog.push("main", "c0ffee", "add feature");
    let first = test
        .scheduler
        .handle_push(node, &push)
        .await
        .unwrap()
        .into_build()
        .unwrap();
    // Pushes on the application's own repository carry no remote.
    assert_eq!(first.vcs.as_ref().and_then(|v| v.remote.clone()), None);

    let second = test.scheduler.handle_push(node, &push).await.unwrap();
    assert!(matches!(
        second,
        BuildOutcome::Suppressed(SuppressionReason::Duplicate { existing }) if existing == first.id
    ));

    let other_branch = catalog.push("develop", "c0ffee", "add feature");
    let third = test
        .scheduler
        .handle_push(node, &other_branch)
        .await
        .unwrap()
        .into_build()
        .unwrap();
    assert_eq!(third.build_number, 2);

    test.stop().await;
}

#[tokio::test]
async fn test_skip_marker_consumes_no_number() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let pipeline = catalog
        .pipeline("build", PipelineType::Build, &["compile"])
        .await
        .unwrap();
    let node = catalog.build_node(&pipeline);
    let test = TestScheduler::start(&ctx.repos, "replica-a");

    let outcome = test
        .scheduler
        .handle_push(node, &catalog.push("main", "abc123", "docs [ci skip]"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        BuildOutcome::Suppressed(SuppressionReason::SkipCommit)
    ));
    assert_eq!(ctx.repos.builds.last_build_number(&node).await.unwrap(), 0);

    test.stop().await;
}

#[tokio::test]
async fn test_build_records_context_and_previous_hash() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let pipeline = catalog
        .pipeline("build", PipelineType::Build, &["compile", "test"])
        .await
        .unwrap();
    let node = catalog.build_node(&pipeline);
    let test = TestScheduler::start(&ctx.repos, "replica-a");

    let first = test
        .scheduler
        .create_build(BuildRequest::vcs_push(node, commit("main", "aaa111")))
        .await
        .unwrap()
        .into_build()
        .unwrap();
    let second = test
        .scheduler
        .create_build(BuildRequest::vcs_push(node, commit("main", "bbb222")))
        .await
        .unwrap()
        .into_build()
        .unwrap();

    assert_eq!(first.parameters.get("git.previousHash"), None);
    assert_eq!(second.parameters.get("git.previousHash"), Some("aaa111"));
    assert_eq!(second.parameters.get("cds.application"), Some("api"));
    assert_eq!(second.parameters.get("cds.pipeline"), Some("build"));
    assert_eq!(second.parameters.get("cds.buildNumber"), Some("2"));
    assert_eq!(second.parameters.get("cds.version"), Some("2"));

    // Only the first stage is queued.
    let jobs = ctx.repos.jobs.list_for_build(second.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].stage_id, pipeline.stages[0].id);
    assert_eq!(second.status, BuildStatus::Building);

    test.stop().await;
}

#[tokio::test]
async fn test_type_mismatch_creates_disabled_build() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let pipeline = catalog
        .pipeline("deploy", PipelineType::Deployment, &["rollout"])
        .await
        .unwrap();
    let test = TestScheduler::start(&ctx.repos, "replica-a");

    // A deployment pipeline without an environment cannot run.
    let build = test
        .scheduler
        .create_build(BuildRequest::manual(catalog.build_node(&pipeline), "ivy"))
        .await
        .unwrap()
        .into_build()
        .unwrap();
    assert_eq!(build.status, BuildStatus::Disabled);
    assert!(
        ctx.repos
            .jobs
            .list_for_build(build.id)
            .await
            .unwrap()
            .is_empty()
    );

    test.stop().await;
}

#[tokio::test]
async fn test_archived_builds_keep_numbering() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    // No stages: every build is skipped, hence terminal, right away.
    let pipeline = catalog
        .pipeline("noop", PipelineType::Build, &[])
        .await
        .unwrap();
    let node = catalog.build_node(&pipeline);
    let test = TestScheduler::start_with(
        &ctx.repos,
        SchedulerConfig {
            history_retention: 2,
            instance_id: "replica-a".to_string(),
            ..SchedulerConfig::default()
        },
    );

    for _ in 0..5 {
        let build = test
            .scheduler
            .create_build(BuildRequest::manual(node, "jo"))
            .await
            .unwrap()
            .into_build()
            .unwrap();
        assert_eq!(build.status, BuildStatus::Skipped);
    }

    assert!(ctx.repos.builds.get_by_number(&node, 1).await.unwrap().is_none());
    assert!(ctx.repos.builds.get_by_number(&node, 5).await.unwrap().is_some());
    let live = ctx.repos.builds.list(&node, None, 100).await.unwrap();
    assert_eq!(live.len(), 3);

    let next = test
        .scheduler
        .create_build(BuildRequest::manual(node, "jo"))
        .await
        .unwrap()
        .into_build()
        .unwrap();
    assert_eq!(next.build_number, 6);

    test.stop().await;
}

#[tokio::test]
async fn test_archived_push_still_suppresses_duplicate() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let pipeline = catalog
        .pipeline("noop", PipelineType::Build, &[])
        .await
        .unwrap();
    let node = catalog.build_node(&pipeline);
    let test = TestScheduler::start_with(
        &ctx.repos,
        SchedulerConfig {
            history_retention: 2,
            instance_id: "replica-a".to_string(),
            ..SchedulerConfig::default()
        },
    );

    let mut first = None;
    for i in 0..5 {
        let push = catalog.push("main", &format!("hash-{i}"), "change");
        let build = test
            .scheduler
            .handle_push(node, &push)
            .await
            .unwrap()
            .into_build()
            .unwrap();
        first.get_or_insert(build.id);
    }
    assert!(ctx.repos.builds.get_by_number(&node, 1).await.unwrap().is_none());

    // A redelivered webhook for the archived commit.
    let replay = catalog.push("main", "hash-0", "change");
    let outcome = test.scheduler.handle_push(node, &replay).await.unwrap();
    assert!(matches!(
        outcome,
        BuildOutcome::Suppressed(SuppressionReason::Duplicate { existing }) if Some(existing) == first
    ));

    test.stop().await;
}
