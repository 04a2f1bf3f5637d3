//! Stale job reconciliation integration tests.
//!
//! Run with: `cargo test -p cascade-tests --test reconciler_tests --features integration`

#![cfg(feature = "integration")]

use cascade_core::Error;
use cascade_core::build::{BuildStatus, PipelineBuildJob};
use cascade_core::pipeline::PipelineType;
use cascade_core::ports::{BuildJobRepository, BuildRepository};
use cascade_db::{LockResource, acquire_or_fail};
use cascade_scheduler::{BuildRequest, ReconcileReport, TIMEOUT_REASON};
use cascade_tests::context::{PostgresOnlyContext, TestContext};
use cascade_tests::fixtures::CatalogFixture;
use cascade_tests::{TestScheduler, backdate_job, register_worker, worker_status};
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

async fn running_job(
    ctx: &PostgresOnlyContext,
    catalog: &CatalogFixture,
    test: &TestScheduler,
    name: &str,
) -> PipelineBuildJob {
    let pipeline = catalog
        .pipeline(name, PipelineType::Build, &["compile"])
        .await
        .expect("Failed to create pipeline");
    let build = test
        .scheduler
        .create_build(BuildRequest::manual(catalog.build_node(&pipeline), "kim"))
        .await
        .expect("Failed to create build")
        .into_build()
        .expect("Build suppressed");
    let job = ctx.repos.jobs.list_for_build(build.id).await.unwrap().remove(0);
    let worker = register_worker(ctx.db.pool()).await.unwrap();
    test.scheduler.take_job(job.id, worker).await.unwrap()
}

#[tokio::test]
async fn test_silent_job_killed_recent_job_kept() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let test = TestScheduler::start(&ctx.repos, "replica-a");

    let silent = running_job(&ctx, &catalog, &test, "silent").await;
    let recent = running_job(&ctx, &catalog, &test, "recent").await;
    backdate_job(ctx.db.pool(), silent.id, 20 * MINUTE, Some(18 * MINUTE))
        .await
        .unwrap();
    backdate_job(ctx.db.pool(), recent.id, 5 * MINUTE, None)
        .await
        .unwrap();

    let report = test.scheduler.reconciler().reconcile_once().await.unwrap();
    assert_eq!(report, ReconcileReport { killed: 1, skipped: 0 });

    let killed = ctx.repos.jobs.get(silent.id).await.unwrap().unwrap();
    assert_eq!(killed.status, BuildStatus::Fail);
    let logs = ctx.repos.jobs.logs(silent.id).await.unwrap();
    assert_eq!(logs.last().map(|l| l.value.as_str()), Some(TIMEOUT_REASON));
    let worker = silent.worker_id.expect("job has a worker");
    assert_eq!(
        worker_status(ctx.db.pool(), worker).await.unwrap().as_deref(),
        Some("Disabled")
    );

    let build = ctx.repos.builds.get(silent.build_id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Fail);

    let untouched = ctx.repos.jobs.get(recent.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, BuildStatus::Building);

    test.stop().await;
}

#[tokio::test]
async fn test_locked_job_skipped_until_released() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let test = TestScheduler::start(&ctx.repos, "replica-a");

    let job = running_job(&ctx, &catalog, &test, "locked").await;
    backdate_job(ctx.db.pool(), job.id, 20 * MINUTE, None)
        .await
        .unwrap();

    let mut holder = ctx.db.pool().begin().await.unwrap();
    acquire_or_fail(&mut holder, &LockResource::BuildJob(job.id))
        .await
        .unwrap();

    let cutoff = Utc::now() - chrono::Duration::minutes(15);
    let err = ctx
        .repos
        .jobs
        .kill_stale(job.id, TIMEOUT_REASON, cutoff)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyLocked(_)));

    let report = test.scheduler.reconciler().reconcile_once().await.unwrap();
    assert_eq!(report, ReconcileReport { killed: 0, skipped: 1 });

    holder.rollback().await.unwrap();

    let report = test.scheduler.reconciler().reconcile_once().await.unwrap();
    assert_eq!(report, ReconcileReport { killed: 1, skipped: 0 });

    test.stop().await;
}

#[tokio::test]
async fn test_only_one_replica_reconciles() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let catalog = ctx.seed_catalog().await.unwrap();
    let a = TestScheduler::start(&ctx.repos, "replica-a");
    let b = TestScheduler::start(&ctx.repos, "replica-b");

    let job = running_job(&ctx, &catalog, &a, "shared").await;
    backdate_job(ctx.db.pool(), job.id, 30 * MINUTE, None)
        .await
        .unwrap();

    let (reconciler_a, reconciler_b) = (a.scheduler.reconciler(), b.scheduler.reconciler());
    let (ra, rb) = tokio::join!(reconciler_a.reconcile_once(), reconciler_b.reconcile_once());
    let killed = ra.unwrap().killed + rb.unwrap().killed;
    assert_eq!(killed, 1);

    let logs = ctx.repos.jobs.logs(job.id).await.unwrap();
    assert_eq!(
        logs.iter().filter(|l| l.value == TIMEOUT_REASON).count(),
        1
    );

    a.stop().await;
    b.stop().await;
}
