//! Test helper functions and utilities.

use cascade_core::ids::{BuildJobId, WorkerId};
use cascade_db::Repositories;
use cascade_scheduler::{InProcessEventBus, Scheduler, SchedulerConfig, SchedulerPorts};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Scheduler ports backed by the Postgres repositories.
pub fn scheduler_ports(repos: &Repositories) -> SchedulerPorts {
    SchedulerPorts {
        catalog: repos.catalog.clone(),
        pipelines: repos.pipelines.clone(),
        stages: repos.stages.clone(),
        triggers: repos.triggers.clone(),
        builds: repos.builds.clone(),
        jobs: repos.jobs.clone(),
        leases: repos.leases.clone(),
    }
}

/// A scheduler replica over Postgres publishing to an in-process bus.
pub struct TestScheduler {
    pub scheduler: Scheduler,
    pub bus: Arc<InProcessEventBus>,
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl TestScheduler {
    pub fn start(repos: &Repositories, instance_id: &str) -> Self {
        Self::start_with(
            repos,
            SchedulerConfig {
                instance_id: instance_id.to_string(),
                ..SchedulerConfig::default()
            },
        )
    }

    pub fn start_with(repos: &Repositories, config: SchedulerConfig) -> Self {
        let bus = Arc::new(InProcessEventBus::new(256));
        let (scheduler, dispatcher) = Scheduler::new(scheduler_ports(repos), bus.clone(), &config);

        let (shutdown, rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatcher.run(rx));

        Self {
            scheduler,
            bus,
            shutdown,
            dispatcher,
        }
    }

    /// Stop the dispatcher after it has flushed queued events.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.dispatcher.await;
    }
}

/// Pretend a running job started `started_ago` and, optionally, last logged
/// `last_log_ago`.
pub async fn backdate_job(
    pool: &PgPool,
    job: BuildJobId,
    started_ago: Duration,
    last_log_ago: Option<Duration>,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    sqlx::query("UPDATE pipeline_build_job SET start = $1 WHERE id = $2")
        .bind(now - chrono::Duration::from_std(started_ago)?)
        .bind(job.as_uuid())
        .execute(pool)
        .await?;

    if let Some(ago) = last_log_ago {
        sqlx::query(
            r#"INSERT INTO build_log (pipeline_build_job_id, pipeline_build_id, timestamp, value)
               SELECT id, pipeline_build_id, $1, 'compiling' FROM pipeline_build_job WHERE id = $2"#,
        )
        .bind(now - chrono::Duration::from_std(ago)?)
        .bind(job.as_uuid())
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Current status of a worker row.
pub async fn worker_status(pool: &PgPool, worker: WorkerId) -> anyhow::Result<Option<String>> {
    let status = sqlx::query_scalar("SELECT status FROM worker WHERE id = $1")
        .bind(worker.as_uuid())
        .fetch_optional(pool)
        .await?;
    Ok(status)
}

/// Register an idle worker.
pub async fn register_worker(pool: &PgPool) -> anyhow::Result<WorkerId> {
    let worker = WorkerId::new();
    sqlx::query("INSERT INTO worker (id, name) VALUES ($1, $2)")
        .bind(worker.as_uuid())
        .bind(format!("worker-{}", worker.as_uuid().simple()))
        .execute(pool)
        .await?;
    Ok(worker)
}

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Assert that a future completes within a timeout.
pub async fn assert_completes_within<F, T>(future: F, timeout: Duration) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("Operation timed out")
}
