//! PostgreSQL implementation of BuildJobRepository.

use async_trait::async_trait;
use cascade_core::build::{BuildLog, BuildStatus, JobTransition, PipelineBuildJob, job_transition_allowed};
use cascade_core::ids::*;
use cascade_core::ports::BuildJobRepository;
use cascade_core::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::db_err;
use crate::locks::{LockResource, acquire_or_fail};

const JOB_COLUMNS: &str =
    "id, pipeline_build_id, stage_id, job_id, job_name, status, worker_id, queued_at, start, done";

/// PostgreSQL implementation of BuildJobRepository.
#[derive(Clone)]
pub struct PgBuildJobRepository {
    pool: PgPool,
}

impl PgBuildJobRepository {
    /// Create a new PgBuildJobRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_job(r: &PgRow) -> Result<PipelineBuildJob> {
    let status_str: String = r.get("status");
    let status = BuildStatus::parse(&status_str)
        .ok_or_else(|| Error::Database(format!("unknown job status {}", status_str)))?;

    Ok(PipelineBuildJob {
        id: BuildJobId::from_uuid(r.get::<Uuid, _>("id")),
        build_id: BuildId::from_uuid(r.get::<Uuid, _>("pipeline_build_id")),
        stage_id: StageId::from_uuid(r.get::<Uuid, _>("stage_id")),
        job_id: JobId::from_uuid(r.get::<Uuid, _>("job_id")),
        job_name: r.get("job_name"),
        status,
        worker_id: r.get::<Option<Uuid>, _>("worker_id").map(WorkerId::from_uuid),
        queued_at: r.get("queued_at"),
        started_at: r.get("start"),
        done_at: r.get("done"),
    })
}

async fn lock_job(conn: &mut PgConnection, id: BuildJobId) -> Result<PipelineBuildJob> {
    let sql = format!("SELECT {} FROM pipeline_build_job WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::BuildJobNotFound(id.to_string()))?;

    row_to_job(&row)
}

/// Put the worker back to waiting once it no longer runs the job.
async fn release_worker(conn: &mut PgConnection, worker: WorkerId, status: &str) -> Result<()> {
    sqlx::query("UPDATE worker SET action_build_id = NULL, status = $1 WHERE id = $2")
        .bind(status)
        .bind(worker.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn insert_log(conn: &mut PgConnection, log: &BuildLog) -> Result<()> {
    sqlx::query(
        "INSERT INTO build_log (pipeline_build_job_id, pipeline_build_id, timestamp, value) VALUES ($1, $2, $3, $4)",
    )
    .bind(log.build_job_id.as_uuid())
    .bind(log.build_id.as_uuid())
    .bind(log.timestamp)
    .bind(&log.value)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// A running job is stale when it started before `cutoff` and wrote no log since.
const STALE_FILTER: &str = "j.status = 'Building' AND j.start < $1 \
     AND NOT EXISTS (SELECT 1 FROM build_log l \
                     WHERE l.pipeline_build_job_id = j.id AND l.timestamp >= $1)";

#[async_trait]
impl BuildJobRepository for PgBuildJobRepository {
    async fn insert(&self, job: &PipelineBuildJob) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO pipeline_build_job (id, pipeline_build_id, stage_id, job_id, job_name, status,
                   worker_id, queued_at, start, done)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(job.id.as_uuid())
        .bind(job.build_id.as_uuid())
        .bind(job.stage_id.as_uuid())
        .bind(job.job_id.as_uuid())
        .bind(&job.job_name)
        .bind(job.status.as_str())
        .bind(job.worker_id.map(|w| *w.as_uuid()))
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.done_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(build_job_id = %job.id, build_id = %job.build_id, job = %job.job_name, "Job queued");
        Ok(())
    }

    async fn get(&self, id: BuildJobId) -> Result<Option<PipelineBuildJob>> {
        let sql = format!("SELECT {} FROM pipeline_build_job WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_for_build(&self, build: BuildId) -> Result<Vec<PipelineBuildJob>> {
        let sql = format!(
            "SELECT {} FROM pipeline_build_job WHERE pipeline_build_id = $1 ORDER BY queued_at, id",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(build.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_job).collect()
    }

    async fn take(&self, id: BuildJobId, worker: WorkerId) -> Result<PipelineBuildJob> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = lock_job(&mut tx, id).await?;

        if job.status != BuildStatus::Waiting {
            return Err(Error::AlreadyTaken(id.to_string()));
        }

        let now = Utc::now();
        sqlx::query("UPDATE pipeline_build_job SET status = $1, worker_id = $2, start = $3 WHERE id = $4")
            .bind(BuildStatus::Building.as_str())
            .bind(worker.as_uuid())
            .bind(now)
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query("UPDATE worker SET action_build_id = $1, status = 'Building' WHERE id = $2")
            .bind(id.as_uuid())
            .bind(worker.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        job.status = BuildStatus::Building;
        job.worker_id = Some(worker);
        job.started_at = Some(now);

        info!(build_job_id = %id, worker_id = %worker, "Job taken");
        Ok(job)
    }

    async fn update_status(&self, id: BuildJobId, status: BuildStatus) -> Result<JobTransition> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = lock_job(&mut tx, id).await?;

        if !job_transition_allowed(job.status, status) {
            debug!(
                build_job_id = %id,
                current = %job.status,
                requested = %status,
                "Ignoring job status report"
            );
            return Ok(JobTransition::Ignored(job));
        }

        let now = Utc::now();
        if status == BuildStatus::Building && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if status.is_terminal() {
            job.done_at = Some(now);
        }
        job.status = status;

        sqlx::query("UPDATE pipeline_build_job SET status = $1, start = $2, done = $3 WHERE id = $4")
            .bind(job.status.as_str())
            .bind(job.started_at)
            .bind(job.done_at)
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if status.is_terminal() {
            if let Some(worker) = job.worker_id {
                release_worker(&mut tx, worker, "Waiting").await?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(JobTransition::Applied(job))
    }

    async fn restart(&self, id: BuildJobId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let job = lock_job(&mut tx, id).await?;

        sqlx::query("DELETE FROM build_log WHERE pipeline_build_job_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "UPDATE pipeline_build_job SET status = 'Waiting', worker_id = NULL, start = NULL, done = NULL, queued_at = now() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let (Some(worker), false) = (job.worker_id, job.status.is_terminal()) {
            release_worker(&mut tx, worker, "Waiting").await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn stop_build(&self, build: BuildId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            r#"UPDATE pipeline_build_job
               SET status = 'Fail', done = now()
               WHERE pipeline_build_id = $1 AND status IN ('Waiting', 'Building')
               RETURNING worker_id"#,
        )
        .bind(build.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for worker in rows.iter().filter_map(|r| r.get::<Option<Uuid>, _>("worker_id")) {
            release_worker(&mut tx, WorkerId::from_uuid(worker), "Waiting").await?;
        }

        tx.commit().await.map_err(db_err)?;

        let stopped = rows.len() as u64;
        info!(build_id = %build, stopped, "Build stopped");
        Ok(stopped)
    }

    async fn append_log(&self, log: &BuildLog) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        insert_log(&mut conn, log).await
    }

    async fn logs(&self, id: BuildJobId) -> Result<Vec<BuildLog>> {
        let rows = sqlx::query(
            r#"SELECT pipeline_build_job_id, pipeline_build_id, timestamp, value
               FROM build_log WHERE pipeline_build_job_id = $1
               ORDER BY timestamp, id"#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| BuildLog {
                build_job_id: BuildJobId::from_uuid(r.get::<Uuid, _>("pipeline_build_job_id")),
                build_id: BuildId::from_uuid(r.get::<Uuid, _>("pipeline_build_id")),
                timestamp: r.get("timestamp"),
                value: r.get("value"),
            })
            .collect())
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<PipelineBuildJob>> {
        let sql = format!(
            "SELECT j.* FROM pipeline_build_job j WHERE {} ORDER BY j.start",
            STALE_FILTER
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_job).collect()
    }

    async fn kill_stale(
        &self,
        id: BuildJobId,
        reason: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<PipelineBuildJob>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        acquire_or_fail(&mut tx, &LockResource::BuildJob(id)).await?;

        let sql = format!(
            "SELECT j.id FROM pipeline_build_job j WHERE j.id = $2 AND {} FOR UPDATE OF j",
            STALE_FILTER
        );
        let still_stale = sqlx::query(&sql)
            .bind(cutoff)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();

        if !still_stale {
            debug!(build_job_id = %id, "Job no longer stale");
            return Ok(None);
        }

        let mut job = lock_job(&mut tx, id).await?;
        insert_log(&mut tx, &BuildLog::new(&job, reason)).await?;

        let now = Utc::now();
        sqlx::query("UPDATE pipeline_build_job SET status = 'Fail', done = $1 WHERE id = $2")
            .bind(now)
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if let Some(worker) = job.worker_id {
            release_worker(&mut tx, worker, "Disabled").await?;
        }

        tx.commit().await.map_err(db_err)?;

        job.status = BuildStatus::Fail;
        job.done_at = Some(now);

        warn!(build_job_id = %id, build_id = %job.build_id, reason, "Stale job killed");
        Ok(Some(job))
    }
}
