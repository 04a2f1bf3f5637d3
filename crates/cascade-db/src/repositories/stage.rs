//! PostgreSQL implementation of StageRepository.
//!
//! Every mutation locks the owning pipeline row first, so concurrent edits
//! of one pipeline's stages serialize. Order shifts are one bulk UPDATE per
//! direction; the (pipeline, build_order) unique constraint is deferred to
//! commit so the intermediate states of a shift are allowed.

use async_trait::async_trait;
use cascade_core::ids::{JobId, PipelineId, StageId};
use cascade_core::pipeline::{Job, Stage};
use cascade_core::ports::StageRepository;
use cascade_core::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::common::{PrerequisiteTable, delete_prerequisites, insert_prerequisites, load_prerequisites};
use crate::error::db_err;

/// PostgreSQL implementation of StageRepository.
#[derive(Clone)]
pub struct PgStageRepository {
    pool: PgPool,
}

impl PgStageRepository {
    /// Create a new PgStageRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_stage(r: &PgRow) -> Stage {
    Stage {
        id: StageId::from_uuid(r.get::<Uuid, _>("id")),
        pipeline_id: PipelineId::from_uuid(r.get::<Uuid, _>("pipeline_id")),
        name: r.get("name"),
        build_order: r.get::<i32, _>("build_order") as u32,
        enabled: r.get("enabled"),
        jobs: vec![],
        prerequisites: vec![],
    }
}

async fn lock_pipeline(conn: &mut PgConnection, pipeline: PipelineId) -> Result<()> {
    sqlx::query("SELECT id FROM pipeline WHERE id = $1 FOR UPDATE")
        .bind(pipeline.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::PipelineNotFound(pipeline.to_string()))?;
    Ok(())
}

async fn count_stages(conn: &mut PgConnection, pipeline: PipelineId) -> Result<u32> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM pipeline_stage WHERE pipeline_id = $1")
        .bind(pipeline.as_uuid())
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(row.get::<i64, _>("n") as u32)
}

async fn insert_jobs(conn: &mut PgConnection, stage: StageId, jobs: &[Job]) -> Result<()> {
    for (position, job) in jobs.iter().enumerate() {
        sqlx::query(
            "INSERT INTO pipeline_action (id, pipeline_stage_id, name, enabled, position) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job.id.as_uuid())
        .bind(stage.as_uuid())
        .bind(&job.name)
        .bind(job.enabled)
        .bind(position as i32)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

async fn load_children(conn: &mut PgConnection, stage: &mut Stage) -> Result<()> {
    let rows = sqlx::query(
        "SELECT id, name, enabled FROM pipeline_action WHERE pipeline_stage_id = $1 ORDER BY position",
    )
    .bind(stage.id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    stage.jobs = rows
        .iter()
        .map(|r| Job {
            id: JobId::from_uuid(r.get::<Uuid, _>("id")),
            name: r.get("name"),
            enabled: r.get("enabled"),
        })
        .collect();
    stage.prerequisites =
        load_prerequisites(conn, PrerequisiteTable::Stage, stage.id.as_uuid()).await?;
    Ok(())
}

async fn fetch_stage(
    conn: &mut PgConnection,
    pipeline: PipelineId,
    stage: StageId,
) -> Result<Option<Stage>> {
    let row = sqlx::query(
        "SELECT id, pipeline_id, name, build_order, enabled FROM pipeline_stage WHERE id = $1 AND pipeline_id = $2",
    )
    .bind(stage.as_uuid())
    .bind(pipeline.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    match row {
        Some(r) => {
            let mut stage = row_to_stage(&r);
            load_children(conn, &mut stage).await?;
            Ok(Some(stage))
        }
        None => Ok(None),
    }
}

/// Stages of a pipeline in build order, with jobs and prerequisites.
pub(crate) async fn list_stages(conn: &mut PgConnection, pipeline: PipelineId) -> Result<Vec<Stage>> {
    let rows = sqlx::query(
        "SELECT id, pipeline_id, name, build_order, enabled FROM pipeline_stage WHERE pipeline_id = $1 ORDER BY build_order",
    )
    .bind(pipeline.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    let mut stages: Vec<Stage> = rows.iter().map(row_to_stage).collect();
    for stage in &mut stages {
        load_children(conn, stage).await?;
    }
    Ok(stages)
}

/// Append stages to a pipeline the caller has already locked or just created.
pub(crate) async fn append_stage(conn: &mut PgConnection, stage: &Stage) -> Result<Stage> {
    let order = count_stages(conn, stage.pipeline_id).await? + 1;

    sqlx::query(
        "INSERT INTO pipeline_stage (id, pipeline_id, name, build_order, enabled) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(stage.id.as_uuid())
    .bind(stage.pipeline_id.as_uuid())
    .bind(&stage.name)
    .bind(order as i32)
    .bind(stage.enabled)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    insert_jobs(conn, stage.id, &stage.jobs).await?;
    insert_prerequisites(conn, PrerequisiteTable::Stage, stage.id.as_uuid(), &stage.prerequisites)
        .await?;

    let mut inserted = stage.clone();
    inserted.build_order = order;
    Ok(inserted)
}

async fn delete_stage_children(conn: &mut PgConnection, stage: StageId) -> Result<()> {
    sqlx::query("DELETE FROM pipeline_action WHERE pipeline_stage_id = $1")
        .bind(stage.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    delete_prerequisites(conn, PrerequisiteTable::Stage, stage.as_uuid()).await
}

/// Delete every stage of a pipeline with jobs and prerequisites.
pub(crate) async fn delete_all_stages(conn: &mut PgConnection, pipeline: PipelineId) -> Result<u64> {
    sqlx::query(
        "DELETE FROM pipeline_action WHERE pipeline_stage_id IN (SELECT id FROM pipeline_stage WHERE pipeline_id = $1)",
    )
    .bind(pipeline.as_uuid())
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    sqlx::query(
        "DELETE FROM pipeline_stage_prerequisite WHERE pipeline_stage_id IN (SELECT id FROM pipeline_stage WHERE pipeline_id = $1)",
    )
    .bind(pipeline.as_uuid())
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    let result = sqlx::query("DELETE FROM pipeline_stage WHERE pipeline_id = $1")
        .bind(pipeline.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    Ok(result.rows_affected())
}

#[async_trait]
impl StageRepository for PgStageRepository {
    async fn insert(&self, stage: &Stage) -> Result<Stage> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        lock_pipeline(&mut tx, stage.pipeline_id).await?;
        let inserted = append_stage(&mut tx, stage).await?;

        tx.commit().await.map_err(db_err)?;

        debug!(
            pipeline_id = %stage.pipeline_id,
            stage_id = %stage.id,
            build_order = inserted.build_order,
            "Stage inserted"
        );
        Ok(inserted)
    }

    async fn get(&self, pipeline: PipelineId, stage: StageId) -> Result<Option<Stage>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_stage(&mut conn, pipeline, stage).await
    }

    async fn list(&self, pipeline: PipelineId) -> Result<Vec<Stage>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        list_stages(&mut conn, pipeline).await
    }

    async fn count(&self, pipeline: PipelineId) -> Result<u32> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        count_stages(&mut conn, pipeline).await
    }

    async fn update(&self, stage: &Stage) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        lock_pipeline(&mut tx, stage.pipeline_id).await?;

        let result = sqlx::query(
            "UPDATE pipeline_stage SET name = $1, enabled = $2 WHERE id = $3 AND pipeline_id = $4",
        )
        .bind(&stage.name)
        .bind(stage.enabled)
        .bind(stage.id.as_uuid())
        .bind(stage.pipeline_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::StageNotFound(stage.id.to_string()));
        }

        delete_stage_children(&mut tx, stage.id).await?;
        insert_jobs(&mut tx, stage.id, &stage.jobs).await?;
        insert_prerequisites(&mut tx, PrerequisiteTable::Stage, stage.id.as_uuid(), &stage.prerequisites)
            .await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn move_to(&self, pipeline: PipelineId, stage: StageId, new_order: u32) -> Result<Stage> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        lock_pipeline(&mut tx, pipeline).await?;

        let current = fetch_stage(&mut tx, pipeline, stage)
            .await?
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))?;

        let count = count_stages(&mut tx, pipeline).await?;
        if new_order < 1 || new_order > count {
            return Err(Error::InvalidStageOrder {
                requested: new_order,
                count,
            });
        }

        let old_order = current.build_order;
        if old_order == new_order {
            return Ok(current);
        }

        if new_order < old_order {
            sqlx::query(
                "UPDATE pipeline_stage SET build_order = build_order + 1 WHERE pipeline_id = $1 AND build_order >= $2 AND build_order < $3",
            )
            .bind(pipeline.as_uuid())
            .bind(new_order as i32)
            .bind(old_order as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        } else {
            sqlx::query(
                "UPDATE pipeline_stage SET build_order = build_order - 1 WHERE pipeline_id = $1 AND build_order > $2 AND build_order <= $3",
            )
            .bind(pipeline.as_uuid())
            .bind(old_order as i32)
            .bind(new_order as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query("UPDATE pipeline_stage SET build_order = $1 WHERE id = $2")
            .bind(new_order as i32)
            .bind(stage.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(
            pipeline_id = %pipeline,
            stage_id = %stage,
            from = old_order,
            to = new_order,
            "Stage moved"
        );

        Ok(Stage {
            build_order: new_order,
            ..current
        })
    }

    async fn delete(&self, pipeline: PipelineId, stage: StageId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        lock_pipeline(&mut tx, pipeline).await?;

        let current = fetch_stage(&mut tx, pipeline, stage)
            .await?
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))?;

        delete_stage_children(&mut tx, stage).await?;

        sqlx::query("DELETE FROM pipeline_stage WHERE id = $1")
            .bind(stage.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "UPDATE pipeline_stage SET build_order = build_order - 1 WHERE pipeline_id = $1 AND build_order > $2",
        )
        .bind(pipeline.as_uuid())
        .bind(current.build_order as i32)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(pipeline_id = %pipeline, stage_id = %stage, "Stage deleted");
        Ok(())
    }
}
