//! PostgreSQL implementation of PipelineRepository.

use async_trait::async_trait;
use cascade_core::ids::{ApplicationId, PipelineId, ProjectId};
use cascade_core::parameter::Parameter;
use cascade_core::pipeline::{Pipeline, PipelineType};
use cascade_core::ports::PipelineRepository;
use cascade_core::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::build::{BuildScope, delete_builds_in};
use super::common::{param_type_to_str, row_to_parameter};
use super::stage::{append_stage, delete_all_stages, list_stages};
use super::trigger::{TriggerScope, delete_triggers_touching};
use crate::error::{db_err, json_err};

/// PostgreSQL implementation of PipelineRepository.
#[derive(Clone)]
pub struct PgPipelineRepository {
    pool: PgPool,
}

impl PgPipelineRepository {
    /// Create a new PgPipelineRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_pipeline(r: &PgRow) -> Result<Pipeline> {
    let type_str: String = r.get("type");
    let pipeline_type = PipelineType::parse(&type_str)
        .ok_or_else(|| Error::Database(format!("unknown pipeline type {}", type_str)))?;

    Ok(Pipeline {
        id: PipelineId::from_uuid(r.get::<Uuid, _>("id")),
        project_id: ProjectId::from_uuid(r.get::<Uuid, _>("project_id")),
        name: r.get("name"),
        pipeline_type,
        parameters: vec![],
        stages: vec![],
        created_at: r.get("created_at"),
    })
}

async fn load_parameters(conn: &mut PgConnection, pipeline: PipelineId) -> Result<Vec<Parameter>> {
    let rows = sqlx::query(
        "SELECT name, type, value, description FROM pipeline_parameter WHERE pipeline_id = $1 ORDER BY name",
    )
    .bind(pipeline.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(rows.iter().map(row_to_parameter).collect())
}

async fn upsert_parameter(
    conn: &mut PgConnection,
    pipeline: PipelineId,
    parameter: &Parameter,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO pipeline_parameter (pipeline_id, name, type, value, description)
           VALUES ($1, $2, $3, $4, $5)
           ON CONFLICT (pipeline_id, name)
           DO UPDATE SET type = EXCLUDED.type, value = EXCLUDED.value, description = EXCLUDED.description"#,
    )
    .bind(pipeline.as_uuid())
    .bind(&parameter.name)
    .bind(param_type_to_str(parameter.param_type))
    .bind(&parameter.value)
    .bind(&parameter.description)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Fill parameters and stages of a pipeline row.
async fn hydrate(conn: &mut PgConnection, mut pipeline: Pipeline) -> Result<Pipeline> {
    pipeline.parameters = load_parameters(conn, pipeline.id).await?;
    pipeline.stages = list_stages(conn, pipeline.id).await?;
    Ok(pipeline)
}

#[async_trait]
impl PipelineRepository for PgPipelineRepository {
    async fn create(&self, pipeline: &Pipeline) -> Result<Pipeline> {
        for stage in &pipeline.stages {
            stage.validate()?;
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO pipeline (id, project_id, name, type, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(pipeline.id.as_uuid())
        .bind(pipeline.project_id.as_uuid())
        .bind(&pipeline.name)
        .bind(pipeline.pipeline_type.as_str())
        .bind(pipeline.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for parameter in &pipeline.parameters {
            upsert_parameter(&mut tx, pipeline.id, parameter).await?;
        }

        let mut stages = Vec::with_capacity(pipeline.stages.len());
        for stage in &pipeline.stages {
            let mut stage = stage.clone();
            stage.pipeline_id = pipeline.id;
            stages.push(append_stage(&mut tx, &stage).await?);
        }

        tx.commit().await.map_err(db_err)?;

        info!(pipeline_id = %pipeline.id, name = %pipeline.name, stages = stages.len(), "Pipeline created");

        let mut created = pipeline.clone();
        created.stages = stages;
        Ok(created)
    }

    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let row = sqlx::query("SELECT id, project_id, name, type, created_at FROM pipeline WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;

        match row {
            Some(r) => Ok(Some(hydrate(&mut conn, row_to_pipeline(&r)?).await?)),
            None => Ok(None),
        }
    }

    async fn get_by_name(&self, project: ProjectId, name: &str) -> Result<Option<Pipeline>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let row = sqlx::query(
            "SELECT id, project_id, name, type, created_at FROM pipeline WHERE project_id = $1 AND name = $2",
        )
        .bind(project.as_uuid())
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => Ok(Some(hydrate(&mut conn, row_to_pipeline(&r)?).await?)),
            None => Ok(None),
        }
    }

    async fn upsert_parameter(&self, id: PipelineId, parameter: &Parameter) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        upsert_parameter(&mut conn, id, parameter).await
    }

    async fn delete_parameter(&self, id: PipelineId, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM pipeline_parameter WHERE pipeline_id = $1 AND name = $2")
            .bind(id.as_uuid())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn application_arguments(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
    ) -> Result<Vec<Parameter>> {
        let row = sqlx::query(
            "SELECT args FROM application_pipeline WHERE application_id = $1 AND pipeline_id = $2",
        )
        .bind(application.as_uuid())
        .bind(pipeline.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => serde_json::from_value(r.get::<serde_json::Value, _>("args")).map_err(json_err),
            None => Ok(vec![]),
        }
    }

    async fn set_application_arguments(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
        arguments: &[Parameter],
    ) -> Result<()> {
        let args = serde_json::to_value(arguments).map_err(json_err)?;
        sqlx::query(
            r#"INSERT INTO application_pipeline (application_id, pipeline_id, args)
               VALUES ($1, $2, $3)
               ON CONFLICT (application_id, pipeline_id) DO UPDATE SET args = EXCLUDED.args"#,
        )
        .bind(application.as_uuid())
        .bind(pipeline.as_uuid())
        .bind(&args)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, id: PipelineId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("SELECT id FROM pipeline WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;

        let triggers = delete_triggers_touching(&mut tx, TriggerScope::Pipeline(id)).await?;
        let builds = delete_builds_in(&mut tx, BuildScope::Pipeline(id)).await?;
        delete_all_stages(&mut tx, id).await?;

        for table in ["application_pipeline", "pipeline_parameter"] {
            let sql = format!("DELETE FROM {} WHERE pipeline_id = $1", table);
            sqlx::query(&sql)
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        sqlx::query("DELETE FROM pipeline WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        info!(pipeline_id = %id, triggers, builds, "Pipeline deleted");
        Ok(())
    }
}
