//! PostgreSQL implementation of TriggerRepository.

use async_trait::async_trait;
use cascade_core::graph::{TriggerEdges, ensure_acyclic};
use cascade_core::ids::*;
use cascade_core::ports::TriggerRepository;
use cascade_core::trigger::{Trigger, TriggerNode};
use cascade_core::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::common::{
    PrerequisiteTable, delete_prerequisites, insert_prerequisites, load_prerequisites,
    param_type_to_str, row_to_parameter,
};
use crate::error::db_err;
use crate::locks::{LockResource, acquire_blocking};

const TRIGGER_COLUMNS: &str = "id, src_application_id, src_pipeline_id, src_environment_id, \
     dest_application_id, dest_pipeline_id, dest_environment_id, manual";

/// PostgreSQL implementation of TriggerRepository.
#[derive(Clone)]
pub struct PgTriggerRepository {
    pool: PgPool,
}

impl PgTriggerRepository {
    /// Create a new PgTriggerRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Trigger edges read through an open transaction.
pub struct PgTriggerEdges<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> PgTriggerEdges<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<'c> TriggerEdges for PgTriggerEdges<'c> {
    async fn outgoing(&mut self, node: &TriggerNode) -> Result<Vec<Trigger>> {
        select_triggers(
            &mut *self.conn,
            "src_application_id = $1 AND src_pipeline_id = $2 AND src_environment_id = $3",
            node,
        )
        .await
    }
}

fn row_to_trigger(r: &PgRow) -> Trigger {
    Trigger {
        id: TriggerId::from_uuid(r.get::<Uuid, _>("id")),
        src: TriggerNode::new(
            ApplicationId::from_uuid(r.get::<Uuid, _>("src_application_id")),
            PipelineId::from_uuid(r.get::<Uuid, _>("src_pipeline_id")),
            EnvironmentId::from_uuid(r.get::<Uuid, _>("src_environment_id")),
        ),
        dest: TriggerNode::new(
            ApplicationId::from_uuid(r.get::<Uuid, _>("dest_application_id")),
            PipelineId::from_uuid(r.get::<Uuid, _>("dest_pipeline_id")),
            EnvironmentId::from_uuid(r.get::<Uuid, _>("dest_environment_id")),
        ),
        manual: r.get("manual"),
        parameters: vec![],
        prerequisites: vec![],
    }
}

async fn load_children(conn: &mut PgConnection, trigger: &mut Trigger) -> Result<()> {
    let rows = sqlx::query(
        "SELECT name, type, value, description FROM pipeline_trigger_parameter WHERE pipeline_trigger_id = $1 ORDER BY name",
    )
    .bind(trigger.id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    trigger.parameters = rows.iter().map(row_to_parameter).collect();
    trigger.prerequisites =
        load_prerequisites(conn, PrerequisiteTable::Trigger, trigger.id.as_uuid()).await?;
    Ok(())
}

/// Select triggers with a filter binding a node as $1..$3.
async fn select_triggers(
    conn: &mut PgConnection,
    filter: &str,
    node: &TriggerNode,
) -> Result<Vec<Trigger>> {
    let sql = format!(
        "SELECT {} FROM pipeline_trigger WHERE {} ORDER BY created_at, id",
        TRIGGER_COLUMNS, filter
    );
    let rows = sqlx::query(&sql)
        .bind(node.application_id.as_uuid())
        .bind(node.pipeline_id.as_uuid())
        .bind(node.environment_id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let mut triggers: Vec<Trigger> = rows.iter().map(row_to_trigger).collect();
    for t in &mut triggers {
        load_children(conn, t).await?;
    }
    Ok(triggers)
}

async fn insert_children(conn: &mut PgConnection, trigger: &Trigger) -> Result<()> {
    for p in &trigger.parameters {
        sqlx::query(
            "INSERT INTO pipeline_trigger_parameter (pipeline_trigger_id, name, type, value, description) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(trigger.id.as_uuid())
        .bind(&p.name)
        .bind(param_type_to_str(p.param_type))
        .bind(&p.value)
        .bind(&p.description)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    insert_prerequisites(
        conn,
        PrerequisiteTable::Trigger,
        trigger.id.as_uuid(),
        &trigger.prerequisites,
    )
    .await
}

async fn delete_children(conn: &mut PgConnection, id: TriggerId) -> Result<()> {
    sqlx::query("DELETE FROM pipeline_trigger_parameter WHERE pipeline_trigger_id = $1")
        .bind(id.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    delete_prerequisites(conn, PrerequisiteTable::Trigger, id.as_uuid()).await
}

/// Which triggers a cleanup removes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TriggerScope {
    Pipeline(PipelineId),
    Application(ApplicationId),
}

/// Delete triggers touching the scope on either end, with their children.
pub(crate) async fn delete_triggers_touching(
    conn: &mut PgConnection,
    scope: TriggerScope,
) -> Result<u64> {
    let (filter, id) = match scope {
        TriggerScope::Pipeline(p) => ("src_pipeline_id = $1 OR dest_pipeline_id = $1", *p.as_uuid()),
        TriggerScope::Application(a) => (
            "src_application_id = $1 OR dest_application_id = $1",
            *a.as_uuid(),
        ),
    };

    for child in ["pipeline_trigger_parameter", "pipeline_trigger_prerequisite"] {
        let sql = format!(
            "DELETE FROM {} WHERE pipeline_trigger_id IN (SELECT id FROM pipeline_trigger WHERE {})",
            child, filter
        );
        sqlx::query(&sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }

    let sql = format!("DELETE FROM pipeline_trigger WHERE {}", filter);
    let result = sqlx::query(&sql)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    Ok(result.rows_affected())
}

#[async_trait]
impl TriggerRepository for PgTriggerRepository {
    async fn insert(&self, trigger: &Trigger) -> Result<Trigger> {
        trigger.validate()?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        acquire_blocking(&mut tx, &LockResource::TriggerGraph).await?;
        ensure_acyclic(&mut PgTriggerEdges::new(&mut tx), trigger).await?;

        sqlx::query(
            r#"INSERT INTO pipeline_trigger (id, src_application_id, src_pipeline_id, src_environment_id,
                   dest_application_id, dest_pipeline_id, dest_environment_id, manual)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(trigger.id.as_uuid())
        .bind(trigger.src.application_id.as_uuid())
        .bind(trigger.src.pipeline_id.as_uuid())
        .bind(trigger.src.environment_id.as_uuid())
        .bind(trigger.dest.application_id.as_uuid())
        .bind(trigger.dest.pipeline_id.as_uuid())
        .bind(trigger.dest.environment_id.as_uuid())
        .bind(trigger.manual)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        insert_children(&mut tx, trigger).await?;

        tx.commit().await.map_err(db_err)?;

        info!(
            trigger_id = %trigger.id,
            src = %trigger.src,
            dest = %trigger.dest,
            "Trigger inserted"
        );
        Ok(trigger.clone())
    }

    async fn update(&self, trigger: &Trigger) -> Result<()> {
        trigger.validate()?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        acquire_blocking(&mut tx, &LockResource::TriggerGraph).await?;
        ensure_acyclic(&mut PgTriggerEdges::new(&mut tx), trigger).await?;

        let result = sqlx::query(
            r#"UPDATE pipeline_trigger
               SET src_application_id = $2, src_pipeline_id = $3, src_environment_id = $4,
                   dest_application_id = $5, dest_pipeline_id = $6, dest_environment_id = $7,
                   manual = $8
               WHERE id = $1"#,
        )
        .bind(trigger.id.as_uuid())
        .bind(trigger.src.application_id.as_uuid())
        .bind(trigger.src.pipeline_id.as_uuid())
        .bind(trigger.src.environment_id.as_uuid())
        .bind(trigger.dest.application_id.as_uuid())
        .bind(trigger.dest.pipeline_id.as_uuid())
        .bind(trigger.dest.environment_id.as_uuid())
        .bind(trigger.manual)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::TriggerNotFound(trigger.id.to_string()));
        }

        delete_children(&mut tx, trigger.id).await?;
        insert_children(&mut tx, trigger).await?;

        tx.commit().await.map_err(db_err)?;

        debug!(trigger_id = %trigger.id, "Trigger updated");
        Ok(())
    }

    async fn delete(&self, id: TriggerId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        acquire_blocking(&mut tx, &LockResource::TriggerGraph).await?;
        delete_children(&mut tx, id).await?;

        let result = sqlx::query("DELETE FROM pipeline_trigger WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::TriggerNotFound(id.to_string()));
        }

        tx.commit().await.map_err(db_err)?;

        debug!(trigger_id = %id, "Trigger deleted");
        Ok(())
    }

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;

        let sql = format!("SELECT {} FROM pipeline_trigger WHERE id = $1", TRIGGER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;

        match row {
            Some(r) => {
                let mut trigger = row_to_trigger(&r);
                load_children(&mut conn, &mut trigger).await?;
                Ok(Some(trigger))
            }
            None => Ok(None),
        }
    }

    async fn load_as_source(&self, node: &TriggerNode) -> Result<Vec<Trigger>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        PgTriggerEdges::new(&mut conn).outgoing(node).await
    }

    async fn load_automatic_as_source(&self, node: &TriggerNode) -> Result<Vec<Trigger>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        select_triggers(
            &mut conn,
            "src_application_id = $1 AND src_pipeline_id = $2 AND src_environment_id = $3 AND manual = false",
            node,
        )
        .await
    }

    async fn load_by_application(&self, application: ApplicationId) -> Result<Vec<Trigger>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;

        let sql = format!(
            "SELECT {} FROM pipeline_trigger WHERE src_application_id = $1 ORDER BY created_at, id",
            TRIGGER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(application.as_uuid())
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let mut triggers: Vec<Trigger> = rows.iter().map(row_to_trigger).collect();
        for t in &mut triggers {
            load_children(&mut conn, t).await?;
        }
        Ok(triggers)
    }

    async fn load_involving(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
        environment: Option<EnvironmentId>,
    ) -> Result<Vec<Trigger>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;

        let sql = format!(
            r#"SELECT {} FROM pipeline_trigger
               WHERE (src_application_id = $1 AND src_pipeline_id = $2
                      AND ($3::uuid IS NULL OR src_environment_id = $3))
                  OR (dest_application_id = $1 AND dest_pipeline_id = $2
                      AND ($3::uuid IS NULL OR dest_environment_id = $3))
               ORDER BY created_at, id"#,
            TRIGGER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(application.as_uuid())
            .bind(pipeline.as_uuid())
            .bind(environment.map(|e| *e.as_uuid()))
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let mut triggers: Vec<Trigger> = rows.iter().map(row_to_trigger).collect();
        for t in &mut triggers {
            load_children(&mut conn, t).await?;
        }
        Ok(triggers)
    }

    async fn exists(&self, src: &TriggerNode, dest: &TriggerNode) -> Result<bool> {
        let row = sqlx::query(
            r#"SELECT EXISTS (
                   SELECT 1 FROM pipeline_trigger
                   WHERE src_application_id = $1 AND src_pipeline_id = $2 AND src_environment_id = $3
                     AND dest_application_id = $4 AND dest_pipeline_id = $5 AND dest_environment_id = $6
               ) AS found"#,
        )
        .bind(src.application_id.as_uuid())
        .bind(src.pipeline_id.as_uuid())
        .bind(src.environment_id.as_uuid())
        .bind(dest.application_id.as_uuid())
        .bind(dest.pipeline_id.as_uuid())
        .bind(dest.environment_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("found"))
    }

    async fn delete_by_pipeline(&self, pipeline: PipelineId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        acquire_blocking(&mut tx, &LockResource::TriggerGraph).await?;
        let deleted = delete_triggers_touching(&mut tx, TriggerScope::Pipeline(pipeline)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(deleted)
    }

    async fn delete_by_application(&self, application: ApplicationId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        acquire_blocking(&mut tx, &LockResource::TriggerGraph).await?;
        let deleted =
            delete_triggers_touching(&mut tx, TriggerScope::Application(application)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(deleted)
    }
}
