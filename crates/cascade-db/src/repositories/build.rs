//! PostgreSQL implementation of BuildRepository.

use async_trait::async_trait;
use cascade_core::build::{
    BuildCreation, BuildOrigin, BuildStage, BuildStatus, DedupKey, NewBuild, PipelineBuild,
};
use cascade_core::ids::*;
use cascade_core::parameter::ParameterBag;
use cascade_core::ports::BuildRepository;
use cascade_core::trigger::TriggerNode;
use cascade_core::vcs::VcsInfo;
use cascade_core::{Error, Result};
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{db_err, json_err};
use crate::locks::{LockResource, acquire_blocking};

const BUILD_COLUMNS: &str = "id, application_id, pipeline_id, environment_id, build_number, \
     version, status, stages, args, origin, vcs_branch, vcs_hash, vcs_author, vcs_message, \
     vcs_remote, vcs_repository, created_at, done_at";

/// PostgreSQL implementation of BuildRepository.
#[derive(Clone)]
pub struct PgBuildRepository {
    pool: PgPool,
}

impl PgBuildRepository {
    /// Create a new PgBuildRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_build(r: &PgRow) -> Result<PipelineBuild> {
    let status_str: String = r.get("status");
    let status = BuildStatus::parse(&status_str)
        .ok_or_else(|| Error::Database(format!("unknown build status {}", status_str)))?;

    let stages: Vec<BuildStage> =
        serde_json::from_value(r.get::<serde_json::Value, _>("stages")).map_err(json_err)?;
    let parameters: ParameterBag =
        serde_json::from_value(r.get::<serde_json::Value, _>("args")).map_err(json_err)?;
    let origin: BuildOrigin =
        serde_json::from_value(r.get::<serde_json::Value, _>("origin")).map_err(json_err)?;

    let vcs = r
        .get::<Option<String>, _>("vcs_hash")
        .map(|hash| VcsInfo {
            branch: r.get::<Option<String>, _>("vcs_branch").unwrap_or_default(),
            hash,
            author: r.get::<Option<String>, _>("vcs_author").unwrap_or_default(),
            message: r.get::<Option<String>, _>("vcs_message").unwrap_or_default(),
            remote: r.get("vcs_remote"),
            repository: r.get("vcs_repository"),
        });

    Ok(PipelineBuild {
        id: BuildId::from_uuid(r.get::<Uuid, _>("id")),
        application_id: ApplicationId::from_uuid(r.get::<Uuid, _>("application_id")),
        pipeline_id: PipelineId::from_uuid(r.get::<Uuid, _>("pipeline_id")),
        environment_id: EnvironmentId::from_uuid(r.get::<Uuid, _>("environment_id")),
        build_number: r.get("build_number"),
        version: r.get("version"),
        status,
        stages,
        parameters,
        vcs,
        origin,
        created_at: r.get("created_at"),
        done_at: r.get("done_at"),
    })
}

/// Highest number ever allocated to the node, archived builds included.
/// Holds a row lock on the current newest build.
async fn last_build_number(conn: &mut PgConnection, node: &TriggerNode) -> Result<i64> {
    let live = sqlx::query(
        r#"SELECT build_number FROM pipeline_build
           WHERE pipeline_id = $1 AND application_id = $2 AND environment_id = $3
           ORDER BY build_number DESC LIMIT 1
           FOR UPDATE"#,
    )
    .bind(node.pipeline_id.as_uuid())
    .bind(node.application_id.as_uuid())
    .bind(node.environment_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .map(|r| r.get::<i64, _>("build_number"))
    .unwrap_or(0);

    let archived = sqlx::query(
        r#"SELECT COALESCE(MAX(build_number), 0) AS n FROM pipeline_build_history
           WHERE pipeline_id = $1 AND application_id = $2 AND environment_id = $3"#,
    )
    .bind(node.pipeline_id.as_uuid())
    .bind(node.application_id.as_uuid())
    .bind(node.environment_id.as_uuid())
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?
    .get::<i64, _>("n");

    Ok(live.max(archived))
}

async fn find_duplicate(conn: &mut PgConnection, key: &DedupKey) -> Result<Option<BuildId>> {
    let row = sqlx::query(
        r#"SELECT id FROM (
               SELECT id, application_id, pipeline_id, environment_id,
                      vcs_hash, vcs_branch, vcs_remote
               FROM pipeline_build
               UNION ALL
               SELECT id, application_id, pipeline_id, environment_id,
                      vcs_hash, vcs_branch, vcs_remote
               FROM pipeline_build_history
           ) b
           WHERE application_id = $1 AND pipeline_id = $2 AND environment_id = $3
             AND vcs_hash = $4 AND vcs_branch = $5
             AND vcs_remote IS NOT DISTINCT FROM $6
           LIMIT 1"#,
    )
    .bind(key.application_id.as_uuid())
    .bind(key.pipeline_id.as_uuid())
    .bind(key.environment_id.as_uuid())
    .bind(&key.hash)
    .bind(&key.branch)
    .bind(&key.remote)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(row.map(|r| BuildId::from_uuid(r.get::<Uuid, _>("id"))))
}

async fn previous_hash(
    conn: &mut PgConnection,
    node: &TriggerNode,
    branch: &str,
) -> Result<Option<String>> {
    let row = sqlx::query(
        r#"SELECT vcs_hash FROM pipeline_build
           WHERE application_id = $1 AND pipeline_id = $2 AND environment_id = $3
             AND vcs_branch = $4 AND vcs_hash IS NOT NULL
           ORDER BY build_number DESC LIMIT 1"#,
    )
    .bind(node.application_id.as_uuid())
    .bind(node.pipeline_id.as_uuid())
    .bind(node.environment_id.as_uuid())
    .bind(branch)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(row.and_then(|r| r.get("vcs_hash")))
}

/// Move terminal builds of the node and branch beyond the newest `keep`
/// into the history table.
async fn archive_superseded(
    conn: &mut PgConnection,
    node: &TriggerNode,
    branch: Option<&str>,
    keep: u32,
) -> Result<u64> {
    let rows = sqlx::query(
        r#"SELECT id FROM pipeline_build
           WHERE application_id = $1 AND pipeline_id = $2 AND environment_id = $3
             AND vcs_branch IS NOT DISTINCT FROM $4
             AND status NOT IN ('Waiting', 'Building')
           ORDER BY build_number DESC
           OFFSET $5"#,
    )
    .bind(node.application_id.as_uuid())
    .bind(node.pipeline_id.as_uuid())
    .bind(node.environment_id.as_uuid())
    .bind(branch)
    .bind(keep as i64)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    let ids: Vec<Uuid> = rows.iter().map(|r| r.get::<Uuid, _>("id")).collect();
    if ids.is_empty() {
        return Ok(0);
    }

    sqlx::query(
        "INSERT INTO pipeline_build_history SELECT pb.*, now() FROM pipeline_build pb WHERE pb.id = ANY($1)",
    )
    .bind(&ids)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    delete_builds(conn, &ids).await
}

/// Delete builds with their jobs and logs.
pub(crate) async fn delete_builds(conn: &mut PgConnection, ids: &[Uuid]) -> Result<u64> {
    sqlx::query("DELETE FROM build_log WHERE pipeline_build_id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    sqlx::query("DELETE FROM pipeline_build_job WHERE pipeline_build_id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    let result = sqlx::query("DELETE FROM pipeline_build WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    Ok(result.rows_affected())
}

/// Which builds a cleanup removes, history included.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BuildScope<'a> {
    Pipeline(PipelineId),
    Application(ApplicationId),
    Branch(ApplicationId, &'a str),
}

pub(crate) async fn delete_builds_in(conn: &mut PgConnection, scope: BuildScope<'_>) -> Result<u64> {
    let (filter, id, branch) = match scope {
        BuildScope::Pipeline(p) => ("pipeline_id = $1", *p.as_uuid(), None),
        BuildScope::Application(a) => ("application_id = $1", *a.as_uuid(), None),
        BuildScope::Branch(a, b) => ("application_id = $1 AND vcs_branch = $2", *a.as_uuid(), Some(b)),
    };

    let select = format!("SELECT id FROM pipeline_build WHERE {}", filter);
    let mut query = sqlx::query(&select).bind(id);
    if let Some(b) = branch {
        query = query.bind(b);
    }
    let ids: Vec<Uuid> = query
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?
        .iter()
        .map(|r| r.get::<Uuid, _>("id"))
        .collect();

    let history = format!("DELETE FROM pipeline_build_history WHERE {}", filter);
    let mut query = sqlx::query(&history).bind(id);
    if let Some(b) = branch {
        query = query.bind(b);
    }
    query.execute(&mut *conn).await.map_err(db_err)?;

    if ids.is_empty() {
        return Ok(0);
    }
    delete_builds(conn, &ids).await
}

#[async_trait]
impl BuildRepository for PgBuildRepository {
    async fn create(&self, build: NewBuild) -> Result<BuildCreation> {
        let node = build.node;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        acquire_blocking(&mut tx, &LockResource::BuildNumber(node)).await?;

        if let Some(key) = &build.dedup {
            if let Some(existing) = find_duplicate(&mut tx, key).await? {
                debug!(
                    build_id = %existing,
                    hash = %key.hash,
                    branch = %key.branch,
                    "Duplicate build suppressed"
                );
                return Ok(BuildCreation::Duplicate(existing));
            }
        }

        let build_number = last_build_number(&mut tx, &node).await? + 1;
        let version = build.requested_version.unwrap_or(build_number);

        let mut parameters = build.parameters;
        parameters.set("cds.buildNumber", build_number.to_string());
        parameters.set("cds.version", version.to_string());

        let vcs = build.vcs.map(|mut v| {
            if v.remote.as_deref() == Some("") {
                v.remote = None;
            }
            v
        });
        if let Some(v) = &vcs {
            if let Some(hash) = previous_hash(&mut tx, &node, &v.branch).await? {
                parameters.set("git.previousHash", hash);
            }
        }

        let now = Utc::now();
        let done_at = build.status.is_terminal().then_some(now);
        let stages_json = serde_json::to_value(&build.stages).map_err(json_err)?;
        let args_json = serde_json::to_value(&parameters).map_err(json_err)?;
        let origin_json = serde_json::to_value(&build.origin).map_err(json_err)?;

        sqlx::query(
            r#"INSERT INTO pipeline_build (id, application_id, pipeline_id, environment_id, build_number,
                   version, status, stages, args, origin, parent_id, vcs_branch, vcs_hash, vcs_author,
                   vcs_message, vcs_remote, vcs_repository, created_at, done_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"#,
        )
        .bind(build.id.as_uuid())
        .bind(node.application_id.as_uuid())
        .bind(node.pipeline_id.as_uuid())
        .bind(node.environment_id.as_uuid())
        .bind(build_number)
        .bind(version)
        .bind(build.status.as_str())
        .bind(&stages_json)
        .bind(&args_json)
        .bind(&origin_json)
        .bind(build.origin.parent_build_id().map(|p| *p.as_uuid()))
        .bind(vcs.as_ref().map(|v| v.branch.clone()))
        .bind(vcs.as_ref().map(|v| v.hash.clone()))
        .bind(vcs.as_ref().map(|v| v.author.clone()))
        .bind(vcs.as_ref().map(|v| v.message.clone()))
        .bind(vcs.as_ref().and_then(|v| v.remote.clone()))
        .bind(vcs.as_ref().and_then(|v| v.repository.clone()))
        .bind(now)
        .bind(done_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let archived = archive_superseded(
            &mut tx,
            &node,
            vcs.as_ref().map(|v| v.branch.as_str()),
            build.history_retention,
        )
        .await?;

        tx.commit().await.map_err(db_err)?;

        info!(
            build_id = %build.id,
            pipeline_id = %node.pipeline_id,
            application_id = %node.application_id,
            build_number,
            version,
            archived,
            "Build created"
        );

        Ok(BuildCreation::Created(PipelineBuild {
            id: build.id,
            application_id: node.application_id,
            pipeline_id: node.pipeline_id,
            environment_id: node.environment_id,
            build_number,
            version,
            status: build.status,
            stages: build.stages,
            parameters,
            vcs,
            origin: build.origin,
            created_at: now,
            done_at,
        }))
    }

    async fn get(&self, id: BuildId) -> Result<Option<PipelineBuild>> {
        let sql = format!("SELECT {} FROM pipeline_build WHERE id = $1", BUILD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_build).transpose()
    }

    async fn get_by_number(&self, node: &TriggerNode, number: i64) -> Result<Option<PipelineBuild>> {
        let sql = format!(
            "SELECT {} FROM pipeline_build WHERE application_id = $1 AND pipeline_id = $2 AND environment_id = $3 AND build_number = $4",
            BUILD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(node.application_id.as_uuid())
            .bind(node.pipeline_id.as_uuid())
            .bind(node.environment_id.as_uuid())
            .bind(number)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_build).transpose()
    }

    async fn last_build_number(&self, node: &TriggerNode) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let n = last_build_number(&mut tx, node).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(n)
    }

    async fn save(&self, build: &PipelineBuild) -> Result<()> {
        let stages_json = serde_json::to_value(&build.stages).map_err(json_err)?;
        let args_json = serde_json::to_value(&build.parameters).map_err(json_err)?;

        let result = sqlx::query(
            "UPDATE pipeline_build SET status = $1, stages = $2, args = $3, done_at = $4 WHERE id = $5",
        )
        .bind(build.status.as_str())
        .bind(&stages_json)
        .bind(&args_json)
        .bind(build.done_at)
        .bind(build.id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::BuildNotFound(build.id.to_string()));
        }
        Ok(())
    }

    async fn previous(&self, build: &PipelineBuild) -> Result<Option<PipelineBuild>> {
        let sql = format!(
            r#"SELECT {} FROM pipeline_build
               WHERE application_id = $1 AND pipeline_id = $2 AND environment_id = $3
                 AND vcs_branch IS NOT DISTINCT FROM $4
                 AND vcs_remote IS NOT DISTINCT FROM $5
                 AND build_number < $6
               ORDER BY build_number DESC LIMIT 1"#,
            BUILD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(build.application_id.as_uuid())
            .bind(build.pipeline_id.as_uuid())
            .bind(build.environment_id.as_uuid())
            .bind(build.vcs.as_ref().map(|v| v.branch.clone()))
            .bind(build.vcs.as_ref().and_then(|v| v.normalized_remote().map(str::to_string)))
            .bind(build.build_number)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_build).transpose()
    }

    async fn find_duplicate(&self, key: &DedupKey) -> Result<Option<BuildId>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        find_duplicate(&mut conn, key).await
    }

    async fn children(&self, parent: BuildId) -> Result<Vec<PipelineBuild>> {
        let sql = format!(
            "SELECT {} FROM pipeline_build WHERE parent_id = $1 ORDER BY created_at",
            BUILD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(parent.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_build).collect()
    }

    async fn list(
        &self,
        node: &TriggerNode,
        status: Option<BuildStatus>,
        limit: u32,
    ) -> Result<Vec<PipelineBuild>> {
        let sql = format!(
            r#"SELECT {} FROM pipeline_build
               WHERE application_id = $1 AND pipeline_id = $2 AND environment_id = $3
                 AND ($4::text IS NULL OR status = $4)
               ORDER BY build_number DESC LIMIT $5"#,
            BUILD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(node.application_id.as_uuid())
            .bind(node.pipeline_id.as_uuid())
            .bind(node.environment_id.as_uuid())
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_build).collect()
    }

    async fn delete(&self, id: BuildId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let deleted = delete_builds(&mut tx, &[*id.as_uuid()]).await?;
        if deleted == 0 {
            return Err(Error::BuildNotFound(id.to_string()));
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_branch(&self, application: ApplicationId, branch: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let deleted = delete_builds_in(&mut tx, BuildScope::Branch(application, branch)).await?;
        tx.commit().await.map_err(db_err)?;

        info!(application_id = %application, branch, deleted, "Branch builds deleted");
        Ok(deleted)
    }

    async fn delete_by_application(&self, application: ApplicationId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let deleted = delete_builds_in(&mut tx, BuildScope::Application(application)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(deleted)
    }
}
