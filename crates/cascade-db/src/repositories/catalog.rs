//! Projects, applications and environments.
//!
//! These are owned by the surrounding platform; the scheduler only reads
//! them. The `register_*` helpers exist for seeding and tests.

use async_trait::async_trait;
use cascade_core::ids::*;
use cascade_core::pipeline::{Application, Environment, Project};
use cascade_core::ports::CatalogRepository;
use cascade_core::Result;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::db_err;

/// PostgreSQL implementation of CatalogRepository.
#[derive(Clone)]
pub struct PgCatalogRepository {
    pool: PgPool,
}

impl PgCatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register_project(&self, project: &Project) -> Result<()> {
        sqlx::query("INSERT INTO project (id, key, name) VALUES ($1, $2, $3)")
            .bind(project.id.as_uuid())
            .bind(&project.key)
            .bind(&project.name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn register_application(&self, application: &Application) -> Result<()> {
        sqlx::query(
            "INSERT INTO application (id, project_id, name, repository_fullname) VALUES ($1, $2, $3, $4)",
        )
        .bind(application.id.as_uuid())
        .bind(application.project_id.as_uuid())
        .bind(&application.name)
        .bind(&application.repository_fullname)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Register an environment. The "no environment" row is created by the migration.
    pub async fn register_environment(&self, environment: &Environment) -> Result<()> {
        sqlx::query("INSERT INTO environment (id, project_id, name) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING")
            .bind(environment.id.as_uuid())
            .bind(environment.project_id.map(|p| *p.as_uuid()))
            .bind(&environment.name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    async fn application(&self, id: ApplicationId) -> Result<Option<Application>> {
        let row = sqlx::query(
            "SELECT id, project_id, name, repository_fullname FROM application WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| Application {
            id: ApplicationId::from_uuid(r.get::<Uuid, _>("id")),
            project_id: ProjectId::from_uuid(r.get::<Uuid, _>("project_id")),
            name: r.get("name"),
            repository_fullname: r.get("repository_fullname"),
        }))
    }

    async fn environment(&self, id: EnvironmentId) -> Result<Option<Environment>> {
        let row = sqlx::query("SELECT id, project_id, name FROM environment WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| Environment {
            id: EnvironmentId::from_uuid(r.get::<Uuid, _>("id")),
            project_id: r.get::<Option<Uuid>, _>("project_id").map(ProjectId::from_uuid),
            name: r.get("name"),
        }))
    }
}
