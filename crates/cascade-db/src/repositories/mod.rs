//! Repository implementations for PostgreSQL.

mod build;
mod build_job;
mod catalog;
mod common;
mod lease;
mod pipeline;
mod stage;
mod trigger;

pub use build::PgBuildRepository;
pub use build_job::PgBuildJobRepository;
pub use catalog::PgCatalogRepository;
pub use lease::PgLeaseRepository;
pub use pipeline::PgPipelineRepository;
pub use stage::PgStageRepository;
pub use trigger::{PgTriggerEdges, PgTriggerRepository};

use sqlx::PgPool;
use std::sync::Arc;

/// Every repository over one pool.
#[derive(Clone)]
pub struct Repositories {
    pub catalog: Arc<PgCatalogRepository>,
    pub pipelines: Arc<PgPipelineRepository>,
    pub stages: Arc<PgStageRepository>,
    pub triggers: Arc<PgTriggerRepository>,
    pub builds: Arc<PgBuildRepository>,
    pub jobs: Arc<PgBuildJobRepository>,
    pub leases: Arc<PgLeaseRepository>,
}

impl Repositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            catalog: Arc::new(PgCatalogRepository::new(pool.clone())),
            pipelines: Arc::new(PgPipelineRepository::new(pool.clone())),
            stages: Arc::new(PgStageRepository::new(pool.clone())),
            triggers: Arc::new(PgTriggerRepository::new(pool.clone())),
            builds: Arc::new(PgBuildRepository::new(pool.clone())),
            jobs: Arc::new(PgBuildJobRepository::new(pool.clone())),
            leases: Arc::new(PgLeaseRepository::new(pool)),
        }
    }
}
