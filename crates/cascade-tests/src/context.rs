//! Test context providing access to the test infrastructure.

use crate::containers::{NatsContainer, PostgresContainer};
use crate::fixtures::CatalogFixture;
use cascade_db::{Database, Repositories};
use cascade_nats::NatsEventBus;

/// Test context with PostgreSQL and NATS running.
///
/// Drop this to stop all containers.
pub struct TestContext {
    pub postgres: PostgresContainer,
    pub nats: NatsContainer,
    pub db: Database,
    pub repos: Repositories,
    pub event_bus: NatsEventBus,
}

impl TestContext {
    /// Create a new test context with all containers running.
    pub async fn new() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let (postgres, nats) = tokio::try_join!(PostgresContainer::start(), NatsContainer::start())?;

        let db = Database::connect(postgres.connection_string()).await?;
        db.migrate().await?;
        let repos = db.repositories();

        let event_bus = NatsEventBus::connect(nats.url()).await?;

        Ok(Self {
            postgres,
            nats,
            db,
            repos,
            event_bus,
        })
    }

    /// Create context with only PostgreSQL.
    pub async fn postgres_only() -> anyhow::Result<PostgresOnlyContext> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(postgres.connection_string()).await?;
        db.migrate().await?;
        let repos = db.repositories();

        Ok(PostgresOnlyContext { postgres, db, repos })
    }

    /// Create context with only NATS.
    pub async fn nats_only() -> anyhow::Result<NatsOnlyContext> {
        crate::init_test_logging();

        let nats = NatsContainer::start().await?;
        let event_bus = NatsEventBus::connect(nats.url()).await?;

        Ok(NatsOnlyContext { nats, event_bus })
    }

    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }

    pub fn nats_url(&self) -> &str {
        self.nats.url()
    }

    /// Register a project with one VCS-linked application.
    pub async fn seed_catalog(&self) -> anyhow::Result<CatalogFixture> {
        CatalogFixture::seed(&self.repos).await
    }
}

/// Minimal context with only PostgreSQL.
pub struct PostgresOnlyContext {
    pub postgres: PostgresContainer,
    pub db: Database,
    pub repos: Repositories,
}

impl PostgresOnlyContext {
    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }

    /// Register a project with one VCS-linked application.
    pub async fn seed_catalog(&self) -> anyhow::Result<CatalogFixture> {
        CatalogFixture::seed(&self.repos).await
    }
}

/// Minimal context with only NATS.
pub struct NatsOnlyContext {
    pub nats: NatsContainer,
    pub event_bus: NatsEventBus,
}

impl NatsOnlyContext {
    pub fn nats_url(&self) -> &str {
        self.nats.url()
    }
}
