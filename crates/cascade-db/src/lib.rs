//! PostgreSQL persistence layer for Cascade.
//!
//! Every multi-statement mutation runs in a single transaction. Cross-replica
//! coordination goes through the two lock primitives in [`locks`].

mod error;
pub mod locks;
pub mod repositories;

pub use locks::{LockResource, acquire_blocking, acquire_or_fail};
pub use repositories::*;

use cascade_core::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

use crate::error::db_err;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, 20).await
    }

    /// Connect with an explicit pool size.
    pub async fn connect_with(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(db_err)?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| cascade_core::Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Build every repository over this pool.
    pub fn repositories(&self) -> Repositories {
        Repositories::new(self.pool.clone())
    }
}
