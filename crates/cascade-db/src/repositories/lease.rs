//! Named leases backed by the scheduler_lease table.

use async_trait::async_trait;
use cascade_core::ports::LeaseRepository;
use cascade_core::{Error, Result};
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;

use crate::error::db_err;
use crate::locks::{LockResource, acquire_or_fail};

/// PostgreSQL implementation of LeaseRepository.
#[derive(Clone)]
pub struct PgLeaseRepository {
    pool: PgPool,
}

impl PgLeaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseRepository for PgLeaseRepository {
    async fn try_claim(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        match acquire_or_fail(&mut tx, &LockResource::Lease(name.to_string())).await {
            Ok(()) => {}
            Err(Error::AlreadyLocked(_)) => return Ok(false),
            Err(e) => return Err(e),
        }

        // Renews our own lease or takes over an expired one; a live lease
        // of another owner leaves the row untouched and returns nothing.
        let row = sqlx::query(
            r#"INSERT INTO scheduler_lease (name, owner, expires_at)
               VALUES ($1, $2, now() + make_interval(secs => $3))
               ON CONFLICT (name) DO UPDATE
                   SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                   WHERE scheduler_lease.owner = EXCLUDED.owner
                      OR scheduler_lease.expires_at < now()
               RETURNING owner"#,
        )
        .bind(name)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let claimed = row.is_some();
        debug!(lease = name, owner, claimed, "Lease claim");
        Ok(claimed)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduler_lease WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
