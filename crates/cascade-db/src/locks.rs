//! Named lock primitives.
//!
//! Both locks are transaction-scoped Postgres advisory locks keyed by a
//! stable hash of the resource name, so they can guard resources that have
//! no row yet (the first build number of a node, a lease not claimed yet).
//! They are released on commit or rollback.

use cascade_core::ids::{BuildId, BuildJobId};
use cascade_core::trigger::TriggerNode;
use cascade_core::{Error, Result};
use sqlx::{PgConnection, Row};
use tracing::debug;

use crate::error::db_err;

/// Something a transaction can hold exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResource {
    /// Build number sequence of a node.
    BuildNumber(TriggerNode),
    /// The whole trigger graph; serializes edge mutations.
    TriggerGraph,
    /// Cascade processing of a finished build.
    Build(BuildId),
    BuildJob(BuildJobId),
    Lease(String),
}

impl LockResource {
    pub fn key(&self) -> String {
        match self {
            LockResource::BuildNumber(n) => format!(
                "build_number:{}:{}:{}",
                n.pipeline_id, n.application_id, n.environment_id
            ),
            LockResource::TriggerGraph => "trigger_graph".to_string(),
            LockResource::Build(id) => format!("build:{}", id),
            LockResource::BuildJob(id) => format!("build_job:{}", id),
            LockResource::Lease(name) => format!("lease:{}", name),
        }
    }
}

/// Wait until the resource is free, then hold it for the rest of the transaction.
pub async fn acquire_blocking(conn: &mut PgConnection, resource: &LockResource) -> Result<()> {
    let key = resource.key();
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(&key)
        .execute(conn)
        .await
        .map_err(db_err)?;

    debug!(lock = %key, "Acquired lock");
    Ok(())
}

/// Take the resource for the rest of the transaction, or fail immediately
/// with [`Error::AlreadyLocked`].
pub async fn acquire_or_fail(conn: &mut PgConnection, resource: &LockResource) -> Result<()> {
    let key = resource.key();
    let row = sqlx::query("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0)) AS acquired")
        .bind(&key)
        .fetch_one(conn)
        .await
        .map_err(db_err)?;

    if row.get::<bool, _>("acquired") {
        debug!(lock = %key, "Acquired lock");
        Ok(())
    } else {
        Err(Error::AlreadyLocked(key))
    }
}
