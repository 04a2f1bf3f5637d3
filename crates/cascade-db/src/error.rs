//! Mapping from sqlx errors to domain errors.

use cascade_core::Error;

/// SQLSTATE raised by `NOWAIT` when the row lock is held elsewhere.
const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some(LOCK_NOT_AVAILABLE) => return Error::AlreadyLocked(db.message().to_string()),
            Some(UNIQUE_VIOLATION) => return Error::Conflict(db.message().to_string()),
            _ => {}
        }
    }
    Error::Database(e.to_string())
}

pub(crate) fn json_err(e: serde_json::Error) -> Error {
    Error::Serialization(e.to_string())
}
