//! Integration test infrastructure for Cascade.
//!
//! This crate provides testcontainers-based infrastructure for running the
//! scheduler against real services (PostgreSQL, NATS).
//!
//! # Usage
//!
//! ```ignore
//! use cascade_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::postgres_only().await.unwrap();
//!     let catalog = ctx.seed_catalog().await.unwrap();
//!     // Use ctx.db, ctx.repos, catalog.pipeline(...), etc.
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,cascade_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
