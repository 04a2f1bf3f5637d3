//! Cascade Core
//!
//! Domain types, traits, and error handling for the Cascade trigger
//! scheduler. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates: pipelines and stages, trigger
//! edges, builds and jobs, parameter templating and prerequisite gates.

pub mod build;
pub mod error;
pub mod events;
pub mod graph;
pub mod ids;
pub mod parameter;
pub mod pipeline;
pub mod ports;
pub mod prerequisite;
pub mod template;
pub mod trigger;
pub mod vcs;

pub use error::{Error, Result};
pub use ids::*;
