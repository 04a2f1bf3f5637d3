//! Error types for Cascade.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Trigger graph errors
    #[error("Infinite trigger loop: {0}")]
    InfiniteTriggerLoop(String),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Secret parameters cannot be used in triggers: {0}")]
    SecretNotAllowed(String),

    // Pipeline and stage errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Invalid stage order {requested} (pipeline has {count} stages)")]
    InvalidStageOrder { requested: u32, count: u32 },

    #[error("Invalid prerequisite on {parameter}: {reason}")]
    InvalidPrerequisite { parameter: String, reason: String },

    // Catalog errors
    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    // Build errors
    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Build job not found: {0}")]
    BuildJobNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Build job already taken: {0}")]
    AlreadyTaken(String),

    // Concurrency errors
    #[error("Resource already locked: {0}")]
    AlreadyLocked(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error means another party currently holds the resource.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Error::AlreadyLocked(_) | Error::AlreadyTaken(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
