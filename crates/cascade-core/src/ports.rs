//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and its
//! persistence and messaging adapters.

use crate::build::{
    BuildCreation, BuildLog, DedupKey, JobTransition, NewBuild, PipelineBuild, PipelineBuildJob,
    BuildStatus,
};
use crate::events::Event;
use crate::ids::*;
use crate::parameter::Parameter;
use crate::pipeline::{Application, Environment, Pipeline, Stage};
use crate::trigger::{Trigger, TriggerNode};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `build.status.*.*`, `job.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Read access to applications and environments, which are managed elsewhere.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn application(&self, id: ApplicationId) -> Result<Option<Application>>;

    async fn environment(&self, id: EnvironmentId) -> Result<Option<Environment>>;
}

/// Repository for pipelines and their parameters.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Create a pipeline with its parameters. Stages go through [`StageRepository`].
    async fn create(&self, pipeline: &Pipeline) -> Result<Pipeline>;

    /// Get a pipeline with its parameters and stages in build order.
    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    async fn get_by_name(&self, project: ProjectId, name: &str) -> Result<Option<Pipeline>>;

    /// Insert or replace a pipeline parameter.
    async fn upsert_parameter(&self, id: PipelineId, parameter: &Parameter) -> Result<()>;

    async fn delete_parameter(&self, id: PipelineId, name: &str) -> Result<()>;

    /// Default parameters of a pipeline when run by an application.
    async fn application_arguments(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
    ) -> Result<Vec<Parameter>>;

    async fn set_application_arguments(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
        arguments: &[Parameter],
    ) -> Result<()>;

    /// Delete a pipeline together with its triggers, stages and builds.
    async fn delete(&self, id: PipelineId) -> Result<()>;
}

/// Repository for stages. Keeps `build_order` dense within a pipeline.
#[async_trait]
pub trait StageRepository: Send + Sync {
    /// Append a stage at the end of its pipeline.
    async fn insert(&self, stage: &Stage) -> Result<Stage>;

    async fn get(&self, pipeline: PipelineId, stage: StageId) -> Result<Option<Stage>>;

    /// Stages of a pipeline in build order.
    async fn list(&self, pipeline: PipelineId) -> Result<Vec<Stage>>;

    async fn count(&self, pipeline: PipelineId) -> Result<u32>;

    /// Update name, enabled flag, jobs and prerequisites. Order is untouched.
    async fn update(&self, stage: &Stage) -> Result<()>;

    /// Move a stage to `new_order`, shifting the stages in between.
    async fn move_to(&self, pipeline: PipelineId, stage: StageId, new_order: u32) -> Result<Stage>;

    /// Delete a stage with its jobs and prerequisites and close the gap.
    async fn delete(&self, pipeline: PipelineId, stage: StageId) -> Result<()>;
}

/// Repository for trigger edges.
#[async_trait]
pub trait TriggerRepository: Send + Sync {
    /// Insert after checking the graph stays acyclic, atomically.
    async fn insert(&self, trigger: &Trigger) -> Result<Trigger>;

    /// Re-check acyclicity, then replace endpoints, parameters and prerequisites.
    async fn update(&self, trigger: &Trigger) -> Result<()>;

    async fn delete(&self, id: TriggerId) -> Result<()>;

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>>;

    /// Triggers whose source is `node`.
    async fn load_as_source(&self, node: &TriggerNode) -> Result<Vec<Trigger>>;

    /// Non-manual triggers whose source is `node`.
    async fn load_automatic_as_source(&self, node: &TriggerNode) -> Result<Vec<Trigger>>;

    /// Triggers whose source application is `application`.
    async fn load_by_application(&self, application: ApplicationId) -> Result<Vec<Trigger>>;

    /// Triggers touching the (application, pipeline[, environment]) in either
    /// direction. Without an environment any environment matches.
    async fn load_involving(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
        environment: Option<EnvironmentId>,
    ) -> Result<Vec<Trigger>>;

    /// Whether an edge between the two nodes exists.
    async fn exists(&self, src: &TriggerNode, dest: &TriggerNode) -> Result<bool>;

    async fn delete_by_pipeline(&self, pipeline: PipelineId) -> Result<u64>;

    async fn delete_by_application(&self, application: ApplicationId) -> Result<u64>;
}

/// Repository for builds.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Allocate the next build number and insert, in one transaction.
    async fn create(&self, build: NewBuild) -> Result<BuildCreation>;

    async fn get(&self, id: BuildId) -> Result<Option<PipelineBuild>>;

    async fn get_by_number(&self, node: &TriggerNode, number: i64) -> Result<Option<PipelineBuild>>;

    /// Highest build number for the node, 0 when none.
    async fn last_build_number(&self, node: &TriggerNode) -> Result<i64>;

    /// Persist status, stage snapshot and completion time.
    async fn save(&self, build: &PipelineBuild) -> Result<()>;

    /// The build preceding `build` on the same node, branch and remote.
    async fn previous(&self, build: &PipelineBuild) -> Result<Option<PipelineBuild>>;

    async fn find_duplicate(&self, key: &DedupKey) -> Result<Option<BuildId>>;

    /// Builds created by triggers fired from `parent`.
    async fn children(&self, parent: BuildId) -> Result<Vec<PipelineBuild>>;

    /// Builds of a node filtered by status, newest first.
    async fn list(
        &self,
        node: &TriggerNode,
        status: Option<BuildStatus>,
        limit: u32,
    ) -> Result<Vec<PipelineBuild>>;

    async fn delete(&self, id: BuildId) -> Result<()>;

    /// Delete every build, job and log of a branch.
    async fn delete_branch(&self, application: ApplicationId, branch: &str) -> Result<u64>;

    async fn delete_by_application(&self, application: ApplicationId) -> Result<u64>;
}

/// Repository for build jobs and their logs.
#[async_trait]
pub trait BuildJobRepository: Send + Sync {
    async fn insert(&self, job: &PipelineBuildJob) -> Result<()>;

    async fn get(&self, id: BuildJobId) -> Result<Option<PipelineBuildJob>>;

    async fn list_for_build(&self, build: BuildId) -> Result<Vec<PipelineBuildJob>>;

    /// Assign a waiting job to a worker. Fails with `AlreadyTaken` otherwise.
    async fn take(&self, id: BuildJobId, worker: WorkerId) -> Result<PipelineBuildJob>;

    /// Apply a status change under the job transition rules.
    async fn update_status(&self, id: BuildJobId, status: BuildStatus) -> Result<JobTransition>;

    /// Reset a job to Waiting and drop its logs.
    async fn restart(&self, id: BuildJobId) -> Result<()>;

    /// Fail every waiting or running job of a build.
    async fn stop_build(&self, build: BuildId) -> Result<u64>;

    async fn append_log(&self, log: &BuildLog) -> Result<()>;

    async fn logs(&self, id: BuildJobId) -> Result<Vec<BuildLog>>;

    /// Running jobs started before `cutoff` with no log line since.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<PipelineBuildJob>>;

    /// Fail a stale job in its own transaction: append `reason` to its log,
    /// set Fail and release the worker. Returns `None` if the job is no
    /// longer stale. Fails with `AlreadyLocked` when another party holds it.
    async fn kill_stale(
        &self,
        id: BuildJobId,
        reason: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<PipelineBuildJob>>;
}

/// Short-lived named leases shared by scheduler replicas.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Claim `name` for `owner` until `ttl` elapses. Returns false when
    /// another owner holds an unexpired lease or is claiming it right now.
    async fn try_claim(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, name: &str, owner: &str) -> Result<()>;
}
