//! Lifecycle events published by the scheduler.

use crate::build::{BuildOrigin, BuildStatus, PipelineBuild, PipelineBuildJob};
use crate::ids::*;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events in the Cascade system.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Build lifecycle
    BuildCreated(BuildCreatedPayload),
    BuildStatusChanged(BuildStatusChangedPayload),

    // Job lifecycle
    JobStatusChanged(JobStatusChangedPayload),
    JobTimedOut(JobTimedOutPayload),

    // Trigger graph
    TriggerFired(TriggerFiredPayload),
}

impl Event {
    /// Returns the NATS subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::BuildCreated(p) => format!("build.created.{}", p.build.pipeline_id),
            Event::BuildStatusChanged(p) => {
                format!("build.status.{}.{}", p.build.pipeline_id, p.build.id)
            }
            Event::JobStatusChanged(p) => format!("job.status.{}.{}", p.build_id, p.job_id),
            Event::JobTimedOut(p) => format!("job.timeout.{}.{}", p.build_id, p.job_id),
            Event::TriggerFired(p) => format!("trigger.fired.{}", p.trigger_id),
        }
    }
}

/// Compact view of a build carried in events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuildSummary {
    pub id: BuildId,
    pub application_id: ApplicationId,
    pub pipeline_id: PipelineId,
    pub environment_id: EnvironmentId,
    pub build_number: i64,
    pub version: i64,
    pub status: BuildStatus,
    pub branch: Option<String>,
    pub hash: Option<String>,
    pub done_at: Option<DateTime<Utc>>,
}

impl From<&PipelineBuild> for BuildSummary {
    fn from(b: &PipelineBuild) -> Self {
        Self {
            id: b.id,
            application_id: b.application_id,
            pipeline_id: b.pipeline_id,
            environment_id: b.environment_id,
            build_number: b.build_number,
            version: b.version,
            status: b.status,
            branch: b.vcs.as_ref().map(|v| v.branch.clone()),
            hash: b.vcs.as_ref().map(|v| v.hash.clone()),
            done_at: b.done_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildCreatedPayload {
    pub build: BuildSummary,
    pub origin: BuildOrigin,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildStatusChangedPayload {
    pub build: BuildSummary,
    /// The build immediately preceding this one on the same branch and remote.
    pub previous: Option<BuildSummary>,
    pub from: BuildStatus,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusChangedPayload {
    pub build_id: BuildId,
    pub job_id: BuildJobId,
    pub job_name: String,
    pub stage_id: StageId,
    pub status: BuildStatus,
    pub worker_id: Option<WorkerId>,
    pub changed_at: DateTime<Utc>,
}

impl From<&PipelineBuildJob> for JobStatusChangedPayload {
    fn from(j: &PipelineBuildJob) -> Self {
        Self {
            build_id: j.build_id,
            job_id: j.id,
            job_name: j.job_name.clone(),
            stage_id: j.stage_id,
            status: j.status,
            worker_id: j.worker_id,
            changed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobTimedOutPayload {
    pub build_id: BuildId,
    pub job_id: BuildJobId,
    pub started_at: Option<DateTime<Utc>>,
    pub killed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerFiredPayload {
    pub trigger_id: TriggerId,
    pub parent_build_id: BuildId,
    pub child_build_id: BuildId,
    pub fired_at: DateTime<Utc>,
}
