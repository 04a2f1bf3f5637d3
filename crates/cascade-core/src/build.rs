//! Pipeline builds, their jobs and logs.

use crate::ids::*;
use crate::parameter::ParameterBag;
use crate::pipeline::{Job, PipelineType, Stage};
use crate::prerequisite::Prerequisite;
use crate::trigger::TriggerNode;
use crate::vcs::VcsInfo;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status shared by builds, build stages and build jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum BuildStatus {
    Waiting,
    Building,
    Success,
    Fail,
    Disabled,
    Skipped,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Waiting => "Waiting",
            BuildStatus::Building => "Building",
            BuildStatus::Success => "Success",
            BuildStatus::Fail => "Fail",
            BuildStatus::Disabled => "Disabled",
            BuildStatus::Skipped => "Skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Waiting" => Some(BuildStatus::Waiting),
            "Building" => Some(BuildStatus::Building),
            "Success" => Some(BuildStatus::Success),
            "Fail" => Some(BuildStatus::Fail),
            "Disabled" => Some(BuildStatus::Disabled),
            "Skipped" => Some(BuildStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Waiting | BuildStatus::Building)
    }

    /// Build state machine. Success and Fail may go back to Building on restart.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Waiting, Building)
                | (Waiting, Disabled)
                | (Waiting, Skipped)
                | (Waiting, Fail)
                | (Building, Success)
                | (Building, Fail)
                | (Success, Building)
                | (Fail, Building)
        )
    }

    pub fn check_transition(&self, next: BuildStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidStatusTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who or what asked for a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildOrigin {
    Manual { username: String },
    VcsPush,
    Upstream {
        parent_build_id: BuildId,
        trigger_id: TriggerId,
    },
    Scheduled,
}

impl BuildOrigin {
    pub fn parent_build_id(&self) -> Option<BuildId> {
        match self {
            BuildOrigin::Upstream { parent_build_id, .. } => Some(*parent_build_id),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            BuildOrigin::Manual { username } => Some(username),
            _ => None,
        }
    }
}

/// Per-run snapshot of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuildStage {
    pub stage_id: StageId,
    pub name: String,
    pub build_order: u32,
    pub enabled: bool,
    pub status: BuildStatus,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
}

impl From<&Stage> for BuildStage {
    fn from(stage: &Stage) -> Self {
        Self {
            stage_id: stage.id,
            name: stage.name.clone(),
            build_order: stage.build_order,
            enabled: stage.enabled,
            status: BuildStatus::Waiting,
            jobs: stage.jobs.clone(),
            prerequisites: stage.prerequisites.clone(),
        }
    }
}

/// One execution of a pipeline for an (application, environment).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineBuild {
    pub id: BuildId,
    pub application_id: ApplicationId,
    pub pipeline_id: PipelineId,
    pub environment_id: EnvironmentId,
    pub build_number: i64,
    pub version: i64,
    pub status: BuildStatus,
    pub stages: Vec<BuildStage>,
    pub parameters: ParameterBag,
    pub vcs: Option<VcsInfo>,
    pub origin: BuildOrigin,
    pub created_at: DateTime<Utc>,
    pub done_at: Option<DateTime<Utc>>,
}

impl PipelineBuild {
    pub fn node(&self) -> TriggerNode {
        TriggerNode::new(self.application_id, self.pipeline_id, self.environment_id)
    }

    pub fn branch(&self) -> Option<&str> {
        self.vcs.as_ref().map(|v| v.branch.as_str())
    }

    pub fn parent_build_id(&self) -> Option<BuildId> {
        self.origin.parent_build_id()
    }

    /// The stage currently waiting or running, if any.
    pub fn current_stage(&self) -> Option<&BuildStage> {
        self.stages
            .iter()
            .find(|s| matches!(s.status, BuildStatus::Waiting | BuildStatus::Building))
    }

    pub fn stage_mut(&mut self, stage_id: StageId) -> Option<&mut BuildStage> {
        self.stages.iter_mut().find(|s| s.stage_id == stage_id)
    }
}

/// Version a new build carries. A requested version is kept only when the
/// build has a parent and either stays in the parent's application or is
/// not a build pipeline; otherwise the version follows the build number.
pub fn requested_version(
    requested: Option<i64>,
    parent_application: Option<ApplicationId>,
    application: ApplicationId,
    pipeline_type: PipelineType,
) -> Option<i64> {
    let requested = requested.filter(|v| *v > 0)?;
    let parent_application = parent_application?;
    if parent_application != application && pipeline_type == PipelineType::Build {
        return None;
    }
    Some(requested)
}

/// Key under which VCS-triggered builds are deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct DedupKey {
    pub application_id: ApplicationId,
    pub pipeline_id: PipelineId,
    pub environment_id: EnvironmentId,
    pub hash: String,
    pub branch: String,
    /// Always normalized: an empty remote is stored as `None`.
    pub remote: Option<String>,
}

impl DedupKey {
    pub fn new(node: TriggerNode, vcs: &VcsInfo) -> Self {
        Self {
            application_id: node.application_id,
            pipeline_id: node.pipeline_id,
            environment_id: node.environment_id,
            hash: vcs.hash.clone(),
            branch: vcs.branch.clone(),
            remote: vcs.normalized_remote().map(str::to_string),
        }
    }
}

/// Everything needed to persist a new build. The build number and the
/// version fallback are filled in by the store under the allocation lock.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub id: BuildId,
    pub node: TriggerNode,
    pub requested_version: Option<i64>,
    pub status: BuildStatus,
    pub stages: Vec<BuildStage>,
    pub parameters: ParameterBag,
    pub vcs: Option<VcsInfo>,
    pub origin: BuildOrigin,
    /// Skip creation when a build with this key exists.
    pub dedup: Option<DedupKey>,
    /// Terminal builds kept per (node, branch) before archival.
    pub history_retention: u32,
}

/// Result of persisting a [`NewBuild`].
#[derive(Debug, Clone)]
pub enum BuildCreation {
    Created(PipelineBuild),
    Duplicate(BuildId),
}

/// Why no build was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SuppressionReason {
    SkipCommit,
    Duplicate { existing: BuildId },
}

/// Outcome of the build entry point.
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Created(PipelineBuild),
    Suppressed(SuppressionReason),
}

impl BuildOutcome {
    pub fn build(&self) -> Option<&PipelineBuild> {
        match self {
            BuildOutcome::Created(b) => Some(b),
            BuildOutcome::Suppressed(_) => None,
        }
    }

    pub fn into_build(self) -> Option<PipelineBuild> {
        match self {
            BuildOutcome::Created(b) => Some(b),
            BuildOutcome::Suppressed(_) => None,
        }
    }
}

/// Execution of one job of a build stage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineBuildJob {
    pub id: BuildJobId,
    pub build_id: BuildId,
    pub stage_id: StageId,
    pub job_id: JobId,
    pub job_name: String,
    pub status: BuildStatus,
    pub worker_id: Option<WorkerId>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
}

impl PipelineBuildJob {
    pub fn waiting(build_id: BuildId, stage_id: StageId, job: &Job) -> Self {
        Self {
            id: BuildJobId::new(),
            build_id,
            stage_id,
            job_id: job.id,
            job_name: job.name.clone(),
            status: BuildStatus::Waiting,
            worker_id: None,
            queued_at: Utc::now(),
            started_at: None,
            done_at: None,
        }
    }
}

/// Job status rules: Building only from Waiting, Success/Fail only from
/// Building, Disabled/Skipped from anywhere. Anything else is a late report
/// and is ignored.
pub fn job_transition_allowed(current: BuildStatus, next: BuildStatus) -> bool {
    match next {
        BuildStatus::Building => current == BuildStatus::Waiting,
        BuildStatus::Success | BuildStatus::Fail => current == BuildStatus::Building,
        BuildStatus::Disabled | BuildStatus::Skipped => true,
        BuildStatus::Waiting => false,
    }
}

/// Result of a job status update.
#[derive(Debug, Clone)]
pub enum JobTransition {
    Applied(PipelineBuildJob),
    Ignored(PipelineBuildJob),
}

impl JobTransition {
    pub fn job(&self) -> &PipelineBuildJob {
        match self {
            JobTransition::Applied(j) | JobTransition::Ignored(j) => j,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, JobTransition::Applied(_))
    }
}

/// One line of a job's log stream.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildLog {
    pub build_job_id: BuildJobId,
    pub build_id: BuildId,
    pub timestamp: DateTime<Utc>,
    pub value: String,
}

impl BuildLog {
    pub fn new(job: &PipelineBuildJob, value: impl Into<String>) -> Self {
        Self {
            build_job_id: job.id,
            build_id: job.build_id,
            timestamp: Utc::now(),
            value: value.into(),
        }
    }
}
