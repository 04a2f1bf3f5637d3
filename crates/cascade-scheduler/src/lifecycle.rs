//! Build lifecycle: creation, status transitions and stage planning.

use cascade_core::build::{
    BuildCreation, BuildOrigin, BuildOutcome, BuildStage, BuildStatus, DedupKey, JobTransition,
    NewBuild, PipelineBuild, PipelineBuildJob, SuppressionReason, requested_version,
};
use cascade_core::events::{
    BuildCreatedPayload, BuildStatusChangedPayload, BuildSummary, Event, JobStatusChangedPayload,
};
use cascade_core::ids::*;
use cascade_core::parameter::{Parameter, merge_build_parameters};
use cascade_core::ports::{
    BuildJobRepository, BuildRepository, CatalogRepository, LeaseRepository, PipelineRepository,
};
use cascade_core::prerequisite;
use cascade_core::trigger::TriggerNode;
use cascade_core::vcs::VcsInfo;
use cascade_core::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::EventPublisher;
use crate::scheduler::SchedulerPorts;

const BUILD_GUARD_TTL: Duration = Duration::from_secs(10);
const BUILD_GUARD_ATTEMPTS: u32 = 50;
const BUILD_GUARD_BACKOFF: Duration = Duration::from_millis(20);

/// A request to run a pipeline for an (application, environment).
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub node: TriggerNode,
    /// Run or trigger parameters; they win over every default.
    pub parameters: Vec<Parameter>,
    pub vcs: Option<VcsInfo>,
    pub origin: BuildOrigin,
    pub requested_version: Option<i64>,
    /// Application of the upstream build, when there is one.
    pub parent_application: Option<ApplicationId>,
}

impl BuildRequest {
    pub fn manual(node: TriggerNode, username: impl Into<String>) -> Self {
        Self {
            node,
            parameters: vec![],
            vcs: None,
            origin: BuildOrigin::Manual {
                username: username.into(),
            },
            requested_version: None,
            parent_application: None,
        }
    }

    pub fn vcs_push(node: TriggerNode, vcs: VcsInfo) -> Self {
        Self {
            node,
            parameters: vec![],
            vcs: Some(vcs),
            origin: BuildOrigin::VcsPush,
            requested_version: None,
            parent_application: None,
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_vcs(mut self, vcs: VcsInfo) -> Self {
        self.vcs = Some(vcs);
        self
    }
}

/// What a job status report did.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub transition: JobTransition,
    /// The build, when the report moved it to a terminal status.
    pub finished: Option<PipelineBuild>,
}

/// Mark stages that cannot run and return the index of the next runnable
/// one, which is left `Waiting`.
///
/// Stages are visited in build order. A disabled stage becomes `Disabled`,
/// one whose prerequisites do not hold becomes `Skipped`, and an enabled
/// stage without enabled jobs succeeds at once.
pub fn select_next_stage(build: &mut PipelineBuild) -> Option<usize> {
    let bag = build.parameters.clone();
    let mut order: Vec<usize> = (0..build.stages.len()).collect();
    order.sort_by_key(|&i| build.stages[i].build_order);

    for i in order {
        let stage = &mut build.stages[i];
        if stage.status != BuildStatus::Waiting {
            continue;
        }
        if !stage.enabled {
            stage.status = BuildStatus::Disabled;
            continue;
        }
        let satisfied = match prerequisite::evaluate(&stage.prerequisites, &bag) {
            Ok(satisfied) => satisfied,
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "Unusable stage prerequisite");
                false
            }
        };
        if !satisfied {
            stage.status = BuildStatus::Skipped;
            continue;
        }
        if !stage.jobs.iter().any(|j| j.enabled) {
            stage.status = BuildStatus::Success;
            continue;
        }
        return Some(i);
    }
    None
}

/// Lease owner for a single guarded call. Tasks of one replica share the
/// instance id, so each call gets its own suffix.
pub(crate) fn guard_owner(instance_id: &str) -> String {
    format!("{instance_id}:{}", Uuid::new_v4().simple())
}

fn any_stage_ran(build: &PipelineBuild) -> bool {
    build
        .stages
        .iter()
        .any(|s| matches!(s.status, BuildStatus::Success | BuildStatus::Fail))
}

/// Creates builds and drives them through their states.
pub struct BuildLifecycleManager {
    catalog: Arc<dyn CatalogRepository>,
    pipelines: Arc<dyn PipelineRepository>,
    builds: Arc<dyn BuildRepository>,
    jobs: Arc<dyn BuildJobRepository>,
    leases: Arc<dyn LeaseRepository>,
    events: EventPublisher,
    history_retention: u32,
    instance_id: String,
}

impl BuildLifecycleManager {
    pub fn new(
        ports: &SchedulerPorts,
        events: EventPublisher,
        history_retention: u32,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            catalog: ports.catalog.clone(),
            pipelines: ports.pipelines.clone(),
            builds: ports.builds.clone(),
            jobs: ports.jobs.clone(),
            leases: ports.leases.clone(),
            events,
            history_retention,
            instance_id: instance_id.into(),
        }
    }

    /// Single entry point for new builds.
    ///
    /// Skip-marked commits and duplicate pushes yield
    /// [`BuildOutcome::Suppressed`] without consuming a build number.
    pub async fn create_build(&self, request: BuildRequest) -> Result<BuildOutcome> {
        let node = request.node;

        if let Some(vcs) = &request.vcs {
            if vcs.is_skip_commit() {
                info!(node = %node, hash = %vcs.hash, "Commit marked to skip, no build created");
                return Ok(BuildOutcome::Suppressed(SuppressionReason::SkipCommit));
            }
        }

        let pipeline = self
            .pipelines
            .get(node.pipeline_id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(node.pipeline_id.to_string()))?;
        let application = self
            .catalog
            .application(node.application_id)
            .await?
            .ok_or_else(|| Error::ApplicationNotFound(node.application_id.to_string()))?;
        let environment = self
            .catalog
            .environment(node.environment_id)
            .await?
            .ok_or_else(|| Error::EnvironmentNotFound(node.environment_id.to_string()))?;

        let application_defaults = self
            .pipelines
            .application_arguments(application.id, pipeline.id)
            .await?;

        let mut parameters = merge_build_parameters(
            &pipeline.parameters,
            &application_defaults,
            &request.parameters,
        );
        parameters.set("cds.project", application.project_id.to_string());
        parameters.set("cds.application", &application.name);
        parameters.set("cds.pipeline", &pipeline.name);
        parameters.set("cds.environment", &environment.name);
        if let Some(username) = request.origin.username() {
            parameters.set("cds.triggered_by.username", username);
        }
        if let Some(vcs) = &request.vcs {
            vcs.apply_to(&mut parameters);
        }

        let status = if pipeline.pipeline_type.accepts(node.environment_id) {
            BuildStatus::Waiting
        } else {
            warn!(
                pipeline_id = %pipeline.id,
                pipeline_type = pipeline.pipeline_type.as_str(),
                environment = %environment.name,
                "Pipeline type does not match environment, build disabled"
            );
            BuildStatus::Disabled
        };

        let dedup = match (&request.origin, &request.vcs) {
            (BuildOrigin::VcsPush, Some(vcs)) => Some(DedupKey::new(node, vcs)),
            _ => None,
        };

        let new_build = NewBuild {
            id: BuildId::new(),
            node,
            requested_version: requested_version(
                request.requested_version,
                request.parent_application,
                application.id,
                pipeline.pipeline_type,
            ),
            status,
            stages: pipeline.stages.iter().map(BuildStage::from).collect(),
            parameters,
            vcs: request.vcs,
            origin: request.origin,
            dedup,
            history_retention: self.history_retention,
        };

        let build = match self.builds.create(new_build).await? {
            BuildCreation::Created(build) => build,
            BuildCreation::Duplicate(existing) => {
                info!(node = %node, existing = %existing, "Duplicate push, no build created");
                return Ok(BuildOutcome::Suppressed(SuppressionReason::Duplicate {
                    existing,
                }));
            }
        };

        self.events.emit(Event::BuildCreated(BuildCreatedPayload {
            build: BuildSummary::from(&build),
            origin: build.origin.clone(),
            created_at: build.created_at,
        }));

        if build.status != BuildStatus::Waiting {
            return Ok(BuildOutcome::Created(build));
        }

        let build = self.start(build).await?;
        Ok(BuildOutcome::Created(build))
    }

    /// Launch the first runnable stage, or close the build if there is none.
    async fn start(&self, mut build: PipelineBuild) -> Result<PipelineBuild> {
        match select_next_stage(&mut build) {
            Some(index) => {
                self.transition_status(&mut build, BuildStatus::Building).await?;
                self.launch_stage(&mut build, index).await?;
            }
            None => {
                let status = if any_stage_ran(&build) {
                    BuildStatus::Building
                } else {
                    BuildStatus::Skipped
                };
                self.transition_status(&mut build, status).await?;
                if status == BuildStatus::Building {
                    self.transition_status(&mut build, BuildStatus::Success).await?;
                }
            }
        }
        Ok(build)
    }

    /// Queue the enabled jobs of a stage. Jobs left from an earlier run of
    /// the stage are reset instead of duplicated.
    async fn launch_stage(&self, build: &mut PipelineBuild, index: usize) -> Result<()> {
        let existing = self.jobs.list_for_build(build.id).await?;
        let stage = &mut build.stages[index];
        stage.status = BuildStatus::Building;

        let mut queued = 0usize;
        for job in stage.jobs.iter().filter(|j| j.enabled) {
            match existing
                .iter()
                .find(|e| e.stage_id == stage.stage_id && e.job_id == job.id)
            {
                Some(previous) => self.jobs.restart(previous.id).await?,
                None => {
                    self.jobs
                        .insert(&PipelineBuildJob::waiting(build.id, stage.stage_id, job))
                        .await?
                }
            }
            queued += 1;
        }

        info!(build_id = %build.id, stage = %stage.name, jobs = queued, "Stage started");
        self.builds.save(build).await
    }

    /// Persist a new status with the current stage snapshot.
    ///
    /// Emits a status event carrying the previous build of the same branch
    /// and remote, but only when the status actually changed. Returns
    /// whether it did.
    pub async fn transition_status(
        &self,
        build: &mut PipelineBuild,
        status: BuildStatus,
    ) -> Result<bool> {
        let from = build.status;
        from.check_transition(status)?;

        build.status = status;
        build.done_at = status.is_terminal().then(Utc::now);
        self.builds.save(build).await?;

        if from == status {
            return Ok(false);
        }

        let previous = self.builds.previous(build).await?;
        self.events
            .emit(Event::BuildStatusChanged(BuildStatusChangedPayload {
                build: BuildSummary::from(&*build),
                previous: previous.as_ref().map(BuildSummary::from),
                from,
                changed_at: Utc::now(),
            }));

        info!(
            build_id = %build.id,
            build_number = build.build_number,
            from = %from,
            to = %status,
            "Build status changed"
        );
        Ok(true)
    }

    /// Assign a waiting job to a worker.
    pub async fn take_job(&self, id: BuildJobId, worker: WorkerId) -> Result<PipelineBuildJob> {
        let job = self.jobs.take(id, worker).await?;
        self.events
            .emit(Event::JobStatusChanged(JobStatusChangedPayload::from(&job)));
        Ok(job)
    }

    /// Apply a worker's status report and advance the build when the job's
    /// stage is done.
    pub async fn report_job_status(&self, id: BuildJobId, status: BuildStatus) -> Result<JobReport> {
        let transition = self.jobs.update_status(id, status).await?;
        if !transition.is_applied() {
            return Ok(JobReport {
                transition,
                finished: None,
            });
        }

        let job = transition.job().clone();
        self.events
            .emit(Event::JobStatusChanged(JobStatusChangedPayload::from(&job)));

        let finished = if job.status.is_terminal() {
            self.job_finished(&job).await?
        } else {
            None
        };

        Ok(JobReport {
            transition,
            finished,
        })
    }

    /// Resolve the job's stage once all its jobs are terminal, then launch
    /// the next stage or close the build. Returns the build if it closed.
    pub async fn job_finished(&self, job: &PipelineBuildJob) -> Result<Option<PipelineBuild>> {
        let guard = format!("build:{}", job.build_id);
        let owner = guard_owner(&self.instance_id);
        self.claim_build_guard(&guard, &owner).await?;
        let result = self.advance(job).await;
        if let Err(e) = self.leases.release(&guard, &owner).await {
            warn!(build_id = %job.build_id, error = %e, "Failed to release build guard");
        }
        result
    }

    async fn advance(&self, job: &PipelineBuildJob) -> Result<Option<PipelineBuild>> {
        let mut build = self
            .builds
            .get(job.build_id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(job.build_id.to_string()))?;

        if build.status != BuildStatus::Building {
            return Ok(None);
        }
        let stage_status = build
            .stages
            .iter()
            .find(|s| s.stage_id == job.stage_id)
            .map(|s| s.status)
            .ok_or_else(|| Error::StageNotFound(job.stage_id.to_string()))?;
        if stage_status != BuildStatus::Building {
            return Ok(None);
        }

        let siblings: Vec<PipelineBuildJob> = self
            .jobs
            .list_for_build(build.id)
            .await?
            .into_iter()
            .filter(|j| j.stage_id == job.stage_id)
            .collect();

        if siblings.iter().any(|j| !j.status.is_terminal()) {
            debug!(build_id = %build.id, stage_id = %job.stage_id, "Stage still running");
            return Ok(None);
        }

        let failed = siblings.iter().any(|j| j.status == BuildStatus::Fail);
        if let Some(stage) = build.stage_mut(job.stage_id) {
            stage.status = if failed {
                BuildStatus::Fail
            } else {
                BuildStatus::Success
            };
        }

        if failed {
            self.transition_status(&mut build, BuildStatus::Fail).await?;
            return Ok(Some(build));
        }

        match select_next_stage(&mut build) {
            Some(index) => {
                self.launch_stage(&mut build, index).await?;
                Ok(None)
            }
            None => {
                self.transition_status(&mut build, BuildStatus::Success).await?;
                Ok(Some(build))
            }
        }
    }

    /// Run a finished build again. After a failure only the failed stage
    /// and those after it rerun; after a success every stage does.
    pub async fn restart_build(&self, id: BuildId) -> Result<PipelineBuild> {
        let mut build = self
            .builds
            .get(id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))?;

        let rerun_all = match build.status {
            BuildStatus::Success => true,
            BuildStatus::Fail => false,
            other => {
                return Err(Error::InvalidStatusTransition {
                    from: other.to_string(),
                    to: BuildStatus::Building.to_string(),
                });
            }
        };

        for stage in &mut build.stages {
            if rerun_all || stage.status == BuildStatus::Fail {
                stage.status = BuildStatus::Waiting;
            }
        }

        self.transition_status(&mut build, BuildStatus::Building).await?;
        match select_next_stage(&mut build) {
            Some(index) => self.launch_stage(&mut build, index).await?,
            None => {
                self.transition_status(&mut build, BuildStatus::Success).await?;
            }
        }

        info!(build_id = %id, build_number = build.build_number, "Build restarted");
        Ok(build)
    }

    /// Fail a waiting or running build together with its unfinished jobs.
    pub async fn stop_build(&self, id: BuildId) -> Result<PipelineBuild> {
        let mut build = self
            .builds
            .get(id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))?;

        if build.status.is_terminal() {
            return Ok(build);
        }

        let stopped = self.jobs.stop_build(id).await?;
        for stage in &mut build.stages {
            if stage.status == BuildStatus::Building {
                stage.status = BuildStatus::Fail;
            }
        }
        self.transition_status(&mut build, BuildStatus::Fail).await?;

        info!(build_id = %id, jobs = stopped, "Build stopped");
        Ok(build)
    }

    async fn claim_build_guard(&self, name: &str, owner: &str) -> Result<()> {
        for _ in 0..BUILD_GUARD_ATTEMPTS {
            if self
                .leases
                .try_claim(name, owner, BUILD_GUARD_TTL)
                .await?
            {
                return Ok(());
            }
            tokio::time::sleep(BUILD_GUARD_BACKOFF).await;
        }
        Err(Error::AlreadyLocked(name.to_string()))
    }
}
