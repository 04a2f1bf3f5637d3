//! Scheduler facade wiring the managers to their ports.

use cascade_core::build::{BuildOutcome, BuildStatus, PipelineBuild, PipelineBuildJob};
use cascade_core::ids::{BuildId, BuildJobId, WorkerId};
use cascade_core::ports::{
    BuildJobRepository, BuildRepository, CatalogRepository, EventBus, LeaseRepository,
    PipelineRepository, StageRepository, TriggerRepository,
};
use cascade_core::trigger::TriggerNode;
use cascade_core::vcs::{VcsInfo, VcsPush};
use cascade_core::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cascade::TriggerCascade;
use crate::config::SchedulerConfig;
use crate::dispatcher::{EventDispatcher, EventPublisher, event_channel};
use crate::graph::TriggerGraphManager;
use crate::lifecycle::{BuildLifecycleManager, BuildRequest, JobReport};
use crate::reconciler::StaleJobReconciler;
use crate::stages::StageOrderManager;

/// Persistence ports the scheduler runs on.
#[derive(Clone)]
pub struct SchedulerPorts {
    pub catalog: Arc<dyn CatalogRepository>,
    pub pipelines: Arc<dyn PipelineRepository>,
    pub stages: Arc<dyn StageRepository>,
    pub triggers: Arc<dyn TriggerRepository>,
    pub builds: Arc<dyn BuildRepository>,
    pub jobs: Arc<dyn BuildJobRepository>,
    pub leases: Arc<dyn LeaseRepository>,
}

/// Entry point for everything that creates or advances builds.
pub struct Scheduler {
    catalog: Arc<dyn CatalogRepository>,
    graph: TriggerGraphManager,
    stages: StageOrderManager,
    lifecycle: Arc<BuildLifecycleManager>,
    cascade: TriggerCascade,
    reconciler: Arc<StaleJobReconciler>,
    events: EventPublisher,
}

impl Scheduler {
    /// Build the scheduler. The returned dispatcher must be spawned for
    /// events to reach `bus`.
    pub fn new(
        ports: SchedulerPorts,
        bus: Arc<dyn EventBus>,
        config: &SchedulerConfig,
    ) -> (Self, EventDispatcher) {
        let (events, dispatcher) = event_channel(bus, config.event_buffer);
        let scheduler = Self::with_publisher(ports, events, config);
        (scheduler, dispatcher)
    }

    pub(crate) fn with_publisher(
        ports: SchedulerPorts,
        events: EventPublisher,
        config: &SchedulerConfig,
    ) -> Self {
        let lifecycle = Arc::new(BuildLifecycleManager::new(
            &ports,
            events.clone(),
            config.history_retention,
            config.instance_id.clone(),
        ));
        let cascade = TriggerCascade::new(
            &ports,
            lifecycle.clone(),
            events.clone(),
            config.cascade_lease(),
            config.instance_id.clone(),
        );
        let reconciler = Arc::new(StaleJobReconciler::new(
            &ports,
            lifecycle.clone(),
            events.clone(),
            config.reconcile_interval(),
            config.stale_after(),
            config.instance_id.clone(),
        ));

        Self {
            catalog: ports.catalog.clone(),
            graph: TriggerGraphManager::new(ports.triggers.clone()),
            stages: StageOrderManager::new(ports.stages.clone()),
            lifecycle,
            cascade,
            reconciler,
            events,
        }
    }

    pub fn graph(&self) -> &TriggerGraphManager {
        &self.graph
    }

    pub fn stages(&self) -> &StageOrderManager {
        &self.stages
    }

    pub fn lifecycle(&self) -> &BuildLifecycleManager {
        &self.lifecycle
    }

    pub fn reconciler(&self) -> Arc<StaleJobReconciler> {
        self.reconciler.clone()
    }

    pub fn publisher(&self) -> EventPublisher {
        self.events.clone()
    }

    /// Create a build and, if it finishes straight away, cascade from it.
    pub async fn create_build(&self, request: BuildRequest) -> Result<BuildOutcome> {
        let outcome = self.lifecycle.create_build(request).await?;
        if let BuildOutcome::Created(build) = &outcome {
            self.cascade_from(build).await;
        }
        Ok(outcome)
    }

    /// Start a build for a repository push on the application of `node`.
    pub async fn handle_push(&self, node: TriggerNode, push: &VcsPush) -> Result<BuildOutcome> {
        let application = self
            .catalog
            .application(node.application_id)
            .await?
            .ok_or_else(|| Error::ApplicationNotFound(node.application_id.to_string()))?;

        let vcs = VcsInfo::from_push(push, application.repository_fullname.as_deref());
        info!(
            application = %application.name,
            branch = %vcs.branch,
            hash = %vcs.hash,
            "Repository push received"
        );
        self.create_build(BuildRequest::vcs_push(node, vcs)).await
    }

    pub async fn take_job(&self, id: BuildJobId, worker: WorkerId) -> Result<PipelineBuildJob> {
        self.lifecycle.take_job(id, worker).await
    }

    /// Apply a worker's report and cascade when it completes the build.
    pub async fn report_job_status(&self, id: BuildJobId, status: BuildStatus) -> Result<JobReport> {
        let report = self.lifecycle.report_job_status(id, status).await?;
        if let Some(build) = &report.finished {
            self.cascade_from(build).await;
        }
        Ok(report)
    }

    pub async fn restart_build(&self, id: BuildId) -> Result<PipelineBuild> {
        let build = self.lifecycle.restart_build(id).await?;
        self.cascade_from(&build).await;
        Ok(build)
    }

    pub async fn stop_build(&self, id: BuildId) -> Result<PipelineBuild> {
        self.lifecycle.stop_build(id).await
    }

    /// Fire triggers from `build` and from every child that also succeeds
    /// without running a job.
    async fn cascade_from(&self, build: &PipelineBuild) {
        let mut pending = VecDeque::from([build.clone()]);
        while let Some(parent) = pending.pop_front() {
            match self.cascade.on_build_success(&parent).await {
                Ok(children) => pending.extend(
                    children
                        .into_iter()
                        .filter(|c| c.status == BuildStatus::Success),
                ),
                Err(e) => warn!(build_id = %parent.id, error = %e, "Trigger cascade failed"),
            }
        }
    }
}
