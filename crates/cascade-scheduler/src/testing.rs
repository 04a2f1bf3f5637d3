//! In-memory ports for unit tests.

use async_trait::async_trait;
use cascade_core::build::{
    BuildCreation, BuildLog, BuildOrigin, BuildStatus, DedupKey, JobTransition, NewBuild,
    PipelineBuild, PipelineBuildJob, job_transition_allowed,
};
use cascade_core::events::Event;
use cascade_core::graph::ensure_acyclic;
use cascade_core::ids::*;
use cascade_core::parameter::Parameter;
use cascade_core::pipeline::{Application, Environment, Job, Pipeline, PipelineType, Stage};
use cascade_core::ports::*;
use cascade_core::trigger::{Trigger, TriggerNode};
use cascade_core::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bus::InProcessEventBus;
use crate::cascade::TriggerCascade;
use crate::config::SchedulerConfig;
use crate::dispatcher::{EventDispatcher, EventPublisher, event_channel};
use crate::lifecycle::BuildLifecycleManager;
use crate::reconciler::StaleJobReconciler;
use crate::scheduler::{Scheduler, SchedulerPorts};

const INSTANCE: &str = "test-instance";

#[derive(Default)]
pub struct InMemoryCatalog {
    applications: Mutex<HashMap<ApplicationId, Application>>,
    environments: Mutex<HashMap<EnvironmentId, Environment>>,
}

impl InMemoryCatalog {
    pub fn add_application(&self, application: Application) {
        self.applications
            .lock()
            .unwrap()
            .insert(application.id, application);
    }

    pub fn add_environment(&self, environment: Environment) {
        self.environments
            .lock()
            .unwrap()
            .insert(environment.id, environment);
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalog {
    async fn application(&self, id: ApplicationId) -> Result<Option<Application>> {
        Ok(self.applications.lock().unwrap().get(&id).cloned())
    }

    async fn environment(&self, id: EnvironmentId) -> Result<Option<Environment>> {
        Ok(self.environments.lock().unwrap().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryStages {
    stages: Mutex<Vec<Stage>>,
}

impl InMemoryStages {
    fn seed(&self, mut stage: Stage) -> Stage {
        let mut stages = self.stages.lock().unwrap();
        stage.build_order = stages
            .iter()
            .filter(|s| s.pipeline_id == stage.pipeline_id)
            .count() as u32
            + 1;
        stages.push(stage.clone());
        stage
    }

    fn sorted(&self, pipeline: PipelineId) -> Vec<Stage> {
        let mut listed: Vec<Stage> = self
            .stages
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.pipeline_id == pipeline)
            .cloned()
            .collect();
        listed.sort_by_key(|s| s.build_order);
        listed
    }
}

#[async_trait]
impl StageRepository for InMemoryStages {
    async fn insert(&self, stage: &Stage) -> Result<Stage> {
        Ok(self.seed(stage.clone()))
    }

    async fn get(&self, pipeline: PipelineId, stage: StageId) -> Result<Option<Stage>> {
        Ok(self.sorted(pipeline).into_iter().find(|s| s.id == stage))
    }

    async fn list(&self, pipeline: PipelineId) -> Result<Vec<Stage>> {
        Ok(self.sorted(pipeline))
    }

    async fn count(&self, pipeline: PipelineId) -> Result<u32> {
        Ok(self.sorted(pipeline).len() as u32)
    }

    async fn update(&self, stage: &Stage) -> Result<()> {
        let mut stages = self.stages.lock().unwrap();
        let existing = stages
            .iter_mut()
            .find(|s| s.id == stage.id)
            .ok_or_else(|| Error::StageNotFound(stage.id.to_string()))?;
        let order = existing.build_order;
        *existing = stage.clone();
        existing.build_order = order;
        Ok(())
    }

    async fn move_to(&self, pipeline: PipelineId, stage: StageId, new_order: u32) -> Result<Stage> {
        let mut stages = self.stages.lock().unwrap();
        let old = stages
            .iter()
            .find(|s| s.id == stage && s.pipeline_id == pipeline)
            .map(|s| s.build_order)
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))?;

        for s in stages.iter_mut().filter(|s| s.pipeline_id == pipeline) {
            if s.id == stage {
                s.build_order = new_order;
            } else if new_order < old && (new_order..old).contains(&s.build_order) {
                s.build_order += 1;
            } else if new_order > old && (old + 1..=new_order).contains(&s.build_order) {
                s.build_order -= 1;
            }
        }

        stages
            .iter()
            .find(|s| s.id == stage)
            .cloned()
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))
    }

    async fn delete(&self, pipeline: PipelineId, stage: StageId) -> Result<()> {
        let mut stages = self.stages.lock().unwrap();
        let order = stages
            .iter()
            .find(|s| s.id == stage && s.pipeline_id == pipeline)
            .map(|s| s.build_order)
            .ok_or_else(|| Error::StageNotFound(stage.to_string()))?;
        stages.retain(|s| s.id != stage);
        for s in stages
            .iter_mut()
            .filter(|s| s.pipeline_id == pipeline && s.build_order > order)
        {
            s.build_order -= 1;
        }
        Ok(())
    }
}

pub struct InMemoryPipelines {
    pipelines: Mutex<HashMap<PipelineId, Pipeline>>,
    arguments: Mutex<HashMap<(ApplicationId, PipelineId), Vec<Parameter>>>,
    stages: Arc<InMemoryStages>,
}

impl InMemoryPipelines {
    pub fn new(stages: Arc<InMemoryStages>) -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            arguments: Mutex::new(HashMap::new()),
            stages,
        }
    }
}

#[async_trait]
impl PipelineRepository for InMemoryPipelines {
    async fn create(&self, pipeline: &Pipeline) -> Result<Pipeline> {
        let mut stored = pipeline.clone();
        stored.stages.clear();
        self.pipelines
            .lock()
            .unwrap()
            .insert(pipeline.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let pipeline = self.pipelines.lock().unwrap().get(&id).cloned();
        Ok(pipeline.map(|mut p| {
            p.stages = self.stages.sorted(id);
            p
        }))
    }

    async fn get_by_name(&self, project: ProjectId, name: &str) -> Result<Option<Pipeline>> {
        let id = self
            .pipelines
            .lock()
            .unwrap()
            .values()
            .find(|p| p.project_id == project && p.name == name)
            .map(|p| p.id);
        match id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn upsert_parameter(&self, id: PipelineId, parameter: &Parameter) -> Result<()> {
        let mut pipelines = self.pipelines.lock().unwrap();
        let pipeline = pipelines
            .get_mut(&id)
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        pipeline.parameters.retain(|p| p.name != parameter.name);
        pipeline.parameters.push(parameter.clone());
        Ok(())
    }

    async fn delete_parameter(&self, id: PipelineId, name: &str) -> Result<()> {
        if let Some(p) = self.pipelines.lock().unwrap().get_mut(&id) {
            p.parameters.retain(|p| p.name != name);
        }
        Ok(())
    }

    async fn application_arguments(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
    ) -> Result<Vec<Parameter>> {
        Ok(self
            .arguments
            .lock()
            .unwrap()
            .get(&(application, pipeline))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_application_arguments(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
        arguments: &[Parameter],
    ) -> Result<()> {
        self.arguments
            .lock()
            .unwrap()
            .insert((application, pipeline), arguments.to_vec());
        Ok(())
    }

    async fn delete(&self, id: PipelineId) -> Result<()> {
        self.pipelines.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryTriggers {
    triggers: Mutex<Vec<Trigger>>,
}

impl InMemoryTriggers {
    /// Add an edge without graph checks.
    pub fn seed(&self, trigger: Trigger) {
        self.triggers.lock().unwrap().push(trigger);
    }

    fn all(&self) -> Vec<Trigger> {
        self.triggers.lock().unwrap().clone()
    }

    fn filtered(&self, keep: impl Fn(&Trigger) -> bool) -> Vec<Trigger> {
        self.all().into_iter().filter(|t| keep(t)).collect()
    }
}

#[async_trait]
impl TriggerRepository for InMemoryTriggers {
    async fn insert(&self, trigger: &Trigger) -> Result<Trigger> {
        trigger.validate()?;
        let mut edges = self.all();
        ensure_acyclic(&mut edges, trigger).await?;
        self.seed(trigger.clone());
        Ok(trigger.clone())
    }

    async fn update(&self, trigger: &Trigger) -> Result<()> {
        trigger.validate()?;
        let mut edges = self.all();
        ensure_acyclic(&mut edges, trigger).await?;
        let mut triggers = self.triggers.lock().unwrap();
        let existing = triggers
            .iter_mut()
            .find(|t| t.id == trigger.id)
            .ok_or_else(|| Error::TriggerNotFound(trigger.id.to_string()))?;
        *existing = trigger.clone();
        Ok(())
    }

    async fn delete(&self, id: TriggerId) -> Result<()> {
        self.triggers.lock().unwrap().retain(|t| t.id != id);
        Ok(())
    }

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>> {
        Ok(self.filtered(|t| t.id == id).pop())
    }

    async fn load_as_source(&self, node: &TriggerNode) -> Result<Vec<Trigger>> {
        Ok(self.filtered(|t| t.src == *node))
    }

    async fn load_automatic_as_source(&self, node: &TriggerNode) -> Result<Vec<Trigger>> {
        Ok(self.filtered(|t| t.src == *node && !t.manual))
    }

    async fn load_by_application(&self, application: ApplicationId) -> Result<Vec<Trigger>> {
        Ok(self.filtered(|t| t.src.application_id == application))
    }

    async fn load_involving(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
        environment: Option<EnvironmentId>,
    ) -> Result<Vec<Trigger>> {
        let touches = |n: &TriggerNode| {
            n.application_id == application
                && n.pipeline_id == pipeline
                && environment.is_none_or(|e| n.environment_id == e)
        };
        Ok(self.filtered(|t| touches(&t.src) || touches(&t.dest)))
    }

    async fn exists(&self, src: &TriggerNode, dest: &TriggerNode) -> Result<bool> {
        Ok(!self.filtered(|t| t.src == *src && t.dest == *dest).is_empty())
    }

    async fn delete_by_pipeline(&self, pipeline: PipelineId) -> Result<u64> {
        let mut triggers = self.triggers.lock().unwrap();
        let before = triggers.len();
        triggers.retain(|t| t.src.pipeline_id != pipeline && t.dest.pipeline_id != pipeline);
        Ok((before - triggers.len()) as u64)
    }

    async fn delete_by_application(&self, application: ApplicationId) -> Result<u64> {
        let mut triggers = self.triggers.lock().unwrap();
        let before = triggers.len();
        triggers.retain(|t| {
            t.src.application_id != application && t.dest.application_id != application
        });
        Ok((before - triggers.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryBuilds {
    builds: Mutex<Vec<(PipelineBuild, Option<DedupKey>)>>,
}

fn same_line(a: &PipelineBuild, b: &PipelineBuild) -> bool {
    a.node() == b.node()
        && a.branch() == b.branch()
        && a.vcs.as_ref().and_then(|v| v.normalized_remote())
            == b.vcs.as_ref().and_then(|v| v.normalized_remote())
}

#[async_trait]
impl BuildRepository for InMemoryBuilds {
    async fn create(&self, build: NewBuild) -> Result<BuildCreation> {
        let mut builds = self.builds.lock().unwrap();

        if let Some(key) = &build.dedup {
            if let Some((existing, _)) = builds.iter().find(|(_, k)| k.as_ref() == Some(key)) {
                return Ok(BuildCreation::Duplicate(existing.id));
            }
        }

        let build_number = builds
            .iter()
            .filter(|(b, _)| b.node() == build.node)
            .map(|(b, _)| b.build_number)
            .max()
            .unwrap_or(0)
            + 1;
        let version = build.requested_version.unwrap_or(build_number);

        let mut parameters = build.parameters;
        parameters.set("cds.buildNumber", build_number.to_string());
        parameters.set("cds.version", version.to_string());
        let vcs = build.vcs.map(|mut v| {
            if v.remote.as_deref() == Some("") {
                v.remote = None;
            }
            v
        });
        if let Some(v) = &vcs {
            let previous = builds
                .iter()
                .filter(|(b, _)| b.node() == build.node && b.branch() == Some(v.branch.as_str()))
                .max_by_key(|(b, _)| b.build_number)
                .and_then(|(b, _)| b.vcs.as_ref().map(|p| p.hash.clone()));
            if let Some(hash) = previous {
                parameters.set("git.previousHash", hash);
            }
        }

        let now = Utc::now();
        let created = PipelineBuild {
            id: build.id,
            application_id: build.node.application_id,
            pipeline_id: build.node.pipeline_id,
            environment_id: build.node.environment_id,
            build_number,
            version,
            status: build.status,
            stages: build.stages,
            parameters,
            vcs,
            origin: build.origin,
            created_at: now,
            done_at: build.status.is_terminal().then_some(now),
        };
        builds.push((created.clone(), build.dedup));
        Ok(BuildCreation::Created(created))
    }

    async fn get(&self, id: BuildId) -> Result<Option<PipelineBuild>> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .iter()
            .find(|(b, _)| b.id == id)
            .map(|(b, _)| b.clone()))
    }

    async fn get_by_number(&self, node: &TriggerNode, number: i64) -> Result<Option<PipelineBuild>> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .iter()
            .find(|(b, _)| b.node() == *node && b.build_number == number)
            .map(|(b, _)| b.clone()))
    }

    async fn last_build_number(&self, node: &TriggerNode) -> Result<i64> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| b.node() == *node)
            .map(|(b, _)| b.build_number)
            .max()
            .unwrap_or(0))
    }

    async fn save(&self, build: &PipelineBuild) -> Result<()> {
        let mut builds = self.builds.lock().unwrap();
        let (stored, _) = builds
            .iter_mut()
            .find(|(b, _)| b.id == build.id)
            .ok_or_else(|| Error::BuildNotFound(build.id.to_string()))?;
        stored.status = build.status;
        stored.stages = build.stages.clone();
        stored.done_at = build.done_at;
        Ok(())
    }

    async fn previous(&self, build: &PipelineBuild) -> Result<Option<PipelineBuild>> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| same_line(b, build) && b.build_number < build.build_number)
            .max_by_key(|(b, _)| b.build_number)
            .map(|(b, _)| b.clone()))
    }

    async fn find_duplicate(&self, key: &DedupKey) -> Result<Option<BuildId>> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .iter()
            .find(|(_, k)| k.as_ref() == Some(key))
            .map(|(b, _)| b.id))
    }

    async fn children(&self, parent: BuildId) -> Result<Vec<PipelineBuild>> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| b.parent_build_id() == Some(parent))
            .map(|(b, _)| b.clone())
            .collect())
    }

    async fn list(
        &self,
        node: &TriggerNode,
        status: Option<BuildStatus>,
        limit: u32,
    ) -> Result<Vec<PipelineBuild>> {
        let mut listed: Vec<PipelineBuild> = self
            .builds
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| b.node() == *node && status.is_none_or(|s| b.status == s))
            .map(|(b, _)| b.clone())
            .collect();
        listed.sort_by_key(|b| std::cmp::Reverse(b.build_number));
        listed.truncate(limit as usize);
        Ok(listed)
    }

    async fn delete(&self, id: BuildId) -> Result<()> {
        self.builds.lock().unwrap().retain(|(b, _)| b.id != id);
        Ok(())
    }

    async fn delete_branch(&self, application: ApplicationId, branch: &str) -> Result<u64> {
        let mut builds = self.builds.lock().unwrap();
        let before = builds.len();
        builds.retain(|(b, _)| !(b.application_id == application && b.branch() == Some(branch)));
        Ok((before - builds.len()) as u64)
    }

    async fn delete_by_application(&self, application: ApplicationId) -> Result<u64> {
        let mut builds = self.builds.lock().unwrap();
        let before = builds.len();
        builds.retain(|(b, _)| b.application_id != application);
        Ok((before - builds.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryJobs {
    jobs: Mutex<Vec<PipelineBuildJob>>,
    logs: Mutex<Vec<BuildLog>>,
}

impl InMemoryJobs {
    /// Pretend the job started `started_ago` ago, optionally with a log
    /// line written `last_log_ago` ago.
    pub fn backdate(
        &self,
        id: BuildJobId,
        started_ago: chrono::Duration,
        last_log_ago: Option<chrono::Duration>,
    ) {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.iter_mut().find(|j| j.id == id).unwrap();
        job.started_at = Some(now - started_ago);
        if let Some(ago) = last_log_ago {
            let mut line = BuildLog::new(job, "Running");
            line.timestamp = now - ago;
            self.logs.lock().unwrap().push(line);
        }
    }

    pub fn for_build(&self, build: BuildId) -> Vec<PipelineBuildJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.build_id == build)
            .cloned()
            .collect()
    }

    fn is_stale(&self, job: &PipelineBuildJob, cutoff: DateTime<Utc>) -> bool {
        let started_early = job.started_at.is_some_and(|s| s < cutoff);
        let last_log = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.build_job_id == job.id)
            .map(|l| l.timestamp)
            .max();
        job.status == BuildStatus::Building && started_early && last_log.is_none_or(|t| t < cutoff)
    }

    fn with_job<T>(
        &self,
        id: BuildJobId,
        f: impl FnOnce(&mut PipelineBuildJob) -> Result<T>,
    ) -> Result<T> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| Error::BuildJobNotFound(id.to_string()))?;
        f(job)
    }
}

#[async_trait]
impl BuildJobRepository for InMemoryJobs {
    async fn insert(&self, job: &PipelineBuildJob) -> Result<()> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn get(&self, id: BuildJobId) -> Result<Option<PipelineBuildJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn list_for_build(&self, build: BuildId) -> Result<Vec<PipelineBuildJob>> {
        Ok(self.for_build(build))
    }

    async fn take(&self, id: BuildJobId, worker: WorkerId) -> Result<PipelineBuildJob> {
        self.with_job(id, |job| {
            if job.status != BuildStatus::Waiting {
                return Err(Error::AlreadyTaken(id.to_string()));
            }
            job.status = BuildStatus::Building;
            job.worker_id = Some(worker);
            job.started_at = Some(Utc::now());
            Ok(job.clone())
        })
    }

    async fn update_status(&self, id: BuildJobId, status: BuildStatus) -> Result<JobTransition> {
        self.with_job(id, |job| {
            if !job_transition_allowed(job.status, status) {
                return Ok(JobTransition::Ignored(job.clone()));
            }
            job.status = status;
            if status == BuildStatus::Building {
                job.started_at = Some(Utc::now());
            }
            if status.is_terminal() {
                job.done_at = Some(Utc::now());
            }
            Ok(JobTransition::Applied(job.clone()))
        })
    }

    async fn restart(&self, id: BuildJobId) -> Result<()> {
        self.with_job(id, |job| {
            job.status = BuildStatus::Waiting;
            job.worker_id = None;
            job.started_at = None;
            job.done_at = None;
            Ok(())
        })?;
        self.logs.lock().unwrap().retain(|l| l.build_job_id != id);
        Ok(())
    }

    async fn stop_build(&self, build: BuildId) -> Result<u64> {
        let mut stopped = 0;
        for job in self
            .jobs
            .lock()
            .unwrap()
            .iter_mut()
            .filter(|j| j.build_id == build && !j.status.is_terminal())
        {
            job.status = BuildStatus::Fail;
            job.done_at = Some(Utc::now());
            stopped += 1;
        }
        Ok(stopped)
    }

    async fn append_log(&self, log: &BuildLog) -> Result<()> {
        self.logs.lock().unwrap().push(log.clone());
        Ok(())
    }

    async fn logs(&self, id: BuildJobId) -> Result<Vec<BuildLog>> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.build_job_id == id)
            .cloned()
            .collect())
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<PipelineBuildJob>> {
        let jobs = self.jobs.lock().unwrap().clone();
        Ok(jobs
            .into_iter()
            .filter(|j| self.is_stale(j, cutoff))
            .collect())
    }

    async fn kill_stale(
        &self,
        id: BuildJobId,
        reason: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<PipelineBuildJob>> {
        let Some(job) = self.get(id).await? else {
            return Ok(None);
        };
        if !self.is_stale(&job, cutoff) {
            return Ok(None);
        }
        self.append_log(&BuildLog::new(&job, reason)).await?;
        let killed = self.with_job(id, |job| {
            job.status = BuildStatus::Fail;
            job.done_at = Some(Utc::now());
            Ok(job.clone())
        })?;
        Ok(Some(killed))
    }
}

#[derive(Default)]
pub struct InMemoryLeases {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLeases {
    /// Hand the lease to another owner for an hour.
    pub fn hold(&self, name: &str, owner: &str) {
        self.leases.lock().unwrap().insert(
            name.to_string(),
            (owner.to_string(), Instant::now() + Duration::from_secs(3600)),
        );
    }
}

#[async_trait]
impl LeaseRepository for InMemoryLeases {
    async fn try_claim(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();
        match leases.get(name) {
            Some((holder, expires)) if holder != owner && *expires > now => Ok(false),
            _ => {
                leases.insert(name.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        if leases.get(name).is_some_and(|(holder, _)| holder == owner) {
            leases.remove(name);
        }
        Ok(())
    }
}

/// A finished build that was never persisted.
pub fn sample_build() -> PipelineBuild {
    PipelineBuild {
        id: BuildId::new(),
        application_id: ApplicationId::new(),
        pipeline_id: PipelineId::new(),
        environment_id: EnvironmentId::NONE,
        build_number: 1,
        version: 1,
        status: BuildStatus::Success,
        stages: vec![],
        parameters: Default::default(),
        vcs: None,
        origin: BuildOrigin::Scheduled,
        created_at: Utc::now(),
        done_at: Some(Utc::now()),
    }
}

/// Fakes wired to a lifecycle manager, with the event queue kept for
/// inspection.
pub struct Harness {
    pub catalog: Arc<InMemoryCatalog>,
    pub pipelines: Arc<InMemoryPipelines>,
    pub stages: Arc<InMemoryStages>,
    pub triggers: Arc<InMemoryTriggers>,
    pub builds: Arc<InMemoryBuilds>,
    pub jobs: Arc<InMemoryJobs>,
    pub leases: Arc<InMemoryLeases>,
    pub lifecycle: Arc<BuildLifecycleManager>,
    pub config: SchedulerConfig,
    events: EventPublisher,
    queue: Mutex<EventDispatcher>,
    project: ProjectId,
}

impl Harness {
    pub fn new() -> Self {
        let stages = Arc::new(InMemoryStages::default());
        let catalog = Arc::new(InMemoryCatalog::default());
        catalog.add_environment(Environment::none());
        let pipelines = Arc::new(InMemoryPipelines::new(stages.clone()));
        let triggers = Arc::new(InMemoryTriggers::default());
        let builds = Arc::new(InMemoryBuilds::default());
        let jobs = Arc::new(InMemoryJobs::default());
        let leases = Arc::new(InMemoryLeases::default());
        let config = SchedulerConfig {
            instance_id: INSTANCE.to_string(),
            ..Default::default()
        };

        let ports = SchedulerPorts {
            catalog: catalog.clone(),
            pipelines: pipelines.clone(),
            stages: stages.clone(),
            triggers: triggers.clone(),
            builds: builds.clone(),
            jobs: jobs.clone(),
            leases: leases.clone(),
        };
        let (events, queue) = event_channel(
            Arc::new(InProcessEventBus::default()),
            config.event_buffer,
        );
        let lifecycle = Arc::new(BuildLifecycleManager::new(
            &ports,
            events.clone(),
            config.history_retention,
            INSTANCE,
        ));

        Self {
            catalog,
            pipelines,
            stages,
            triggers,
            builds,
            jobs,
            leases,
            lifecycle,
            config,
            events,
            queue: Mutex::new(queue),
            project: ProjectId::new(),
        }
    }

    pub fn ports(&self) -> SchedulerPorts {
        SchedulerPorts {
            catalog: self.catalog.clone(),
            pipelines: self.pipelines.clone(),
            stages: self.stages.clone(),
            triggers: self.triggers.clone(),
            builds: self.builds.clone(),
            jobs: self.jobs.clone(),
            leases: self.leases.clone(),
        }
    }

    /// A new application running a pipeline whose stages each hold one job.
    pub fn seed_pipeline(&self, pipeline_type: PipelineType, stages: &[&str]) -> TriggerNode {
        self.seed_pipeline_with(pipeline_type, |pipeline| {
            stages
                .iter()
                .map(|name| Stage::new(pipeline, *name).with_job(Job::new("run")))
                .collect()
        })
    }

    pub fn seed_pipeline_with(
        &self,
        pipeline_type: PipelineType,
        stages: impl FnOnce(PipelineId) -> Vec<Stage>,
    ) -> TriggerNode {
        let application = Application {
            id: ApplicationId::new(),
            project_id: self.project,
            name: "app".to_string(),
            repository_fullname: Some("acme/app".to_string()),
        };
        self.catalog.add_application(application.clone());

        let environment = if pipeline_type == PipelineType::Build {
            EnvironmentId::NONE
        } else {
            let env = Environment {
                id: EnvironmentId::new(),
                project_id: Some(self.project),
                name: "production".to_string(),
            };
            self.catalog.add_environment(env.clone());
            env.id
        };

        let pipeline = Pipeline::new(self.project, "pipeline", pipeline_type);
        self.pipelines
            .pipelines
            .lock()
            .unwrap()
            .insert(pipeline.id, pipeline.clone());
        for stage in stages(pipeline.id) {
            self.stages.seed(stage);
        }

        TriggerNode::new(application.id, pipeline.id, environment)
    }

    pub fn jobs_for(&self, build: BuildId) -> Vec<PipelineBuildJob> {
        self.jobs.for_build(build)
    }

    /// Events queued since the last call.
    pub fn drain_events(&self) -> Vec<Event> {
        self.queue.lock().unwrap().drain_queued()
    }

    pub fn cascade(&self) -> TriggerCascade {
        TriggerCascade::new(
            &self.ports(),
            self.lifecycle.clone(),
            self.events.clone(),
            self.config.cascade_lease(),
            INSTANCE,
        )
    }

    pub fn reconciler(&self) -> StaleJobReconciler {
        StaleJobReconciler::new(
            &self.ports(),
            self.lifecycle.clone(),
            self.events.clone(),
            self.config.reconcile_interval(),
            self.config.stale_after(),
            INSTANCE,
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::with_publisher(self.ports(), self.events.clone(), &self.config)
    }

    /// Run every queued job of the build to success until it finishes.
    pub async fn finish_build(&self, id: BuildId) -> PipelineBuild {
        for _ in 0..100 {
            let build = self.builds.get(id).await.unwrap().unwrap();
            if build.status.is_terminal() {
                return build;
            }
            for job in self
                .jobs_for(id)
                .into_iter()
                .filter(|j| j.status == BuildStatus::Waiting)
            {
                self.lifecycle
                    .take_job(job.id, WorkerId::new())
                    .await
                    .unwrap();
                self.lifecycle
                    .report_job_status(job.id, BuildStatus::Success)
                    .await
                    .unwrap();
            }
        }
        panic!("build {id} did not finish");
    }
}
