//! Pipelines, their stages and the catalog entries builds run against.

use crate::ids::*;
use crate::parameter::Parameter;
use crate::prerequisite::Prerequisite;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of pipeline. Build pipelines run without an environment; the others
/// target one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    #[default]
    Build,
    Deployment,
    Testing,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::Build => "build",
            PipelineType::Deployment => "deployment",
            PipelineType::Testing => "testing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "build" => Some(PipelineType::Build),
            "deployment" => Some(PipelineType::Deployment),
            "testing" => Some(PipelineType::Testing),
            _ => None,
        }
    }

    /// Whether the pipeline may run on the given environment.
    pub fn accepts(&self, environment: EnvironmentId) -> bool {
        match self {
            PipelineType::Build => environment.is_none(),
            PipelineType::Deployment | PipelineType::Testing => !environment.is_none(),
        }
    }
}

/// A job definition inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            enabled: true,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A stage of a pipeline. `build_order` is 1-based and dense within the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Stage {
    pub id: StageId,
    pub pipeline_id: PipelineId,
    pub name: String,
    pub build_order: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
}

impl Stage {
    /// A new stage; its order is assigned on insert.
    pub fn new(pipeline_id: PipelineId, name: impl Into<String>) -> Self {
        Self {
            id: StageId::new(),
            pipeline_id,
            name: name.into(),
            build_order: 0,
            enabled: true,
            jobs: vec![],
            prerequisites: vec![],
        }
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_prerequisite(mut self, prerequisite: Prerequisite) -> Self {
        self.prerequisites.push(prerequisite);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidStage("name must not be empty".to_string()));
        }
        for p in &self.prerequisites {
            p.validate()?;
        }
        Ok(())
    }
}

/// A pipeline with its stages (ordered by `build_order`) and default parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub id: PipelineId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(rename = "type")]
    pub pipeline_type: PipelineType,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(project_id: ProjectId, name: impl Into<String>, pipeline_type: PipelineType) -> Self {
        Self {
            id: PipelineId::new(),
            project_id,
            name: name.into(),
            pipeline_type,
            parameters: vec![],
            stages: vec![],
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    pub id: ProjectId,
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Application {
    pub id: ApplicationId,
    pub project_id: ProjectId,
    pub name: String,
    /// Repository full name (`owner/repo`) when the application is linked to VCS.
    pub repository_fullname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Environment {
    pub id: EnvironmentId,
    pub project_id: Option<ProjectId>,
    pub name: String,
}

impl Environment {
    /// Name of the "no environment" sentinel row.
    pub const NONE_NAME: &'static str = "NoEnv";

    pub fn none() -> Self {
        Self {
            id: EnvironmentId::NONE,
            project_id: None,
            name: Self::NONE_NAME.to_string(),
        }
    }
}
