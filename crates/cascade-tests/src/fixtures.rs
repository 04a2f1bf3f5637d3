//! Test fixtures for creating sample data.

use cascade_core::ids::{ApplicationId, EnvironmentId, ProjectId};
use cascade_core::pipeline::{Application, Environment, Job, Pipeline, PipelineType, Project, Stage};
use cascade_core::ports::PipelineRepository;
use cascade_core::trigger::TriggerNode;
use cascade_core::vcs::{VcsInfo, VcsPush};
use cascade_db::Repositories;

/// A project registered in the catalog, with one application linked to a
/// repository. Every seed uses fresh keys so tests can share a database.
pub struct CatalogFixture {
    pub project: Project,
    pub application: Application,
    repos: Repositories,
}

impl CatalogFixture {
    pub async fn seed(repos: &Repositories) -> anyhow::Result<Self> {
        let id = ProjectId::new();
        let project = Project {
            id,
            key: format!("proj-{}", id),
            name: "Test project".to_string(),
        };
        repos.catalog.register_project(&project).await?;

        let application = register_application(repos, id, "api", Some("acme/api")).await?;
        Ok(Self {
            project,
            application,
            repos: repos.clone(),
        })
    }

    pub async fn add_application(
        &self,
        name: &str,
        repository: Option<&str>,
    ) -> anyhow::Result<Application> {
        register_application(&self.repos, self.project.id, name, repository).await
    }

    pub async fn add_environment(&self, name: &str) -> anyhow::Result<Environment> {
        let environment = Environment {
            id: EnvironmentId::new(),
            project_id: Some(self.project.id),
            name: name.to_string(),
        };
        self.repos.catalog.register_environment(&environment).await?;
        Ok(environment)
    }

    /// Create a pipeline with one `run` job per named stage.
    pub async fn pipeline(
        &self,
        name: &str,
        pipeline_type: PipelineType,
        stages: &[&str],
    ) -> anyhow::Result<Pipeline> {
        let mut pipeline = Pipeline::new(self.project.id, name, pipeline_type);
        pipeline.stages = stages
            .iter()
            .map(|s| Stage::new(pipeline.id, *s).with_job(Job::new("run")))
            .collect();
        Ok(self.repos.pipelines.create(&pipeline).await?)
    }

    /// Node of a build pipeline on the seeded application.
    pub fn build_node(&self, pipeline: &Pipeline) -> TriggerNode {
        TriggerNode::new(self.application.id, pipeline.id, EnvironmentId::NONE)
    }

    /// A push on the seeded application's own repository.
    pub fn push(&self, branch: &str, hash: &str, message: &str) -> VcsPush {
        VcsPush {
            repository: self
                .application
                .repository_fullname
                .clone()
                .unwrap_or_default(),
            branch: branch.to_string(),
            hash: hash.to_string(),
            message: message.to_string(),
            author: "tester".to_string(),
        }
    }
}

async fn register_application(
    repos: &Repositories,
    project_id: ProjectId,
    name: &str,
    repository: Option<&str>,
) -> anyhow::Result<Application> {
    let application = Application {
        id: ApplicationId::new(),
        project_id,
        name: name.to_string(),
        repository_fullname: repository.map(str::to_string),
    };
    repos.catalog.register_application(&application).await?;
    Ok(application)
}

/// Commit metadata on `branch`.
pub fn commit(branch: &str, hash: &str) -> VcsInfo {
    VcsInfo {
        author: "tester".to_string(),
        message: "update".to_string(),
        ..VcsInfo::new(branch, hash)
    }
}
