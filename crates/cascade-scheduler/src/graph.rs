//! Trigger graph management.

use async_trait::async_trait;
use cascade_core::graph::{TriggerEdges, descendant_tree};
use cascade_core::ids::{ApplicationId, EnvironmentId, PipelineId, TriggerId};
use cascade_core::ports::TriggerRepository;
use cascade_core::trigger::{Trigger, TriggerNode, TriggerTree};
use cascade_core::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Reads edges straight from the repository.
struct RepositoryEdges<'a> {
    repo: &'a dyn TriggerRepository,
}

#[async_trait]
impl<'a> TriggerEdges for RepositoryEdges<'a> {
    async fn outgoing(&mut self, node: &TriggerNode) -> Result<Vec<Trigger>> {
        self.repo.load_as_source(node).await
    }
}

/// Owns the edges between (application, pipeline, environment) nodes.
///
/// Acyclicity is enforced by the repository inside the write transaction;
/// this layer adds logging and the read-side traversals.
#[derive(Clone)]
pub struct TriggerGraphManager {
    triggers: Arc<dyn TriggerRepository>,
}

impl TriggerGraphManager {
    pub fn new(triggers: Arc<dyn TriggerRepository>) -> Self {
        Self { triggers }
    }

    pub async fn insert_trigger(&self, trigger: &Trigger) -> Result<Trigger> {
        let inserted = self.triggers.insert(trigger).await?;
        info!(
            trigger_id = %inserted.id,
            src = %inserted.src,
            dest = %inserted.dest,
            manual = inserted.manual,
            "Trigger inserted"
        );
        Ok(inserted)
    }

    pub async fn update_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.triggers.update(trigger).await?;
        info!(trigger_id = %trigger.id, src = %trigger.src, dest = %trigger.dest, "Trigger updated");
        Ok(())
    }

    pub async fn delete_trigger(&self, id: TriggerId) -> Result<()> {
        self.triggers.delete(id).await?;
        info!(trigger_id = %id, "Trigger deleted");
        Ok(())
    }

    pub async fn get(&self, id: TriggerId) -> Result<Trigger> {
        self.triggers
            .get(id)
            .await?
            .ok_or_else(|| Error::TriggerNotFound(id.to_string()))
    }

    pub async fn load_as_source(&self, node: &TriggerNode) -> Result<Vec<Trigger>> {
        self.triggers.load_as_source(node).await
    }

    pub async fn load_by_application(&self, application: ApplicationId) -> Result<Vec<Trigger>> {
        self.triggers.load_by_application(application).await
    }

    pub async fn load_involving(
        &self,
        application: ApplicationId,
        pipeline: PipelineId,
        environment: Option<EnvironmentId>,
    ) -> Result<Vec<Trigger>> {
        self.triggers
            .load_involving(application, pipeline, environment)
            .await
    }

    /// Every node reachable from `root`, one tree node per path.
    pub async fn descendant_tree(&self, root: TriggerNode) -> Result<TriggerTree> {
        let mut edges = RepositoryEdges {
            repo: self.triggers.as_ref(),
        };
        descendant_tree(&mut edges, root).await
    }

    /// Remove every trigger touching the application on either end.
    pub async fn delete_by_application(&self, application: ApplicationId) -> Result<u64> {
        let deleted = self.triggers.delete_by_application(application).await?;
        info!(application_id = %application, deleted, "Application triggers deleted");
        Ok(deleted)
    }
}
