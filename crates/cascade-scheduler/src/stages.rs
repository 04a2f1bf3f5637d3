//! Stage ordering within a pipeline.

use cascade_core::ids::{PipelineId, StageId};
use cascade_core::pipeline::Stage;
use cascade_core::ports::StageRepository;
use cascade_core::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Keeps each pipeline's stages numbered 1..N without gaps.
#[derive(Clone)]
pub struct StageOrderManager {
    stages: Arc<dyn StageRepository>,
}

impl StageOrderManager {
    pub fn new(stages: Arc<dyn StageRepository>) -> Self {
        Self { stages }
    }

    /// Append a stage after the last one.
    pub async fn insert_stage(&self, stage: &Stage) -> Result<Stage> {
        stage.validate()?;
        let inserted = self.stages.insert(stage).await?;
        info!(
            pipeline_id = %inserted.pipeline_id,
            stage_id = %inserted.id,
            build_order = inserted.build_order,
            "Stage inserted"
        );
        Ok(inserted)
    }

    pub async fn update_stage(&self, stage: &Stage) -> Result<()> {
        stage.validate()?;
        self.stages.update(stage).await
    }

    pub async fn move_stage(
        &self,
        pipeline: PipelineId,
        stage: StageId,
        new_order: u32,
    ) -> Result<Stage> {
        let count = self.stages.count(pipeline).await?;
        if new_order == 0 || new_order > count {
            return Err(Error::InvalidStageOrder {
                requested: new_order,
                count,
            });
        }

        let moved = self.stages.move_to(pipeline, stage, new_order).await?;
        info!(pipeline_id = %pipeline, stage_id = %stage, build_order = new_order, "Stage moved");
        Ok(moved)
    }

    pub async fn delete_stage(&self, pipeline: PipelineId, stage: StageId) -> Result<()> {
        self.stages.delete(pipeline, stage).await?;
        info!(pipeline_id = %pipeline, stage_id = %stage, "Stage deleted");
        Ok(())
    }

    pub async fn list(&self, pipeline: PipelineId) -> Result<Vec<Stage>> {
        self.stages.list(pipeline).await
    }
}
