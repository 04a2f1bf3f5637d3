//! Triggers: directed edges between (application, pipeline, environment) nodes.

use crate::ids::*;
use crate::parameter::Parameter;
use crate::prerequisite::Prerequisite;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One endpoint of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct TriggerNode {
    pub application_id: ApplicationId,
    pub pipeline_id: PipelineId,
    pub environment_id: EnvironmentId,
}

impl TriggerNode {
    pub fn new(
        application_id: ApplicationId,
        pipeline_id: PipelineId,
        environment_id: EnvironmentId,
    ) -> Self {
        Self {
            application_id,
            pipeline_id,
            environment_id,
        }
    }
}

impl fmt::Display for TriggerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.application_id, self.pipeline_id, self.environment_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Trigger {
    pub id: TriggerId,
    pub src: TriggerNode,
    pub dest: TriggerNode,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
}

impl Trigger {
    pub fn new(src: TriggerNode, dest: TriggerNode) -> Self {
        Self {
            id: TriggerId::new(),
            src,
            dest,
            manual: false,
            parameters: vec![],
            prerequisites: vec![],
        }
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_prerequisite(mut self, prerequisite: Prerequisite) -> Self {
        self.prerequisites.push(prerequisite);
        self
    }

    /// Whether the trigger touches `node` on either end.
    pub fn involves(&self, node: &TriggerNode) -> bool {
        self.src == *node || self.dest == *node
    }

    /// Checks that do not need the rest of the graph.
    pub fn validate(&self) -> Result<()> {
        if self.src == self.dest {
            return Err(Error::InfiniteTriggerLoop(format!(
                "{} triggers itself",
                self.src
            )));
        }
        if let Some(p) = self.parameters.iter().find(|p| p.is_secret()) {
            return Err(Error::SecretNotAllowed(p.name.clone()));
        }
        for p in &self.prerequisites {
            p.validate()?;
        }
        Ok(())
    }
}

/// An outgoing edge in a materialized descendant tree.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerBranch {
    pub trigger_id: TriggerId,
    pub manual: bool,
    pub parameters: Vec<Parameter>,
    pub prerequisites: Vec<Prerequisite>,
    pub subtree: TriggerTree,
}

/// Every descendant reachable from `node`. A node reachable along several
/// paths appears once per path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerTree {
    pub node: TriggerNode,
    pub children: Vec<TriggerBranch>,
}

impl TriggerTree {
    pub fn leaf(node: TriggerNode) -> Self {
        Self {
            node,
            children: vec![],
        }
    }

    /// Number of nodes in the tree, root included.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(|c| c.subtree.size()).sum::<usize>()
    }

    pub fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|c| c.subtree.depth())
            .max()
            .unwrap_or(0)
    }
}
