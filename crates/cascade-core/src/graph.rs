//! Trigger graph traversal: cycle detection and descendant trees.
//!
//! Edges are loaded lazily through [`TriggerEdges`], so the same traversal
//! runs inside a database transaction or over an in-memory edge list.

use crate::trigger::{Trigger, TriggerBranch, TriggerNode, TriggerTree};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;

/// Source of outgoing edges for the traversal.
#[async_trait]
pub trait TriggerEdges: Send {
    /// Triggers whose source is `node`.
    async fn outgoing(&mut self, node: &TriggerNode) -> Result<Vec<Trigger>>;
}

#[async_trait]
impl TriggerEdges for Vec<Trigger> {
    async fn outgoing(&mut self, node: &TriggerNode) -> Result<Vec<Trigger>> {
        Ok(self.iter().filter(|t| t.src == *node).cloned().collect())
    }
}

/// Fail with [`Error::InfiniteTriggerLoop`] if adding `candidate` would close
/// a cycle.
///
/// Walks forward from the candidate's destination carrying the ancestor path,
/// which starts with the candidate's source. Reaching any node already on the
/// path is a loop. An existing edge with the candidate's id is ignored so an
/// update is checked against its new endpoints only.
pub async fn ensure_acyclic<E>(edges: &mut E, candidate: &Trigger) -> Result<()>
where
    E: TriggerEdges + ?Sized,
{
    if candidate.src == candidate.dest {
        return Err(loop_error(candidate, &candidate.src));
    }

    let mut stack: Vec<(TriggerNode, Vec<TriggerNode>)> =
        vec![(candidate.dest, vec![candidate.src])];

    while let Some((node, ancestors)) = stack.pop() {
        if ancestors.contains(&node) {
            return Err(loop_error(candidate, &node));
        }

        let children = edges.outgoing(&node).await?;
        let mut path = ancestors;
        path.push(node);

        for child in children.into_iter().filter(|t| t.id != candidate.id) {
            stack.push((child.dest, path.clone()));
        }
    }

    Ok(())
}

fn loop_error(candidate: &Trigger, revisited: &TriggerNode) -> Error {
    Error::InfiniteTriggerLoop(format!(
        "{} -> {} reaches {} again",
        candidate.src, candidate.dest, revisited
    ))
}

/// Materialize every descendant of `root`.
pub async fn descendant_tree<E>(edges: &mut E, root: TriggerNode) -> Result<TriggerTree>
where
    E: TriggerEdges + ?Sized,
{
    subtree(edges, root, Vec::new()).await
}

fn subtree<'a, E>(
    edges: &'a mut E,
    node: TriggerNode,
    mut path: Vec<TriggerNode>,
) -> BoxFuture<'a, Result<TriggerTree>>
where
    E: TriggerEdges + ?Sized + 'a,
{
    Box::pin(async move {
        if path.contains(&node) {
            return Err(Error::InfiniteTriggerLoop(format!(
                "{} is its own descendant",
                node
            )));
        }
        path.push(node);

        let mut children = Vec::new();
        for trigger in edges.outgoing(&node).await? {
            let child = subtree(&mut *edges, trigger.dest, path.clone()).await?;
            children.push(TriggerBranch {
                trigger_id: trigger.id,
                manual: trigger.manual,
                parameters: trigger.parameters,
                prerequisites: trigger.prerequisites,
                subtree: child,
            });
        }

        Ok(TriggerTree { node, children })
    })
}
