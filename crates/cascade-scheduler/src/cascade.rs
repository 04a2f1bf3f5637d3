//! Automatic trigger cascade: successful builds start their downstream nodes.

use cascade_core::Result;
use cascade_core::build::{BuildOrigin, BuildOutcome, BuildStatus, PipelineBuild};
use cascade_core::events::{Event, TriggerFiredPayload};
use cascade_core::parameter::{Parameter, ParameterBag};
use cascade_core::ports::{BuildRepository, LeaseRepository, TriggerRepository};
use cascade_core::prerequisite;
use cascade_core::template::process_trigger_parameters;
use cascade_core::trigger::{Trigger, TriggerNode};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatcher::EventPublisher;
use crate::lifecycle::{BuildLifecycleManager, BuildRequest, guard_owner};
use crate::scheduler::SchedulerPorts;

/// Parameters describing the upstream build, added to every child.
fn parent_parameters(parent: &PipelineBuild) -> Vec<Parameter> {
    let mut params = vec![Parameter::new(
        "cds.parent.buildNumber",
        parent.build_number.to_string(),
    )];
    for (name, source) in [
        ("cds.parent.application", "cds.application"),
        ("cds.parent.pipeline", "cds.pipeline"),
    ] {
        if let Some(value) = parent.parameters.get(source) {
            params.push(Parameter::new(name, value));
        }
    }
    params
}

/// Fires the automatic triggers of successful builds.
pub struct TriggerCascade {
    triggers: Arc<dyn TriggerRepository>,
    builds: Arc<dyn BuildRepository>,
    leases: Arc<dyn LeaseRepository>,
    lifecycle: Arc<BuildLifecycleManager>,
    events: EventPublisher,
    lease_ttl: Duration,
    instance_id: String,
}

impl TriggerCascade {
    pub fn new(
        ports: &SchedulerPorts,
        lifecycle: Arc<BuildLifecycleManager>,
        events: EventPublisher,
        lease_ttl: Duration,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            triggers: ports.triggers.clone(),
            builds: ports.builds.clone(),
            leases: ports.leases.clone(),
            lifecycle,
            events,
            lease_ttl,
            instance_id: instance_id.into(),
        }
    }

    /// Create the child builds of a successful build.
    ///
    /// Returns the builds created by this pass. A pass already held by
    /// another replica, or a parent that did not succeed, yields nothing.
    pub async fn on_build_success(&self, parent: &PipelineBuild) -> Result<Vec<PipelineBuild>> {
        if parent.status != BuildStatus::Success {
            return Ok(vec![]);
        }

        let lease = format!("cascade:{}", parent.id);
        let owner = guard_owner(&self.instance_id);
        if !self
            .leases
            .try_claim(&lease, &owner, self.lease_ttl)
            .await?
        {
            debug!(build_id = %parent.id, "Cascade already running elsewhere");
            return Ok(vec![]);
        }

        let result = self.fire(parent).await;
        if let Err(e) = self.leases.release(&lease, &owner).await {
            warn!(build_id = %parent.id, error = %e, "Failed to release cascade lease");
        }
        result
    }

    async fn fire(&self, parent: &PipelineBuild) -> Result<Vec<PipelineBuild>> {
        let triggers = self
            .triggers
            .load_automatic_as_source(&parent.node())
            .await?;
        if triggers.is_empty() {
            return Ok(vec![]);
        }

        // Children from runs before a restart do not count; those were
        // created before the parent's current completion time.
        let existing: HashSet<TriggerNode> = self
            .builds
            .children(parent.id)
            .await?
            .iter()
            .filter(|child| parent.done_at.is_none_or(|done| child.created_at >= done))
            .map(PipelineBuild::node)
            .collect();

        let mut created = Vec::new();
        for trigger in triggers {
            if existing.contains(&trigger.dest) {
                debug!(trigger_id = %trigger.id, dest = %trigger.dest, "Child build already exists");
                continue;
            }
            if let Some(child) = self.fire_one(parent, &trigger).await {
                created.push(child);
            }
        }

        info!(build_id = %parent.id, children = created.len(), "Cascade complete");
        Ok(created)
    }

    async fn fire_one(&self, parent: &PipelineBuild, trigger: &Trigger) -> Option<PipelineBuild> {
        let mut parameters = process_trigger_parameters(&trigger.parameters, &parent.parameters);
        parameters.extend(parent_parameters(parent));

        let mut bag: ParameterBag = parent.parameters.clone();
        bag.extend(parameters.iter().cloned());
        match prerequisite::evaluate(&trigger.prerequisites, &bag) {
            Ok(true) => {}
            Ok(false) => {
                info!(trigger_id = %trigger.id, dest = %trigger.dest, "Trigger prerequisites not met");
                return None;
            }
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "Unusable trigger prerequisite");
                return None;
            }
        }

        let vcs = if trigger.dest.application_id == parent.application_id {
            parent.vcs.clone()
        } else {
            None
        };

        let request = BuildRequest {
            node: trigger.dest,
            parameters,
            vcs,
            origin: BuildOrigin::Upstream {
                parent_build_id: parent.id,
                trigger_id: trigger.id,
            },
            requested_version: Some(parent.version),
            parent_application: Some(parent.application_id),
        };

        match self.lifecycle.create_build(request).await {
            Ok(BuildOutcome::Created(child)) => {
                self.events.emit(Event::TriggerFired(TriggerFiredPayload {
                    trigger_id: trigger.id,
                    parent_build_id: parent.id,
                    child_build_id: child.id,
                    fired_at: Utc::now(),
                }));
                info!(
                    trigger_id = %trigger.id,
                    parent_build_id = %parent.id,
                    child_build_id = %child.id,
                    "Trigger fired"
                );
                Some(child)
            }
            Ok(BuildOutcome::Suppressed(reason)) => {
                info!(trigger_id = %trigger.id, reason = ?reason, "Trigger produced no build");
                None
            }
            Err(e) => {
                warn!(trigger_id = %trigger.id, dest = %trigger.dest, error = %e, "Failed to create child build");
                None
            }
        }
    }
}
