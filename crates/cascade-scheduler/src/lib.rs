//! Scheduling core for Cascade.
//!
//! Managers for the trigger graph, stage order and build lifecycle sit on
//! the port traits of `cascade-core`; the [`Scheduler`] facade wires them
//! together with the trigger cascade and the stale-job reconciler.

pub mod bus;
pub mod cascade;
pub mod config;
pub mod dispatcher;
pub mod graph;
pub mod lifecycle;
pub mod reconciler;
pub mod scheduler;
pub mod stages;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::InProcessEventBus;
pub use cascade::TriggerCascade;
pub use config::SchedulerConfig;
pub use dispatcher::{EventDispatcher, EventPublisher, event_channel};
pub use graph::TriggerGraphManager;
pub use lifecycle::{BuildLifecycleManager, BuildRequest, JobReport, select_next_stage};
pub use reconciler::{ReconcileReport, StaleJobReconciler, TIMEOUT_REASON};
pub use scheduler::{Scheduler, SchedulerPorts};
pub use stages::StageOrderManager;
