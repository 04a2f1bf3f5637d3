//! Background reconciliation of abandoned jobs.

use cascade_core::build::PipelineBuildJob;
use cascade_core::events::{Event, JobStatusChangedPayload, JobTimedOutPayload};
use cascade_core::ports::{BuildJobRepository, LeaseRepository};
use cascade_core::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::EventPublisher;
use crate::lifecycle::BuildLifecycleManager;
use crate::scheduler::SchedulerPorts;

/// Log line appended to every job killed for inactivity.
pub const TIMEOUT_REASON: &str = "Killed (Reason: Timeout)";

const LEASE_NAME: &str = "stale-job-reconciler";

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub killed: usize,
    pub skipped: usize,
}

/// Fails running jobs that stopped reporting.
pub struct StaleJobReconciler {
    jobs: Arc<dyn BuildJobRepository>,
    leases: Arc<dyn LeaseRepository>,
    lifecycle: Arc<BuildLifecycleManager>,
    events: EventPublisher,
    interval: Duration,
    stale_after: Duration,
    instance_id: String,
}

impl StaleJobReconciler {
    pub fn new(
        ports: &SchedulerPorts,
        lifecycle: Arc<BuildLifecycleManager>,
        events: EventPublisher,
        interval: Duration,
        stale_after: Duration,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            jobs: ports.jobs.clone(),
            leases: ports.leases.clone(),
            lifecycle,
            events,
            interval,
            stale_after,
            instance_id: instance_id.into(),
        }
    }

    /// Run a pass every interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "Starting stale job reconciler"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) if report.killed > 0 || report.skipped > 0 => {
                            info!(killed = report.killed, skipped = report.skipped, "Reconciliation pass done");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reconciliation pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stale job reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass. Only the replica holding the reconciler lease works; the
    /// others return an empty report.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        if !self
            .leases
            .try_claim(LEASE_NAME, &self.instance_id, self.interval)
            .await?
        {
            debug!("Reconciler lease held by another replica");
            return Ok(ReconcileReport::default());
        }

        let window = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let cutoff = Utc::now() - window;

        let mut report = ReconcileReport::default();
        for job in self.jobs.find_stale(cutoff).await? {
            match self.kill(&job, cutoff).await {
                Ok(true) => report.killed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) if e.is_lock_contention() => {
                    debug!(job_id = %job.id, "Job locked elsewhere, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(job_id = %job.id, build_id = %job.build_id, error = %e, "Failed to kill stale job");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    async fn kill(&self, job: &PipelineBuildJob, cutoff: chrono::DateTime<Utc>) -> Result<bool> {
        let Some(killed) = self.jobs.kill_stale(job.id, TIMEOUT_REASON, cutoff).await? else {
            return Ok(false);
        };

        warn!(
            job_id = %killed.id,
            build_id = %killed.build_id,
            started_at = ?job.started_at,
            "Stale job killed"
        );

        self.events.emit(Event::JobTimedOut(JobTimedOutPayload {
            build_id: killed.build_id,
            job_id: killed.id,
            started_at: job.started_at,
            killed_at: Utc::now(),
        }));
        self.events
            .emit(Event::JobStatusChanged(JobStatusChangedPayload::from(&killed)));

        self.lifecycle.job_finished(&killed).await?;
        Ok(true)
    }
}
