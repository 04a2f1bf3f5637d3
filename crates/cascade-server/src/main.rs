//! Cascade scheduler daemon.
//!
//! Connects Postgres and the event bus, runs migrations, then drives the
//! event dispatcher and the stale-job reconciler until Ctrl-C.

use anyhow::Context;
use cascade_core::ports::EventBus;
use cascade_db::{Database, Repositories};
use cascade_nats::{NatsConfig, NatsEventBus};
use cascade_scheduler::{InProcessEventBus, Scheduler, SchedulerConfig, SchedulerPorts};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

mod telemetry;

use telemetry::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "cascaded")]
#[command(author, version, about = "Cascade trigger graph and build scheduler", long_about = None)]
struct Cli {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Comma-separated NATS URLs. Events stay in-process when unset.
    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    /// Scheduler configuration file (YAML).
    #[arg(long, env = "CASCADE_CONFIG")]
    config: Option<PathBuf>,

    /// Connections in the Postgres pool.
    #[arg(long, env = "CASCADE_DB_POOL", default_value_t = 20)]
    pool_size: u32,

    #[arg(long, env = "CASCADE_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Do not apply pending migrations on startup.
    #[arg(long)]
    skip_migrations: bool,
}

fn scheduler_ports(repos: Repositories) -> SchedulerPorts {
    SchedulerPorts {
        catalog: repos.catalog,
        pipelines: repos.pipelines,
        stages: repos.stages,
        triggers: repos.triggers,
        builds: repos.builds,
        jobs: repos.jobs,
        leases: repos.leases,
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SchedulerConfig> {
    match path {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("reading {}", path.display())),
        None => Ok(SchedulerConfig::default()),
    }
}

async fn event_bus(nats_url: Option<&str>, buffer: usize) -> anyhow::Result<Arc<dyn EventBus>> {
    match nats_url {
        Some(urls) => {
            let bus = NatsEventBus::connect_with_config(NatsConfig::from_url_list(urls))
                .await
                .context("connecting to NATS")?;
            Ok(Arc::new(bus))
        }
        None => {
            info!("No NATS_URL set, using the in-process event bus");
            Ok(Arc::new(InProcessEventBus::new(buffer)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    let config = load_config(cli.config.as_ref())?;
    info!(
        instance_id = %config.instance_id,
        reconcile_interval_secs = config.reconcile_interval_secs,
        stale_after_secs = config.stale_after_secs,
        "Starting cascaded"
    );

    let db = Database::connect_with(&cli.database_url, cli.pool_size)
        .await
        .context("connecting to Postgres")?;
    if !cli.skip_migrations {
        db.migrate().await.context("running migrations")?;
        info!("Migrations applied");
    }

    let bus = event_bus(cli.nats_url.as_deref(), config.event_buffer).await?;
    let (scheduler, dispatcher) = Scheduler::new(scheduler_ports(db.repositories()), bus, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    let reconciler_task = tokio::spawn(scheduler.reconciler().run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, task) in [("reconciler", reconciler_task), ("dispatcher", dispatcher_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task panicked");
        }
    }

    info!(dropped_events = scheduler.publisher().dropped(), "cascaded stopped");
    Ok(())
}
