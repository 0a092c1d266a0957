use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanesync::cluster::{Cluster, ClusterBroadcaster, ClusterCommand, TaskEvent};
use lanesync::config::Config;
use lanesync::coordination::{CoordinationClient, MemoryStore};
use lanesync::metrics;
use lanesync::notifications::{Alarm, AlarmKind, AlarmSink, NotificationManager};
use lanesync::status::StatusServer;

#[derive(Parser)]
#[command(
    name = "lanesync",
    version,
    about = "Cluster coordination node for change-data-capture replication",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a standalone node against the in-memory coordination store
    Run,

    /// Load and validate the configuration, then print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::CheckConfig => check_config(&config),
    }
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("lanesync=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("lanesync={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    config.validate().context("invalid configuration")?;

    println!("Configuration OK");
    println!("  Node:            {} ({})", config.node.node_id, config.node.address);
    println!("  Force assign:    {}", config.node.force_assign);
    println!(
        "  Heartbeat:       every {}s after {}s",
        config.node.heartbeat_interval_secs, config.node.heartbeat_initial_delay_secs
    );
    println!("  Backlog alarm:   {}", config.load.backlog_alarm_threshold);
    println!("  Stuck load:      {}s", config.load.stuck_load_threshold_secs);
    println!(
        "  Webhook:         {}",
        config.alarm.webhook_url.as_deref().unwrap_or("disabled")
    );
    if config.server.enabled {
        println!("  Status server:   {}", config.server.bind_address);
    } else {
        println!("  Status server:   disabled");
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    config.validate().context("invalid configuration")?;
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics registry unavailable");
    }

    let store: Arc<dyn CoordinationClient> = Arc::new(MemoryStore::new());
    let cluster = Cluster::new(Arc::clone(&store), config.node.clone());
    let alarms = Arc::new(NotificationManager::from_config(&config.alarm)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bus = cluster.event_bus(Arc::clone(&store)).start(shutdown_rx.clone());

    cluster
        .provider
        .broadcast(ClusterCommand::NodeRegister {
            upload_statistic: config.node.upload_statistic,
        })
        .await
        .context("node registration failed")?;
    tracing::info!(
        node_id = %config.node.node_id,
        address = %config.node.address,
        "Node registered"
    );

    let events = tokio::spawn(log_task_events(
        cluster.registry.subscribe(),
        Arc::clone(&alarms),
    ));

    let server = if config.server.enabled {
        let server = StatusServer::new(config.server.clone(), Arc::clone(&cluster.context));
        let mut stop = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let signal = async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = server.serve(signal).await {
                tracing::error!(error = %e, "Status server failed");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    if let Err(e) = cluster.provider.broadcast(ClusterCommand::Shutdown).await {
        tracing::error!(error = %e, "Node shutdown failed");
    }
    shutdown_tx.send_replace(true);
    bus.join().await;
    events.abort();
    if let Some(server) = server {
        let _ = server.await;
    }

    tracing::info!("Node stopped");
    Ok(())
}

/// Log task events until the registry goes away
async fn log_task_events(mut events: broadcast::Receiver<TaskEvent>, alarms: Arc<NotificationManager>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let config = event.config();
                tracing::info!(
                    event = event.kind(),
                    task_id = %config.task_id,
                    swimlane_id = %config.swimlane_id,
                    "Task event"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                alarms.notify(Alarm::new(
                    AlarmKind::NodeWarning,
                    "task events dropped",
                    format!("{skipped} task events were not observed"),
                ));
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
