//! Update Agent - Main entry point

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use update_agent::{
    api,
    config::Config,
    daemon::{restart::RestartPlan, shutdown::ShutdownCoordinator, workload},
    update::{
        run_poller, BackupManager, CycleOutcome, HttpUpdateSource, InstallationState, Orchestrator,
        PollerExit,
    },
    utils,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run a single update cycle and exit
    #[arg(long)]
    once: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.agent.port = port;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    utils::logger::init(&config.log.level)?;

    let root = config.install_root()?;
    let state_file = config.state_file();
    tokio::fs::create_dir_all(&config.agent.data_dir).await?;

    let installation =
        match InstallationState::load(&state_file, root.clone(), env!("CARGO_PKG_VERSION")) {
            Ok(installation) => installation,
            Err(e) => {
                tracing::warn!("Ignoring unreadable version record {}: {}", state_file.display(), e);
                InstallationState::new(env!("CARGO_PKG_VERSION"), root.clone())
            }
        };

    tracing::info!(
        "Starting update-agent v{} (installed: {}, root: {})",
        env!("CARGO_PKG_VERSION"),
        installation.current_version,
        root.display()
    );

    let backups = BackupManager::new(
        config.backup_dir(),
        vec![config.agent.data_dir.clone(), config.temp_dir()],
    );
    let source = HttpUpdateSource::new(&config.update)?;
    let orchestrator = Arc::new(
        Orchestrator::new(source, installation, backups, config.temp_dir())
            .with_state_file(&state_file),
    );
    orchestrator.report_previous_backup();

    // Create shutdown coordinator; from here on signals only cancel the token
    let shutdown_coordinator = ShutdownCoordinator::new();
    let cancel = shutdown_coordinator.token();
    let signal_listener = shutdown_coordinator.listen()?;

    if args.once {
        let outcome = orchestrator.run_cycle().await;
        signal_listener.abort();

        return match outcome {
            CycleOutcome::RestartPending { to, .. } if shutdown_coordinator.is_requested() => {
                tracing::info!(version = %to, "Shutdown requested, new version starts on next launch");
                Ok(())
            }
            CycleOutcome::RestartPending { .. } => restart(&config),
            CycleOutcome::Failed { target, error } => {
                anyhow::bail!("update to {target} failed and could not be rolled back: {error}")
            }
            outcome => {
                tracing::info!(outcome = outcome.summary().outcome, "Single update cycle finished");
                Ok(())
            }
        };
    }

    let server_handle = if config.agent.port == 0 {
        tracing::info!("Status API disabled");
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.agent.port));
        let app = api::create_router(api::AppState::new(orchestrator.status()));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!("Listening on http://{}", addr);
        tracing::info!("Status endpoint: http://{}/update/status", addr);

        let server_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(server_cancel.cancelled_owned())
                .await
        }))
    };
    tracing::info!("Update server: {}", config.update.manifest_url());

    let workload_handle = tokio::spawn(workload::run_heartbeat(
        orchestrator.status(),
        orchestrator.guard(),
        Duration::from_secs(config.workload.heartbeat_secs.max(1)),
        cancel.clone(),
    ));

    let exit = run_poller(orchestrator, config.update.poll_interval(), cancel.clone()).await;

    // Stop the API, the workload and the signal listener whatever ended the poller
    shutdown_coordinator.trigger();
    let _ = signal_listener.await;

    let _ = tokio::time::timeout(Duration::from_secs(3), workload_handle).await;

    if let Some(server_handle) = server_handle {
        match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
            Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
            Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
            Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
            Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
        }
    }

    match exit {
        PollerExit::Shutdown => {
            tracing::info!("Graceful shutdown complete");
            Ok(())
        }
        PollerExit::Restart { from, to } => {
            tracing::info!(from = %from, to = %to, "Restarting into the new version");
            restart(&config)
        }
        PollerExit::Failed { target, error } => {
            anyhow::bail!("update to {target} failed and could not be rolled back: {error}")
        }
    }
}

fn restart(config: &Config) -> Result<()> {
    match RestartPlan::from_config(&config.restart)?.execute() {
        Ok(never) => match never {},
        Err(e) => Err(e.into()),
    }
}
