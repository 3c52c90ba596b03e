use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use idra::cli::{Cli, Commands};
use idra::config::ConfigStore;
use idra::fleet::{spawn_health_loop, Manager, Registry, DEFAULT_HEALTH_INTERVAL};
use idra::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            agents_dir,
            port,
            config,
        } => run(agents_dir, port, config).await,
    }
}

async fn run(
    agents_dir: Option<PathBuf>,
    port: Option<u16>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => ConfigStore::default_path().context("could not determine config directory")?,
    };
    let config = Arc::new(ConfigStore::load(config_path)?);
    info!(path = %config.path().display(), port = config.get().port, "config loaded");

    // Discover agents.
    let manager = match agents_dir.or_else(default_agents_dir) {
        Some(dir) => {
            let registry = Registry::scan(&dir)?;
            Some(Arc::new(Manager::new(registry)))
        }
        None => {
            info!("no agents directory found");
            None
        }
    };

    let root = CancellationToken::new();

    // Start the fleet and the liveness prober.
    let mut health_loop = None;
    if let Some(manager) = &manager {
        manager.start_all(&root).await;
        health_loop = Some(spawn_health_loop(
            Arc::clone(manager),
            DEFAULT_HEALTH_INTERVAL,
            root.child_token(),
        ));
    }

    let listener = server::bind(&config, port).await?;
    let addr = listener.local_addr()?;
    let app = server::router(AppState {
        manager: manager.clone(),
        config: Arc::clone(&config),
        started_at: Instant::now(),
    });

    info!(addr = %addr, version = server::VERSION, "idra is running");
    println!("\n  Idra is running at http://{addr}\n  Press Ctrl+C to stop.\n");

    // The graceful-shutdown future stops the agents before it resolves, so
    // the frontend only starts draining once the fleet is down and can
    // never hand a task to a half-stopped runner.
    let shutdown = {
        let root = root.clone();
        let manager = manager.clone();
        async move {
            shutdown_signal().await;
            info!("shutting down");
            root.cancel();
            if let Some(manager) = &manager {
                manager.stop_all().await;
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    if let Some(handle) = health_loop {
        let _ = handle.await;
    }

    info!("stopped");
    Ok(())
}

/// Find the agents directory next to the executable (production layout)
/// or under the current working directory (development).
fn default_agents_dir() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent().map(|p| p.join("agents")) {
            if dir.is_dir() {
                info!(dir = %dir.display(), "agents directory found (next to binary)");
                return Some(dir);
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let dir = cwd.join("agents");
        if dir.is_dir() {
            info!(dir = %dir.display(), "agents directory found (cwd)");
            return Some(dir);
        }
    }

    None
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "could not install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
