//! Iris Daemon - Main entry point
//!
//! Runs the iris scheduler against the simulated hardware driver.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iris_daemon::driver::simulated::{SimulatedConnector, SimulatedDriver};
use iris_daemon::{IrisConfig, IrisService, Platform, StaticUserDirectory};

#[derive(Parser)]
#[command(name = "iris-daemon")]
#[command(about = "Iris biometric session scheduler", long_about = None)]
#[command(version)]
struct Args {
    /// Config file (defaults to $IRIS_CONFIG, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Foreground user at startup
    #[arg(long, default_value_t = 0)]
    user: i32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iris_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting iris daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load or create config
    let config_path = args.config.unwrap_or_else(|| {
        std::env::var("IRIS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("/etc"))
                    .join("iris")
                    .join("daemon.json")
            })
    });

    let config = if config_path.exists() {
        IrisConfig::load(&config_path)?
    } else {
        let config = IrisConfig::default();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(&config_path)?;
        info!("Created default config at {:?}", config_path);
        config
    };

    let platform = Platform {
        users: Arc::new(StaticUserDirectory::single(args.user)),
        ..Platform::default()
    };
    let connector = Arc::new(SimulatedConnector::new(Arc::new(SimulatedDriver::automatic())));

    let (service, mut handle) = IrisService::spawn(config, connector, platform)?;
    info!("Daemon started successfully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = &mut handle => {
            error!("Scheduler exited unexpectedly");
            return Ok(());
        }
    }

    info!("Daemon shutting down");
    if let Err(e) = service.shutdown().await {
        error!("Shutdown failed: {}", e);
    }
    let _ = handle.await;

    Ok(())
}

