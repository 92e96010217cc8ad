//! CLI entry point for dust_patrol
//!
//! # Usage
//!
//! Start the service (robot channel, HTTP control surface):
//! ```bash
//! dust_patrol serve --config config/dust_patrol.toml
//! ```
//!
//! Drive a real robot without sensor or database:
//! ```bash
//! dust_patrol serve --simulate
//! ```
//!
//! Check configuration and reachability of the sensor and database:
//! ```bash
//! dust_patrol check
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dust_patrol::config::{Settings, DEFAULT_CONFIG_PATH};
use dust_patrol::inspection::{InspectionOrchestrator, PointQueue};
use dust_patrol::mock::{MemorySink, MockSensor};
use dust_patrol::persistence::{ResultSink, SqliteSink};
use dust_patrol::robot::CommandChannel;
use dust_patrol::sensor::{ParticleSensor, SensorSession};
use dust_patrol::service::PatrolService;
use dust_patrol::tracing_setup;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shutdown grace on top of one sensor dwell.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "dust_patrol")]
#[command(about = "Unattended cleanroom particle inspection", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the robot channel and the control surface until Ctrl-C
    Serve {
        /// Replace the sensor and the database with in-memory doubles
        #[arg(long)]
        simulate: bool,
    },

    /// Validate configuration and probe the sensor and database
    Check,

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;

    match cli.command {
        Commands::Serve { simulate } => serve(settings, simulate).await,
        Commands::Check => check(settings).await,
        Commands::PrintConfig => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn serve(settings: Settings, simulate: bool) -> Result<()> {
    tracing_setup::init_from_settings(&settings).map_err(anyhow::Error::msg)?;
    info!(name = %settings.application.name, simulate, "Starting");

    let shutdown = CancellationToken::new();
    let channel = CommandChannel::bind(&settings.robot).await?;
    let heartbeat = channel.spawn_heartbeat(shutdown.child_token());

    let sensor: Arc<dyn ParticleSensor>;
    let sink: Arc<dyn ResultSink>;
    if simulate {
        warn!("Simulation mode: readings are synthetic and kept in memory");
        sensor = Arc::new(MockSensor::steady(0).with_dwell(settings.sensor.dwell()));
        sink = Arc::new(MemorySink::new());
    } else {
        sensor = Arc::new(SensorSession::new(settings.sensor.clone()));
        sink = Arc::new(SqliteSink::connect(&settings.storage).await?);
    }

    let orchestrator = InspectionOrchestrator::new(
        &settings,
        channel.clone(),
        sensor.clone(),
        sink,
        Arc::new(PointQueue::new()),
    );
    let service = PatrolService::new(orchestrator, sensor);

    #[cfg(feature = "http_api")]
    let server = {
        let listener = tokio::net::TcpListener::bind(&settings.api.bind)
            .await
            .with_context(|| format!("binding {}", settings.api.bind))?;
        tokio::spawn(dust_patrol::api::serve(
            service.clone(),
            listener,
            shutdown.clone(),
        ))
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    // covers one sensor dwell, which is not interrupted mid-cycle
    let grace = settings.sensor.dwell() + SHUTDOWN_MARGIN;
    service.shutdown(grace).await;
    let buffered = service.orchestrator().buffer().len();
    if buffered > 0 {
        error!(buffered, "Exiting with readings that were never stored");
    }
    shutdown.cancel();

    #[cfg(feature = "http_api")]
    {
        if let Err(e) = server.await? {
            warn!(error = %e, "HTTP server ended with error");
        }
    }
    heartbeat.await?;
    Ok(())
}

async fn check(settings: Settings) -> Result<()> {
    println!("Configuration OK");

    let sensor = SensorSession::new(settings.sensor.clone());
    let sensor_ok = sensor.is_connected().await;
    println!(
        "Sensor {}: {}",
        settings.sensor.address(),
        if sensor_ok { "reachable" } else { "unreachable" }
    );

    let sink_ok = match SqliteSink::connect(&settings.storage).await {
        Ok(sink) => {
            let available = sink.is_available().await;
            sink.close().await;
            available
        }
        Err(e) => {
            println!("Database error: {e}");
            false
        }
    };
    println!(
        "Database {}: {}",
        settings.storage.database_url,
        if sink_ok { "available" } else { "unavailable" }
    );
    println!("Robot agent dials in on {}; not probed", settings.robot.bind);

    if sensor_ok && sink_ok {
        Ok(())
    } else {
        anyhow::bail!("one or more links are unreachable")
    }
}
