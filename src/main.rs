//! ==============================================================================
//! main.rs - energy agent entry point
//! ==============================================================================
//!
//! purpose:
//!     process bootstrap for the telemetry agent on an edge host.
//!
//! responsibilities:
//!     - load agent.toml (or defaults) and set up logging
//!     - build the radio, store, sinks and meter from config
//!     - serve the local status api
//!     - run the tick loop until ctrl-c, then persist the total
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │              current-thread tokio runtime                    │
//!     │  ┌─────────────┐   ┌──────────────────┐   ┌──────────────┐   │
//!     │  │ tick loop   │◄──│ stream listener  │   │ status api   │   │
//!     │  │ (agent.rs)  │   │ (realtime.rs)    │   │ (port 3000)  │   │
//!     │  └──────┬──────┘   └──────────────────┘   └──────┬───────┘   │
//!     │         │       mpsc: inbound events             │           │
//!     │         │◄───────────────────────────────────────┘           │
//!     │         │       mpsc: commands (clear energy)                │
//!     │   ┌─────┴─────┬──────────────┬───────────────┐               │
//!     │   ▼           ▼              ▼               ▼               │
//!     │ storage   connectivity   REST backend   realtime db          │
//!     └──────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use energy_agent::backend::RestSink;
use energy_agent::config::AgentConfig;
use energy_agent::connectivity::{ConnectivityManager, NmcliRadio, Radio, SimulatedRadio};
use energy_agent::domain::DeviceIdentity;
use energy_agent::meter::SimulatedMeter;
use energy_agent::realtime::RealtimeSink;
use energy_agent::status;
use energy_agent::storage::{EnergyAccumulator, FileStore};
use energy_agent::{AgentSettings, TelemetryAgent};

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // step 1: load configuration (logged through a bootstrap subscriber)
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .with_target(false)
        .compact()
        .finish();
    let config = tracing::subscriber::with_default(bootstrap, AgentConfig::load_or_default)
        .context("failed to load configuration")?;

    // step 2: logging; RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("===========================================================");
    info!("  Energy Agent - power monitor telemetry");
    info!("===========================================================");
    config.print_summary();

    let booted_at = Instant::now();
    match config.network.radio.as_str() {
        "nmcli" => {
            let radio = NmcliRadio::new(config.network.interface.clone());
            run(config, radio, booted_at).await
        }
        _ => {
            info!("using simulated radio (no wifi hardware access)");
            let radio = SimulatedRadio::new(true, Duration::from_millis(800));
            run(config, radio, booted_at).await
        }
    }
}

async fn run<R: Radio>(config: AgentConfig, radio: R, booted_at: Instant) -> Result<()> {
    // step 3: components
    let device = DeviceIdentity::new(config.device.id.clone());
    let connectivity = ConnectivityManager::new(radio, &config.network);
    let accumulator = EnergyAccumulator::from_config(
        FileStore::new(config.storage.path.clone()),
        &config.storage,
    );
    let primary = RestSink::new(&config.backend).context("failed to build backend client")?;
    let mut realtime = RealtimeSink::from_config(device.clone(), &config.realtime, booted_at)
        .context("failed to build realtime client")?;
    let events = realtime.take_events();

    let settings = AgentSettings::from_config(&config);
    let mut meter = SimulatedMeter::new(settings.tick_interval);
    let mut agent = TelemetryAgent::new(
        device,
        connectivity,
        accumulator,
        primary,
        realtime,
        settings,
        booted_at,
    );

    // step 4: status api in background
    let commands = if config.status.enabled {
        let (tx, rx) = mpsc::channel(8);
        let bind = config.status.bind.clone();
        let shared = agent.status();
        tokio::spawn(async move {
            if let Err(e) = status::serve(&bind, shared, tx).await {
                error!(error = %e, "status api stopped");
            }
        });
        Some(rx)
    } else {
        None
    };

    // step 5: boot sequence and tick loop
    let total = agent.start().await;
    info!(total_kwh = total, "resuming from stored total");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    agent.run(&mut meter, events, commands, shutdown).await?;
    Ok(())
}
