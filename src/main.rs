//! ==============================================================================
//! main.rs - edge gateway entry point
//! ==============================================================================
//!
//! purpose:
//!     tracks the machine's ip addresses and cpu temperature and forwards
//!     changes to the device platform. the platform can change the gateway's
//!     log level remotely; unknown levels are answered by re-publishing the
//!     level currently in force.
//!
//! responsibilities:
//!     - load the device config (credentials) and gateway.toml (settings)
//!     - initialize logging with a remotely adjustable level
//!     - open the reading store and connect the telemetry session
//!     - start the ip diff loop and the cpu temperature loop
//!     - serve the feed endpoint for remote commands
//!     - answer rejected log levels until ctrl-c
//!
//! relationships:
//!     - uses: config.rs, logging.rs, store.rs, registry.rs, session.rs,
//!             sampler.rs, scheduler.rs, control.rs
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                       gateway (this file)                    │
//!     │  ┌─────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//!     │  │ ip diff     │  │ cpu temp     │  │ feed endpoint       │  │
//!     │  │ (5 min)     │  │ (1 min, x5)  │  │ (port 3000)         │  │
//!     │  └──────┬──────┘  └──────┬───────┘  └──────────┬──────────┘  │
//!     │         │ add_reading    │                     │ handle_update│
//!     │         ▼                ▼                     ▼             │
//!     │   ┌─────────────────────────────┐     ┌────────────────┐     │
//!     │   │ HttpSession + ReadingStore  │ ◄── │ ControlBridge  │     │
//!     │   └──────────────┬──────────────┘     │ (main task     │     │
//!     │                  │ publish            │  waits here)   │     │
//!     └──────────────────┼────────────────────┴────────────────┴─────┘
//!                        ▼
//!                    platform
//!
//! ==============================================================================

use edge_gateway::config::{DeviceConfig, GatewayConfig};
use edge_gateway::control::{ControlBridge, LOG_REFERENCE};
use edge_gateway::logging::LogLevel;
use edge_gateway::reading::Reading;
use edge_gateway::registry::{
    Attribute, AttributeRegistry, AttributeType, Parameter, ParameterName, ParameterRegistry,
};
use edge_gateway::sampler::SystemSource;
use edge_gateway::scheduler::Schedule;
use edge_gateway::session::{serve_feed, FeedState, HttpSession, TelemetrySession};
use edge_gateway::store::ReadingStore;
use edge_gateway::{control, logging, scheduler};

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "edge-gateway",
    version,
    about = "Forwards IP address and CPU temperature changes to the device platform"
)]
struct Args {
    /// device config: json with deviceKey/devicePassword/platformHost, or three lines
    device_config: PathBuf,

    /// gateway settings file (default: config/gateway.toml if present)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// initial log level, overrides the settings file
    #[arg(long)]
    log_level: Option<String>,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Edge Gateway - IP & CPU Temperature Tracker");
    println!("===========================================================");

    let args = Args::parse();

    // step 1: load configuration
    let device = match DeviceConfig::load(&args.device_config) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("[ERROR] Error with loading file: {}", e);
            return Err(e.into());
        }
    };
    println!("[CONFIG] Device config loaded successfully");

    let settings = GatewayConfig::resolve(args.settings.as_deref())?;
    settings.print_summary(&device);

    // step 2: logging
    let level_name = args.log_level.as_deref().unwrap_or(&settings.logging.level);
    let level = LogLevel::parse_relaxed(level_name).context("invalid log level in configuration")?;
    let log_handle = logging::init(
        level,
        settings.logging.directory.as_deref(),
        settings.logging.console_ansi,
    )?;

    // step 3: device attributes and parameters, reported when the session connects
    let attributes = Arc::new(AttributeRegistry::new());
    attributes.put(
        "gateway_version",
        Attribute::new("gateway_version", AttributeType::String, env!("CARGO_PKG_VERSION")),
    );
    let window = settings.sampling.thermal_window.to_string();
    attributes.put(
        "thermal_window",
        Attribute::new("thermal_window", AttributeType::Numeric, window),
    );
    let parameters = Arc::new(ParameterRegistry::new());
    parameters.put(
        "outbound_data_mode",
        Parameter { name: ParameterName::OutboundDataMode, value: "PUSH".to_string() },
    );

    // step 4: reading store + session
    let store = Arc::new(
        ReadingStore::open_with(&settings.store.path, settings.store.removal)
            .context("failed to open reading store")?,
    );
    if !store.is_empty() {
        tracing::info!("{} readings from a previous run are waiting to be published", store.len());
    }

    let timeout = Duration::from_secs(settings.platform.request_timeout_seconds);
    let session = HttpSession::new(device.clone(), store.clone(), timeout)
        .context("failed to build platform client")?
        .with_registries(attributes, parameters);
    let session = Arc::new(session);
    session.connect().await.context("failed to connect telemetry session")?;
    let session_dyn: Arc<dyn TelemetrySession> = session.clone();

    // step 5: control bridge + feed endpoint
    let bridge = {
        let handle = log_handle.clone();
        Arc::new(ControlBridge::new(level, move |l| handle.set_level(l)))
    };

    if settings.control.enabled {
        let feed_state = FeedState::new(device.device_key.clone(), bridge.clone(), store.clone());
        let listen = settings.control.listen.clone();
        tokio::spawn(async move {
            tracing::info!("Feed endpoint live at http://{}", listen);
            if let Err(e) = serve_feed(&listen, feed_state).await {
                tracing::error!("Feed endpoint error: {}", e);
            }
        });
    }

    // step 6: initial log level, then the sampling loops
    session.add_reading(Reading::new(LOG_REFERENCE, level.as_str())).await;

    let source = Arc::new(SystemSource::new(
        settings.sampling.thermal_path.clone(),
        settings.sampling.interface_keying,
        settings.sampling.component_fallback,
    ));
    let schedule = Schedule {
        network_interval: Duration::from_secs(settings.sampling.network_interval_seconds),
        thermal_interval: Duration::from_secs(settings.sampling.thermal_interval_seconds),
        thermal_window: settings.sampling.thermal_window,
    };
    let (network_task, thermal_task) =
        scheduler::spawn(source, session_dyn.clone(), schedule).await;

    tracing::info!("Gateway running, press Ctrl-C to stop");

    // step 7: answer rejected log levels until shutdown
    loop {
        tokio::select! {
            level = control::correct_once(&bridge, session_dyn.as_ref()) => {
                tracing::debug!("Re-published log level {}", level);
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    network_task.abort();
    thermal_task.abort();
    session.disconnect().await;
    Ok(())
}
