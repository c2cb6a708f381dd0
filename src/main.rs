//! Smart light service - main entry point
//!
//! Wires the store, the MQTT transport, the feedback ingestor and the HTTP
//! server together and runs them until SIGINT or SIGTERM.

use smartlight::config::LightConfig;
use smartlight::control::FeedbackIngestor;
use smartlight::http::{self, auth::StaticTokenAuthenticator, AppState};
use smartlight::observability::init_default_logging;
use smartlight::store::{MemoryStore, SqliteStore, StateStore};
use smartlight::transport::mqtt::MqttClient;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Depth of the queue between the MQTT event loop and the ingestor
const TELEMETRY_CHANNEL_CAPACITY: usize = 256;

/// Remote control and automatic dimming for one MQTT smart light
#[derive(Parser)]
#[command(name = "smartlight")]
#[command(about = "Remote control and automatic dimming for one MQTT smart light")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SMARTLIGHT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting smartlight v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<LightConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(LightConfig::load_from_file(path)?);
    }

    for path_str in ["smartlight.toml", "config/smartlight.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(LightConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(LightConfig::default())
}

/// Store factory for the configured backend
async fn build_store(
    config: &LightConfig,
) -> Result<Arc<dyn StateStore>, Box<dyn std::error::Error>> {
    if config.database.is_in_memory_store() {
        warn!("Using the in-memory store; state is lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store =
        SqliteStore::connect(&config.database.url, config.database.max_connections).await?;
    Ok(Arc::new(store))
}

async fn run_service(config: LightConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = build_store(&config).await?;

    let authenticator = StaticTokenAuthenticator::from_config(&config)?;
    if authenticator.is_enabled() && authenticator.user_count() == 0 {
        warn!("Authentication is enabled but no users are configured; every device API call will be rejected");
    }

    // The sender must be attached before the event loop starts
    let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_CHANNEL_CAPACITY);
    let mut client = MqttClient::new(config.mqtt.clone())?;
    client.set_telemetry_sender(telemetry_tx);
    if let Err(e) = client.connect().await {
        warn!(error = %e, "MQTT broker not reachable yet; retrying in the background");
    }
    let transport = Arc::new(client);

    let ingestor = FeedbackIngestor::new(store.clone(), transport.clone());
    let ingestor_handle = tokio::spawn(ingestor.run(telemetry_rx));

    let state = AppState::new(
        store.clone(),
        transport.clone(),
        Arc::new(authenticator),
        config.history.clone(),
    );
    let bind_ip: IpAddr = config.http.bind_address.parse()?;
    let addr = SocketAddr::new(bind_ip, config.http.port);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = http::serve(state, addr, shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Service is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = server_handle.await {
        error!("HTTP server task failed: {}", e);
    }

    // Disconnecting drops the telemetry sender, which ends the ingestor
    if let Err(e) = transport.disconnect().await {
        warn!("Error during MQTT disconnect: {}", e);
    }
    if let Err(e) = ingestor_handle.await {
        error!("Ingestor task failed: {}", e);
    }

    Ok(())
}

fn handle_config_command(
    config: &LightConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
