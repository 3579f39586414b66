//! SAN Attach Adapter
//!
//! Serves host attachment of array volumes and snapshots over REST.
//!
//! ```text
//! san-attach-adapter --config /etc/san-attach/adapter.yaml
//! san-attach-adapter --standalone --log-level debug
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use san_attach_adapter::{
    AdapterConfig, ApiServer, ApiServerConfig, ArrayGatewayRef, AttachmentOrchestrator,
    GatewayFactory, OrchestratorConfig, StaticZoneLookup, StorageProcessor, ZoneLookupRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SAN Attach Adapter - host attachment for iSCSI and Fibre Channel arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "SAN_ATTACH_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Allow cross-origin API requests
    #[arg(long, env = "API_CORS")]
    cors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against a simulated in-memory array
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting SAN Attach Adapter");
    info!("  Version: {}", san_attach_adapter::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let config = load_config(&args)?;
    info!("  Protocol: {}", config.protocol);

    let gateway: ArrayGatewayRef = if args.standalone {
        let array = GatewayFactory::standalone(config.protocol);
        let luns = [
            ("standalone-lun-a", StorageProcessor::A),
            ("standalone-lun-b", StorageProcessor::B),
        ];
        for (name, owner) in luns {
            let lun_id = array.add_lun(name, owner);
            info!("Simulated LUN {} ({}) owned by sp{}", lun_id, name, owner);
        }
        array
    } else {
        GatewayFactory::create(&config).context("failed to create array gateway")?
    };

    let zone_lookup: Option<ZoneLookupRef> = match &config.zoning {
        Some(zoning) => {
            let lookup = StaticZoneLookup::new(zoning);
            info!("Zoning enabled with {} fabric(s)", lookup.fabric_count());
            Some(Arc::new(lookup) as ZoneLookupRef)
        }
        None => None,
    };

    let orchestrator =
        AttachmentOrchestrator::new(OrchestratorConfig::from(&config), gateway, zone_lookup)
            .context("failed to build attachment orchestrator")?;

    orchestrator
        .validate_ports()
        .await
        .context("io_ports do not match the array's target ports")?;

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .with_context(|| format!("invalid REST API address {}", args.api_addr))?,
        cors_enabled: args.cors,
        ..Default::default()
    };

    let api_server = Arc::new(ApiServer::new(api_config, orchestrator));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_server.shutdown();
        }
    });

    api_server.run().await?;

    info!("Adapter shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<AdapterConfig> {
    match (&args.config, args.standalone) {
        (Some(path), false) => AdapterConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        (Some(path), true) => {
            let config = AdapterConfig::read(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?;
            config.validate_attachment()?;
            Ok(config)
        }
        (None, true) => {
            warn!("No configuration file given, using defaults");
            Ok(AdapterConfig::default())
        }
        (None, false) => anyhow::bail!("--config is required unless --standalone is set"),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=info".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("axum=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
