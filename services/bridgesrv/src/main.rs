//! Modbus TCP to RTU bridge service

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use bridgesrv::config::BridgeConfig;
use bridgesrv::runtime;
use bridgesrv::telnet::LogMirrorServer;
use common::logging::{self, LogBroadcast, LogConfig};
use common::service_bootstrap::{print_startup_banner, ServiceInfo};
use common::shutdown::spawn_shutdown_watcher;
use errors::{BridgeError, BridgeResult};

#[derive(Parser, Debug, Clone)]
#[command(name = "bridgesrv", version, about = "Modbus TCP to RTU bridge")]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long, env = "BRIDGESRV_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> BridgeResult<()> {
    let args = Args::parse();
    let config = BridgeConfig::load(args.config.as_deref())?;

    let mirror = config
        .logging
        .telnet_bind
        .as_ref()
        .map(|_| LogBroadcast::default());
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    logging::init_with_config(LogConfig {
        service_name: "bridgesrv".to_string(),
        level: logging::parse_level(level),
        log_dir: config.logging.dir.clone(),
        enable_json: config.logging.json,
        ansi: !args.no_color,
        mirror: mirror.clone(),
    })
    .map_err(|e| BridgeError::StartupFailed(format!("Failed to initialize logging: {e}")))?;

    let service_info = ServiceInfo::new(
        "bridgesrv",
        env!("CARGO_PKG_VERSION"),
        "Modbus TCP to RTU bridge",
    );
    if !args.no_color {
        print_startup_banner(&service_info);
    }

    if let Err(e) = config.validate() {
        log_failure(&e);
        return Err(e);
    }
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let _watcher = spawn_shutdown_watcher(shutdown.clone());

    let _log_mirror = match (config.telnet_address()?, mirror) {
        (Some(address), Some(mirror)) => {
            Some(LogMirrorServer::bind(address, mirror, shutdown.child_token()).await?)
        },
        _ => None,
    };

    match runtime::run(&config, shutdown).await {
        Ok(stats) => {
            info!("Shutdown complete ({} requests served)", stats.requests_received);
            Ok(())
        },
        Err(e) => {
            log_failure(&e);
            Err(e)
        },
    }
}

fn log_failure(e: &BridgeError) {
    match e.log_level() {
        Level::ERROR => error!("[{}] {}", e.error_code(), e),
        Level::WARN => warn!("[{}] {}", e.error_code(), e),
        Level::INFO => info!("[{}] {}", e.error_code(), e),
        _ => debug!("[{}] {}", e.error_code(), e),
    }
}
