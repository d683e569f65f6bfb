//! Registry server entry point

use anyhow::Result;
use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use registry_server::{print_routes, RegistryConfig, RegistryServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "registry_server=info,registry_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let matches = Command::new("registry-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Service registry and discovery control plane")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("registry.toml"),
        )
        .arg(
            Arg::new("routes")
                .long("routes")
                .help("Print available routes and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("routes") {
        print_routes();
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str);
    let config = match RegistryConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            info!("falling back to built-in defaults");
            RegistryConfig::default()
        }
    };
    if let Err(e) = config.validate() {
        error!("configuration rejected: {e}");
        std::process::exit(1);
    }

    info!(
        "starting registry server v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.server_address()
    );
    info!("node id: {}", config.node_id());
    info!("clustering: {}", config.cluster.enabled);
    if config.cluster.enabled {
        info!("cluster peers: {:?}", config.cluster.peers());
        info!("sync interval: {}s", config.cluster.sync_interval_secs);
    }
    info!("health probes: {}", config.health_check.enabled);
    info!(
        "eviction interval: {}s, default lease: {}s",
        config.storage.eviction_interval_secs, config.storage.default_lease_secs
    );
    info!("security: {}", config.security.enabled);

    let server = RegistryServer::new(config)?;
    if let Err(e) = server.start().await {
        error!("server error: {e}");
        std::process::exit(1);
    }
    Ok(())
}
