//! TunGo server binary: public proxy, control listener, metrics, shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tungo::config::load_server_config;
use tungo::lifecycle::{shutdown_signal, Shutdown};
use tungo::observability::{logging, metrics};
use tungo::registry::{self, ServerRecord};
use tungo::server::heartbeat::spawn_heartbeat;
use tungo::TunnelServer;

#[derive(Parser)]
#[command(name = "tungo-server")]
#[command(about = "TunGo server - public side of the reverse HTTP tunnel", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file path (TOML). Environment variables win over the file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match load_server_config(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    logging::init_logging(&config.log_level, &config.log_format);

    tracing::info!(
        server_id = %config.id,
        host = %config.host,
        port = config.port,
        control_port = config.control_port,
        domain = %config.domain,
        distributed = !config.redis_url.is_empty(),
        "Starting tungo server"
    );

    let metrics_addr: SocketAddr = format!("{}:{}", config.host, config.metrics_port).parse()?;
    metrics::init_metrics(metrics_addr);

    let registry = registry::connect(&config.redis_url, &config.id).await?;

    let descriptor = ServerRecord {
        server_id: config.id.clone(),
        host: config.host.clone(),
        proxy_port: config.port,
        control_port: config.control_port,
        last_heartbeat: 0,
        active_tunnels: 0,
        active_connections: 0,
    };
    registry.register_server(descriptor.clone()).await?;
    registry.start_heartbeat(descriptor.clone());

    let server = TunnelServer::new(Arc::clone(&config), Arc::clone(&registry));

    let shutdown = Shutdown::new();
    let heartbeat = spawn_heartbeat(
        Arc::clone(&registry),
        server.connection_manager(),
        descriptor,
        shutdown.subscribe(),
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutting down server...");
            shutdown.trigger();
        });
    }

    server.run(shutdown).await?;

    let _ = heartbeat.await;
    registry.close().await;

    tracing::info!("Server stopped");
    Ok(())
}
