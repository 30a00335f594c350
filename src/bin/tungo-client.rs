//! TunGo client binary: expose a local HTTP origin through a public URL.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tungo::client::TunnelClient;
use tungo::config::{load_client_config, validate_client_config};
use tungo::lifecycle::shutdown_signal;
use tungo::observability::logging;

#[derive(Parser)]
#[command(name = "tungo-client")]
#[command(about = "TunGo client - expose your local server through a public tunnel URL", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file path (TOML). Flags win over file and environment.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Full server URL (e.g. ws://tunnel.example.com:5555)
    #[arg(long)]
    server_url: Option<String>,

    /// Server host
    #[arg(long)]
    server: Option<String>,

    /// Server control port
    #[arg(long)]
    port: Option<u16>,

    /// Local origin host
    #[arg(long)]
    local_host: Option<String>,

    /// Local origin port
    #[arg(long)]
    local_port: Option<u16>,

    /// Requested subdomain
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Secret key for authenticated mode
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Password protecting public access to the tunnel
    #[arg(short, long)]
    password: Option<String>,

    /// Skip TLS certificate verification (testing only)
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match load_client_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Flags override file and environment.
    if let Some(server_url) = cli.server_url {
        config.server_url = server_url;
        config.server_host.clear();
    }
    if let Some(server) = cli.server {
        config.server_host = server;
    }
    if let Some(port) = cli.port {
        config.control_port = port;
    }
    if let Some(local_host) = cli.local_host {
        config.local_host = local_host;
    }
    if let Some(local_port) = cli.local_port {
        config.local_port = local_port;
    }
    if let Some(subdomain) = cli.subdomain {
        config.subdomain = subdomain;
    }
    if let Some(key) = cli.key {
        config.secret_key = key;
    }
    if let Some(password) = cli.password {
        config.password = password;
    }
    if cli.insecure {
        config.insecure_tls = true;
    }

    if let Err(errors) = validate_client_config(&config) {
        for error in &errors {
            eprintln!("{}", error);
        }
        std::process::exit(1);
    }

    logging::init_logging(&config.log_level, &config.log_format);

    tracing::info!(
        local = %format!("{}:{}", config.local_host, config.local_port),
        subdomain = %config.subdomain,
        "Starting tungo client"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutting down client...");
            shutdown.cancel();
        });
    }

    let mut client = TunnelClient::new(config);
    client.run(shutdown).await;

    tracing::info!("Client stopped");
    Ok(())
}
