//! udp-bridge CLI - point-to-point IP tunnel over UDP
//!
//! Runs as a client (connects to a fixed server address) or, with `-s`, as a
//! server (binds the given address and follows the client as it roams).

use std::future::Future;
use std::process::ExitCode;

use clap::Parser;
use ipnet::Ipv4Net;
use tracing_subscriber::{fmt, EnvFilter};

use udp_bridge::config::DEFAULT_MTU;
use udp_bridge::tunnel::Framing;
use udp_bridge::{BridgeClient, BridgeConfig, BridgeError, BridgeServer, ClientId, Role};

/// udp-bridge - IPv4 over UDP tunnel
#[derive(Parser, Debug)]
#[command(name = "udp-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run as server (bind <ip>:<port> instead of connecting to it)
    #[arg(short = 's', long)]
    server: bool,

    /// Server address (client) or bind address (server)
    ip: String,

    /// Server port (client) or bind port (server)
    port: u16,

    /// Shared tunnel identifier, 1..=4294967294
    client_id: ClientId,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Interface MTU
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: u16,

    /// Configure the interface with this address (e.g. 10.0.0.1/24)
    #[arg(long)]
    address: Option<Ipv4Net>,

    /// Requested interface name
    #[arg(long)]
    name: Option<String>,

    /// Address-family framing of interface packets (raw or af-prefix)
    #[arg(long)]
    framing: Option<Framing>,
}

impl Args {
    fn into_config(self) -> BridgeConfig {
        let role = if self.server { Role::Server } else { Role::Client };
        let mut config = BridgeConfig::new(role, self.ip, self.port, self.client_id);
        config.mtu = self.mtu;
        config.address = self.address;
        config.name = self.name;
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args.into_config()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(config: BridgeConfig) -> Result<(), BridgeError> {
    tracing::info!(
        "udp-bridge {} starting ({}:{}, client_id {})",
        config.role,
        config.host,
        config.port,
        config.client_id
    );

    match config.role {
        Role::Client => {
            let mut client = BridgeClient::new(&config).await?;
            run_until_shutdown(client.run()).await
        }
        Role::Server => {
            let mut server = BridgeServer::new(&config).await?;
            run_until_shutdown(server.run()).await
        }
    }
}

/// Drive an engine until it fails or Ctrl+C / SIGTERM arrives
async fn run_until_shutdown<F>(engine: F) -> Result<(), BridgeError>
where
    F: Future<Output = Result<(), BridgeError>>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = engine => {
            result
        }
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
            Ok(())
        }
    }
}
