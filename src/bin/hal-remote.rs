use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hal_remote::{
    AddressFamilyMask, DiscoveryConfig, DiscoveryEndpoint, EchoWorker, Server, ServerConfig,
    ServerUrl,
};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hal-remote", about = "Serve or discover remote HAL servers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bind and serve until Ctrl+C
    Serve {
        /// URL to bind, e.g. tcp://0.0.0.0:55132
        #[arg(long)]
        bind: Option<ServerUrl>,
        /// Maximum number of concurrent connections
        #[arg(long)]
        max_workers: Option<usize>,
        /// Do not advertise via discovery
        #[arg(long)]
        no_advertise: bool,
    },
    /// List servers discoverable on the local network
    Find {
        /// Only IPv4 addresses
        #[arg(long)]
        ipv4: bool,
        /// Only IPv6 addresses
        #[arg(long)]
        ipv6: bool,
        /// How long to wait for replies
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve {
            bind,
            max_workers,
            no_advertise,
        } => serve(bind, max_workers, !no_advertise).await,
        Command::Find {
            ipv4,
            ipv6,
            timeout_ms,
        } => find(ipv4, ipv6, Duration::from_millis(timeout_ms)).await,
    }
}

async fn serve(bind: Option<ServerUrl>, max_workers: Option<usize>, advertise: bool) -> Result<()> {
    let mut config = ServerConfig::default().with_advertise(advertise);
    config.bind = bind;
    config.max_workers = max_workers;

    let server = Server::bind(config).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Caught Ctrl+C, shutting down the server...");
        }
        let _ = shutdown_tx.send(());
    });

    info!("Press Ctrl+C to stop the server");
    server
        .run(|stream, _peer| EchoWorker::new(stream), shutdown_rx)
        .await?;
    Ok(())
}

async fn find(ipv4: bool, ipv6: bool, timeout: Duration) -> Result<()> {
    let mask = match (ipv4, ipv6) {
        (true, false) => AddressFamilyMask::IPV4,
        (false, true) => AddressFamilyMask::IPV6,
        _ => AddressFamilyMask::ALL,
    };

    let config = DiscoveryConfig::default()
        .with_browse_timeout(timeout)
        .with_search_window(timeout);
    let mut discovery = DiscoveryEndpoint::new(config);
    discovery.start();

    let peers = discovery.server_urls(mask).await;
    if peers.is_empty() {
        println!("No servers found");
    }
    for (uuid, urls) in &peers {
        for (family, url) in urls {
            println!("{uuid}  {family}  {url}");
        }
    }

    discovery.stop().await;
    Ok(())
}
