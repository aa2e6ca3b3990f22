use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hopwire_client::{Client, ClientConfig, RoutePair};
use hopwire_common::Kind;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hopwire-client")]
#[command(about = "Hopwire - relay diagnostics from the player side", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, default_value = "client.toml", global = true)]
    config: String,

    /// Gateway to use instead of the configured default
    #[arg(long, global = true)]
    gateway: Option<SocketAddrV4>,

    /// Forward to use instead of the configured default
    #[arg(long, global = true)]
    forward: Option<SocketAddrV4>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Round-trip time to the gateway and through it to the forward
    Ping {
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,
    },
    /// Packet loss on each leg of the route
    Loss,
    /// Configured locations of the relays
    Locate,
    /// Route that would be chosen for a game server
    Route { server: Ipv4Addr },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "hopwire_client=trace,hopwire_common=debug"
    } else {
        "hopwire_client=info,hopwire_common=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("╔════════════════════════════════════════╗");
    info!("║   Hopwire Client v{}                ║", env!("CARGO_PKG_VERSION"));
    info!("╚════════════════════════════════════════╝");

    let config = ClientConfig::load(&args.config).unwrap_or_else(|_| {
        warn!("Config file not found, using defaults");
        ClientConfig::default()
    });
    let mut route = config.fixed_route.unwrap_or_else(|| config.default_route());
    if let Some(gateway) = args.gateway {
        route.gateway = gateway;
    }
    if let Some(forward) = args.forward {
        route.forward = forward;
    }

    let client = Client::bind(config).await?;
    let control = client.clone();
    let receiver = tokio::spawn(async move { control.serve_control().await });

    let result = run_command(&client, args.command, route).await;
    receiver.abort();
    result
}

async fn run_command(client: &Client, command: Command, route: RoutePair) -> Result<()> {
    match command {
        Command::Ping { count } => {
            info!("📡 Pinging gateway {} and forward {}", route.gateway, route.forward);
            for seq in 0..count {
                let gateway = client.ping(Kind::PingGateway, route).await;
                let forward = client.ping(Kind::PingForward, route).await;
                match (gateway, forward) {
                    (Ok(g), Ok(f)) => info!("#{} gateway {:?}, forward {:?}", seq, g, f),
                    (Err(e), _) | (_, Err(e)) => warn!("#{} {}", seq, e),
                }
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
        Command::Loss => {
            let report = client.packet_loss(route).await?;
            info!("📊 Packet loss");
            info!("   client  -> gateway: {}%", report.client_gateway);
            info!("   gateway -> forward: {}%", report.gateway_forward);
            info!("   forward -> gateway: {}%", report.forward_gateway);
            info!("   gateway -> client:  {}%", report.gateway_client);
        }
        Command::Locate => {
            let locations = client.locate(route).await?;
            match locations.gateway {
                Some(c) => info!("📍 Gateway {} at {:.4}, {:.4}", route.gateway, c.lat, c.lon),
                None => info!("📍 Gateway {} has no location", route.gateway),
            }
            match locations.forward {
                Some(c) => info!("📍 Forward {} at {:.4}, {:.4}", route.forward, c.lat, c.lon),
                None => info!("📍 Forward {} has no location", route.forward),
            }
        }
        Command::Route { server } => {
            let routes = client.routes();
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
            loop {
                match routes.match_route(server, true) {
                    Ok(pair) => {
                        info!("🧭 {} -> gateway {} forward {}", server, pair.gateway, pair.forward);
                        break;
                    }
                    Err(e) if e.is_temporary() => {
                        if tokio::time::Instant::now() >= deadline {
                            bail!("route probe for {} timed out", server);
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(())
}
