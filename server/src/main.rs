use anyhow::Result;
use clap::{Parser, Subcommand};
use hopwire_common::{PeerSummary, Stats};
use hopwire_server::{Forward, ForwardConfig, Gateway, GatewayConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hopwire-server")]
#[command(about = "Hopwire - multi-hop game traffic relay", long_about = None)]
struct Args {
    #[command(subcommand)]
    role: Role,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Seconds between statistics summaries (0 disables them)
    #[arg(long, global = true, default_value_t = 30)]
    stats_interval: u64,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Player-facing relay
    Gateway {
        #[arg(short, long, default_value = "gateway.toml")]
        config: String,

        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Server-facing relay
    Forward {
        #[arg(short, long, default_value = "forward.toml")]
        config: String,

        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "hopwire_server=trace,hopwire_common=debug"
    } else {
        "hopwire_server=info,hopwire_common=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("╔════════════════════════════════════════╗");
    info!("║   Hopwire Server v{}                ║", env!("CARGO_PKG_VERSION"));
    info!("╚════════════════════════════════════════╝");

    match args.role {
        Role::Gateway { config, listen } => {
            let mut config = GatewayConfig::load(&config).unwrap_or_else(|_| {
                warn!("Config file not found, using defaults");
                GatewayConfig::default()
            });
            if let Some(listen) = listen {
                config.listen = listen;
            }
            info!("🚀 Starting gateway on {}", config.listen);
            info!("🔁 Redundancy: {}x", config.redundancy);

            let gateway = Gateway::bind(config).await?;
            {
                let gateway = gateway.clone();
                spawn_stats("Gateway", args.stats_interval, move || {
                    (gateway.metrics().get_stats(), gateway.peer_summary())
                });
            }

            tokio::select! {
                r = gateway.run() => r?,
                _ = tokio::signal::ctrl_c() => info!("🛑 Shutting down gateway"),
            }
        }
        Role::Forward { config, listen } => {
            let mut config = ForwardConfig::load(&config).unwrap_or_else(|_| {
                warn!("Config file not found, using defaults");
                ForwardConfig::default()
            });
            if let Some(listen) = listen {
                config.listen = listen;
            }
            info!("🚀 Starting forward on {}", config.listen);
            info!("🔗 Max links: {}", config.max_links);

            let forward = Forward::bind(config).await?;
            {
                let forward = forward.clone();
                spawn_stats("Forward", args.stats_interval, move || {
                    (forward.metrics().get_stats(), forward.peer_summary())
                });
            }

            tokio::select! {
                r = forward.run() => r?,
                _ = tokio::signal::ctrl_c() => info!("🛑 Shutting down forward"),
            }
            forward.shutdown();
        }
    }

    Ok(())
}

fn spawn_stats<F>(role: &'static str, every: u64, snapshot: F)
where
    F: Fn() -> (Stats, Vec<PeerSummary>) + Send + 'static,
{
    if every == 0 {
        return;
    }
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(every)).await;
            let (stats, peers) = snapshot();
            stats.print_summary(role, &peers);
        }
    });
}
