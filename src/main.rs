use clap::{Parser, Subcommand};
use dvpn_client::communication::{DialogEstablisher, HttpDialogEstablisher};
use dvpn_client::connection::DialogEstablisherFactory;
use dvpn_client::discovery::{DiscoveryClient, ProposalResolver};
use dvpn_client::stats::{SessionStatsKeeper, StatsKeeper, StatsReporter};
use dvpn_client::tunnel::openvpn_tunnel_factory;
use dvpn_client::{Config, ConnectionManager, ConnectionState, ConnectionStatus, Identity};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "dvpn-client")]
#[command(about = "Decentralized VPN client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./dvpn-client.toml, then the per-user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a provider and stay connected until Ctrl+C
    Connect {
        /// Local identity address
        #[arg(short, long)]
        identity: String,
        /// Provider identity address
        provider: String,
    },
    /// List the service proposals of a provider
    Proposals {
        /// Provider identity address
        provider: String,
    },
    /// Generate default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG overrides the level picked by --verbose
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Connect { identity, provider } => {
            let config = load_config(cli.config)?;
            connect(&config, Identity::from_address(identity), Identity::from_address(provider))
                .await?;
        }
        Commands::Proposals { provider } => {
            let config = load_config(cli.config)?;
            let client = DiscoveryClient::new(config.discovery.url.as_str());
            let proposals = client
                .find_proposals(&Identity::from_address(provider))
                .await?;
            if proposals.is_empty() {
                println!("No proposals found");
            } else {
                println!("{}", serde_json::to_string_pretty(&proposals)?);
            }
        }
        Commands::Init => {
            info!("Generating default config...");
            let path = cli.config.unwrap_or_else(Config::default_path);
            Config::default().save(&path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => Config::load(&path)?,
        None => Config::discover()?,
    };
    Ok(config)
}

async fn connect(
    config: &Config,
    caller: Identity,
    provider: Identity,
) -> Result<(), Box<dyn std::error::Error>> {
    let stats_keeper = Arc::new(StatsKeeper::new());
    let directory = Arc::new(DiscoveryClient::new(config.discovery.url.as_str()));
    let stats_reporter: Option<Arc<dyn StatsReporter>> = if config.discovery.report_session_stats {
        Some(directory.clone() as Arc<dyn StatsReporter>)
    } else {
        None
    };
    let new_dialog_establisher: DialogEstablisherFactory =
        Arc::new(|caller: &Identity| -> Box<dyn DialogEstablisher> {
            Box::new(HttpDialogEstablisher::new(caller.clone()))
        });
    let manager = ConnectionManager::new(
        directory,
        new_dialog_establisher,
        openvpn_tunnel_factory(config.openvpn_settings(), stats_keeper.clone(), stats_reporter),
        stats_keeper.clone(),
    );

    manager.connect(&caller, &provider).await?;
    println!("Tunnel started, waiting for {}...", provider);

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let outcome = follow_status(|| manager.status(), interrupted, STATUS_POLL_INTERVAL).await;
    if outcome == FollowOutcome::Interrupted {
        info!("Interrupted, disconnecting...");
        if let Err(e) = manager.disconnect().await {
            error!("{}", e);
        }
        if let Err(e) = manager.wait().await {
            error!("{}", e);
        }
    }

    let stats = stats_keeper.retrieve();
    match stats_keeper.session_duration() {
        Some(duration) => println!(
            "Session lasted {}s: {} bytes sent, {} bytes received",
            duration.as_secs(),
            stats.bytes_sent,
            stats.bytes_received
        ),
        None => println!("Disconnected before the tunnel came up"),
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum FollowOutcome {
    Interrupted,
    Disconnected,
}

/// Prints status changes until the connection is gone or `shutdown` fires.
///
/// `shutdown` is created once and polled across iterations so a signal
/// arriving between polls is not lost.
async fn follow_status(
    status: impl Fn() -> ConnectionStatus,
    shutdown: impl Future<Output = ()>,
    poll_interval: Duration,
) -> FollowOutcome {
    tokio::pin!(shutdown);
    let mut last = status();
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = &mut shutdown => return FollowOutcome::Interrupted,
            _ = ticker.tick() => {
                let current = status();
                if current != last {
                    print_status(&current);
                    last = current;
                }
                if last.state == ConnectionState::NotConnected {
                    return FollowOutcome::Disconnected;
                }
            }
        }
    }
}

fn print_status(status: &ConnectionStatus) {
    if status.session_id.is_empty() {
        println!("Status: {}", status.state);
    } else {
        println!("Status: {} (session {})", status.state, status.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_shutdown_between_polls_is_observed() {
        let polls = Arc::new(Mutex::new(0usize));
        let (fire, fired) = oneshot::channel::<()>();

        let counter = polls.clone();
        let status = move || {
            let mut polls = counter.lock().unwrap();
            *polls += 1;
            ConnectionStatus::connected("sess-1")
        };
        let shutdown = async {
            let _ = fired.await;
        };

        let follow = tokio::spawn(async move {
            follow_status(status, shutdown, Duration::from_millis(5)).await
        });
        while *polls.lock().unwrap() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        fire.send(()).unwrap();

        assert_eq!(follow.await.unwrap(), FollowOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_follow_ends_when_not_connected() {
        let statuses = Mutex::new(vec![
            ConnectionStatus::not_connected(),
            ConnectionStatus::disconnecting(),
            ConnectionStatus::connected("sess-1"),
        ]);
        let status = || {
            let mut statuses = statuses.lock().unwrap();
            if statuses.len() > 1 {
                statuses.pop().unwrap()
            } else {
                statuses[0].clone()
            }
        };

        let outcome = follow_status(
            status,
            std::future::pending::<()>(),
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(outcome, FollowOutcome::Disconnected);
    }
}
