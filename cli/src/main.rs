// meshbeacon — replication beacon node CLI
//
// Cross-platform (macOS, Linux, Windows) command-line interface for MeshBeacon.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshbeacon_core::beacon::{decode_list, BeaconParser, BeaconRouter, BeaconServerFactory};
use meshbeacon_core::bridge::ConnectionBridge;
use meshbeacon_core::clock::{Clock, SystemClock};
use meshbeacon_core::identity::{LocalKeyPair, PeerId, PeerPublicKey};
use meshbeacon_core::notify::ReplicationNotifier;
use meshbeacon_core::store::SledChangeFeed;
use meshbeacon_core::transport::{
    run_bridge_loop, DiscoveryConfig, HostEvent, PeerDiscoveryFacade, TransportType,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "meshbeacon")]
#[command(about = "MeshBeacon — encrypted replication beacons and peer bridging", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate this node's key pair
    Keygen {
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },
    /// Show this node's public key
    Identity,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Serve beacons for peers with pending changes
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Peer public key (hex) to announce to from the start
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
    /// Record a change shared with peers (run while the node is stopped)
    Publish {
        doc_id: String,
        /// Peer public key (hex) the document is shared with
        #[arg(long = "to", required = true)]
        audience: Vec<String>,
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Fetch a beacon endpoint and list beacons addressed to this node
    Scan { url: String },
    /// Bridge a TCP link to a remote peer onto a local port
    Bridge {
        /// Remote address acting as the native transport
        addr: String,
        /// Remote peer's public key (hex)
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "remote")]
        peer: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Keygen { force } => cmd_keygen(force),
        Commands::Identity => cmd_identity(),
        Commands::Config { action } => cmd_config(action),
        Commands::Serve { port, peers } => cmd_serve(port, peers).await,
        Commands::Publish {
            doc_id,
            audience,
            body,
        } => cmd_publish(doc_id, audience, body).await,
        Commands::Scan { url } => cmd_scan(url).await,
        Commands::Bridge { addr, key, peer } => cmd_bridge(addr, key, peer).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

fn identity_file(config: &config::Config) -> Result<PathBuf> {
    Ok(config.storage_dir()?.join("identity.key"))
}

fn load_identity(config: &config::Config) -> Result<LocalKeyPair> {
    let path = identity_file(config)?;
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("No identity at {}; run `meshbeacon keygen`", path.display()))?;
    LocalKeyPair::from_secret_hex(contents.trim()).context("Identity file is corrupt")
}

fn parse_keys(keys: &[String]) -> Result<Vec<PeerPublicKey>> {
    keys.iter()
        .map(|k| {
            k.parse::<PeerPublicKey>()
                .with_context(|| format!("Invalid peer public key: {}", k))
        })
        .collect()
}

fn cmd_keygen(force: bool) -> Result<()> {
    let config = config::Config::load()?;
    let path = identity_file(&config)?;
    if path.exists() && !force {
        anyhow::bail!(
            "Identity already exists at {} (use --force to replace it)",
            path.display()
        );
    }

    let key = LocalKeyPair::generate();
    std::fs::write(&path, hex::encode(*key.secret_bytes())).context("Failed to write identity")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict identity permissions")?;
    }

    println!("{} Identity created", "✓".green());
    println!("  Public Key: {}", key.public_key().to_hex().bright_yellow());
    println!("  Stored in:  {}", path.display().to_string().bright_cyan());
    Ok(())
}

fn cmd_identity() -> Result<()> {
    let config = config::Config::load()?;
    let key = load_identity(&config)?;
    println!("{}", "Identity Information".bold());
    println!("  Public Key: {}", key.public_key().to_hex().bright_yellow());
    Ok(())
}

// ============================================================================
// CONFIG
// ============================================================================

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

// ============================================================================
// BEACONS
// ============================================================================

fn open_store(config: &config::Config) -> Result<SledChangeFeed> {
    let path = config.storage_dir()?.join("store");
    SledChangeFeed::open(&path).with_context(|| format!("Failed to open store at {}", path.display()))
}

async fn cmd_serve(port: Option<u16>, peers: Vec<String>) -> Result<()> {
    let config = config::Config::load()?;
    let key = load_identity(&config)?;
    let initial = parse_keys(&peers)?;
    let feed = Arc::new(open_store(&config)?);

    let router = BeaconRouter::new();
    let notifier = ReplicationNotifier::builder()
        .router(router.clone())
        .local_key(key.clone())
        .expiration_ms(config.expiration_ms)
        .store(feed.clone())
        .factory(Arc::new(
            BeaconServerFactory::new().with_path(config.beacon_path.clone()),
        ))
        .config(config.notifier_config())
        .build()?;

    notifier.start(Some(initial)).await?;

    let port = port.unwrap_or(config.http_port);
    let (addr, server) = warp::serve(router.filter())
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .context("Failed to bind beacon endpoint")?;

    println!("{}", "MeshBeacon node running".bold());
    println!("  Public Key: {}", key.public_key().to_hex().bright_yellow());
    println!(
        "  Beacons:    {}",
        format!("http://{}{}", addr, config.beacon_path).bright_cyan()
    );
    println!("  Press Ctrl+C to stop");

    server.await;

    println!();
    println!("Shutting down...");
    notifier.stop().await?;
    feed.flush().await?;
    Ok(())
}

async fn cmd_publish(doc_id: String, audience: Vec<String>, body: String) -> Result<()> {
    let config = config::Config::load()?;
    let audience = parse_keys(&audience)?;
    let feed = open_store(&config)?;

    let cursor = feed.record_change(&doc_id, audience.clone(), body.as_bytes())?;
    feed.flush().await?;

    println!(
        "{} Recorded change {} for {} ({} peer(s))",
        "✓".green(),
        cursor.0,
        doc_id.bright_cyan(),
        audience.len()
    );
    Ok(())
}

async fn cmd_scan(url: String) -> Result<()> {
    let config = config::Config::load()?;
    let key = load_identity(&config)?;

    let fetch_url = url.clone();
    let body = tokio::task::spawn_blocking(move || -> Result<String> {
        let response = ureq::get(&fetch_url).call().context("Beacon fetch failed")?;
        response.into_string().context("Failed to read beacon list")
    })
    .await
    .context("Fetch task failed")??;

    let total = decode_list(&body)?.len();
    let now = SystemClock.now_ms();
    let found = BeaconParser::new(key).parse_list(&body, now);

    println!("{}", format!("Beacons at {}", url).bold());
    println!("  Served:       {}", total);
    println!("  For this node: {}", found.len().to_string().bright_green());
    for beacon in &found {
        let remaining = beacon.expires_at.saturating_sub(now) / 1000;
        println!(
            "  • from {} (data available: {}, expires in {}s)",
            beacon.sender.to_hex().bright_yellow(),
            beacon.data_available(),
            remaining
        );
    }
    Ok(())
}

// ============================================================================
// BRIDGE
// ============================================================================

async fn cmd_bridge(addr: String, key: String, peer: String) -> Result<()> {
    let config = config::Config::load()?;
    let public_key: PeerPublicKey = key.parse().context("Invalid peer public key")?;
    let peer = PeerId::new(peer);

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let bridge = ConnectionBridge::new(config.bridge_config()?)?;
    let (facade, events) = PeerDiscoveryFacade::new(DiscoveryConfig::default())?;
    let (host_tx, mut host_rx) = mpsc::channel(16);
    let bridge_loop = tokio::spawn(run_bridge_loop(events, bridge.clone(), host_tx));

    facade
        .connection_established(peer.clone(), public_key, TransportType::Local, stream)
        .await?;

    match host_rx.recv().await {
        Some(HostEvent::LocalPort { port, .. }) => {
            println!("{} Bridged {} via {}", "✓".green(), peer, addr);
            println!(
                "  Local port: {}",
                format!("127.0.0.1:{}", port).bright_cyan()
            );
            println!("  Press Ctrl+C to stop");
        }
        Some(HostEvent::ConnectFailed { reason, .. }) => anyhow::bail!("Bridge failed: {}", reason),
        other => anyhow::bail!("Unexpected bridge event: {:?}", other),
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                if bridge.port_for(&peer).is_none() {
                    println!("{}", "Bridge closed".yellow());
                    break;
                }
            }
        }
    }

    drop(facade);
    bridge_loop.await.context("Bridge loop failed")?;
    Ok(())
}
