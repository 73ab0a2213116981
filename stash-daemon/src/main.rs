//! remotestash: serve this device's stash on the LAN, or push to and pull from a peer's.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stash_core::{identity, mime, Item, PeerDescriptor, PeerNotification};
use stash_daemon::config::{self, Config};
use stash_daemon::discovery::{spawn_registry, Advertiser, RegistryConfig};
use stash_daemon::server::{Server, StashState};
use stash_daemon::session::PeerSession;
use stash_daemon::{Pulled, VERSION};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

/// RemoteStash
#[derive(Parser, Debug)]
#[command(name = "remotestash")]
#[command(about = "Share one item at a time with devices on the local network")]
#[command(version = VERSION)]
struct Args {
    /// Config file (default ~/.config/remotestash/config.toml, then /etc/remotestash/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Talk to this peer directly instead of browsing (ip:port)
    #[arg(long, global = true)]
    host: Option<SocketAddr>,

    /// Only use a discovered peer advertising this name
    #[arg(short, long, global = true)]
    peer: Option<String>,

    /// How long to browse for peers, in milliseconds
    #[arg(long, global = true, default_value = "2000")]
    wait_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Advertise this device and serve its stash until interrupted
    Serve {
        /// Advertised name
        #[arg(short, long)]
        name: Option<String>,

        /// Transfer port (0 picks a free one)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Push a file, or stdin as text, to the peer
    Push {
        file: Option<PathBuf>,

        /// Send the bytes as-is under this content type instead of typing the file by
        /// its extension (stdin defaults to UTF-8 text)
        #[arg(short = 't', long)]
        content_type: Option<String>,
    },

    /// Fetch the peer's current item
    Pull {
        /// Write the item here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fetch the peer's current item, bypassing any conditional check
    Last {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show what the peer holds
    Status,

    /// List stashes on the local network
    List,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stash_daemon=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args, cfg))
}

async fn run(args: Args, mut cfg: Config) -> Result<()> {
    let wait = Duration::from_millis(args.wait_ms);
    match args.command {
        Commands::Serve { name, port } => {
            if let Some(name) = name {
                cfg.name = name;
            }
            if let Some(port) = port {
                cfg.port = port;
            }
            serve(cfg).await
        }
        Commands::List => list(&cfg, wait).await,
        Commands::Push {
            file,
            content_type,
        } => {
            let mut session = connect(&cfg, args.host, args.peer.as_deref(), wait).await?;
            let ack = match (file, content_type) {
                (Some(path), None) => session.push(&Item::from_path(&path)?).await?,
                (file, content_type) => {
                    let body = read_input(file).await?;
                    let ct = content_type.unwrap_or_else(|| mime::TEXT_PLAIN_UTF8.to_string());
                    session.push_raw(body, &ct).await?
                }
            };
            tracing::info!(
                peer = %session.descriptor().name,
                items_count = ack.items_count,
                "pushed"
            );
            Ok(())
        }
        Commands::Pull { output } => {
            let mut session = connect(&cfg, args.host, args.peer.as_deref(), wait).await?;
            write_item(session.pull().await?, output)
        }
        Commands::Last { output } => {
            let mut session = connect(&cfg, args.host, args.peer.as_deref(), wait).await?;
            write_item(session.last().await?, output)
        }
        Commands::Status => {
            let mut session = connect(&cfg, args.host, args.peer.as_deref(), wait).await?;
            session.refresh_status().await?;
            let a = session.availability();
            println!("peer:        {}", session.descriptor().name);
            if let Some(id) = a.identity() {
                println!("identity:    {}", id);
            }
            println!("items_count: {}", a.items_count().unwrap_or(0));
            println!("content:     {}", a.content_type().unwrap_or("(empty)"));
            Ok(())
        }
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let path = cfg.identity_path();
    let identity = identity::load_or_create(&path)
        .with_context(|| format!("loading device identity from {}", path.display()))?;
    let state = Arc::new(StashState::new(identity));
    let server = Server::bind(SocketAddr::from(([0, 0, 0, 0], cfg.port)), state).await?;
    let port = server.local_addr()?.port();
    let server_task = tokio::spawn(server.run());

    let mut advertiser = Advertiser::new(cfg.name.clone(), identity, port, cfg.discovery_port);
    if let Err(e) = advertiser.start().await {
        // Still reachable with --host.
        tracing::error!("{}; serving without advertising", e);
    }

    shutdown_signal().await?;
    tracing::info!("shutting down");
    advertiser.stop().await;
    server_task.abort();
    Ok(())
}

/// Registry config that hides this device's own advertisement.
fn registry_config(cfg: &Config) -> RegistryConfig {
    let own = match identity::load_or_create(&cfg.identity_path()) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!("{}; own advertisement may be listed", e);
            None
        }
    };
    RegistryConfig::from_config(cfg, own)
}

async fn list(cfg: &Config, wait: Duration) -> Result<()> {
    let (registry, _notes) = spawn_registry(registry_config(cfg));
    registry.start_browsing().await?;
    tokio::time::sleep(wait).await;
    let peers: Vec<PeerDescriptor> = registry
        .snapshot()
        .await?
        .into_iter()
        .filter(|p| p.is_ready())
        .collect();
    if peers.is_empty() {
        println!("no stash found on the local network");
    }
    for p in peers {
        let host = p.host.map(|h| h.to_string()).unwrap_or_default();
        let id = p.identity.map(|i| i.to_string()).unwrap_or_default();
        println!("{}\t{}\t{}", p.name, host, id);
    }
    Ok(())
}

/// Session with the `--host` peer, or the first matching peer found by browsing.
async fn connect(
    cfg: &Config,
    host: Option<SocketAddr>,
    name: Option<&str>,
    wait: Duration,
) -> Result<PeerSession> {
    let (registry, mut notes) = spawn_registry(registry_config(cfg));
    if let Some(host) = host {
        let name = name.map(str::to_string);
        let session = PeerSession::open_manual(&registry, name, host, cfg.request_timeout()).await?;
        return Ok(session);
    }
    registry.start_browsing().await?;
    let peer = wait_for_peer(&mut notes, name, wait).await?;
    registry.select(peer.key()).await?;
    registry.stop_browsing()?;
    tracing::debug!(name = %peer.name, host = ?peer.host, "using peer");
    Ok(PeerSession::new(peer, cfg.request_timeout()))
}

async fn wait_for_peer(
    notes: &mut mpsc::UnboundedReceiver<PeerNotification>,
    name: Option<&str>,
    wait: Duration,
) -> Result<PeerDescriptor> {
    let found = tokio::time::timeout(wait, async {
        while let Some(note) = notes.recv().await {
            let peer = match note {
                PeerNotification::Added(p) | PeerNotification::Updated { peer: p, .. } => p,
                _ => continue,
            };
            if peer.is_ready() && name.map_or(true, |n| n == peer.name) {
                return Some(peer);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(peer)) => Ok(peer),
        _ => match name {
            Some(n) => bail!("no stash named {:?} found on the local network", n),
            None => bail!("no stash found on the local network"),
        },
    }
}

/// Raw bytes of `file`, or of stdin.
async fn read_input(file: Option<PathBuf>) -> Result<Vec<u8>> {
    match file {
        Some(path) => std::fs::read(&path).with_context(|| format!("reading {}", path.display())),
        None => tokio::task::spawn_blocking(|| {
            let mut body = Vec::new();
            std::io::stdin().read_to_end(&mut body).map(|_| body)
        })
        .await?
        .context("reading stdin"),
    }
}

fn write_item(pulled: Pulled, output: Option<PathBuf>) -> Result<()> {
    let item = match pulled {
        Pulled::Item(item) => item,
        Pulled::Empty => {
            eprintln!("stash is empty");
            return Ok(());
        }
        Pulled::Unchanged => {
            eprintln!("nothing new");
            return Ok(());
        }
    };
    let encoded = item.encode()?;
    if let Some(path) = output {
        std::fs::write(&path, &encoded.body)
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), content_type = encoded.content_type, "saved");
        return Ok(());
    }
    let mut out = std::io::stdout().lock();
    match &item {
        Item::Text(s) => out.write_all(s.as_bytes())?,
        Item::Structured(map) => {
            serde_json::to_writer_pretty(&mut out, map)?;
            out.write_all(b"\n")?;
        }
        Item::Image(_) => bail!("the stash holds an image; use --output FILE"),
    }
    out.flush()?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
        assert_eq!(Args::command().get_version(), Some(VERSION));
    }

    #[test]
    fn host_applies_to_any_subcommand() {
        let args =
            Args::try_parse_from(["remotestash", "pull", "--host", "127.0.0.1:4000"]).unwrap();
        assert_eq!(args.host, Some(SocketAddr::from(([127, 0, 0, 1], 4000))));
        assert!(matches!(args.command, Commands::Pull { output: None }));
    }
}
