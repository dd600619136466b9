// Ruisseau Linux daemon: multicast bus, local library, catalog and file exchange.

mod bus;
mod config;
mod library;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ruisseau_core::engine::{self, EngineHandle, EngineOptions, FileReceived};
use ruisseau_core::protocol::BROADCAST;
use ruisseau_core::{CoreConfig, FsStore, LocalLibrary, ProtocolCore};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::library::Library;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const TICK_INTERVAL: Duration = Duration::from_secs(1);
const FETCH_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, Default, PartialEq)]
struct Args {
    version: bool,
    config: Option<PathBuf>,
    fetch: Vec<String>,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut out = Args::default();
        let mut it = args.into_iter();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--version" | "-V" => out.version = true,
                "--config" | "-c" => {
                    out.config = Some(it.next().map(PathBuf::from).context("--config needs a path")?)
                }
                "--fetch" => out.fetch.push(it.next().context("--fetch needs a hash")?),
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }
        Ok(out)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;
    if args.version {
        println!("ruisseau {}", VERSION);
        return Ok(());
    }

    let cfg = config::load(args.config.as_deref())?;
    init_logging(&cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, args.fetch))
}

fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cfg: Config, fetch: Vec<String>) -> anyhow::Result<()> {
    let group: Ipv4Addr = cfg
        .multicast_group
        .parse()
        .with_context(|| format!("invalid multicast_group {:?}", cfg.multicast_group))?;

    let entries = cfg.library.clone();
    let library = Arc::new(tokio::task::spawn_blocking(move || Library::load(&entries)).await?);
    tracing::info!(peer = %cfg.peer_name, songs = library.len(), "library loaded");

    let bus = bus::UdpBus::bind(group, cfg.bus_port)
        .await
        .with_context(|| format!("cannot join bus {}:{}", group, cfg.bus_port))?;

    let mut core_cfg = CoreConfig::new(cfg.peer_name.clone(), cfg.download_dir.clone());
    core_cfg.dialect = cfg.dialect();
    core_cfg.stall = cfg.stall_policy();
    let core = ProtocolCore::new(core_cfg, library.clone());
    let options = EngineOptions {
        topic: cfg.topic.clone(),
        tick_interval: TICK_INTERVAL,
        chunk_delay: cfg.chunk_delay(),
        announce_on_start: true,
    };
    let (handle, engine_task) = engine::spawn(core, Arc::new(bus), Arc::new(FsStore), options)?;

    handle.ask_online().await?;
    handle.request_catalog(BROADCAST).await?;

    tokio::spawn(record_downloads(
        handle.clone(),
        handle.subscribe(),
        library.clone(),
    ));
    let refresh = tokio::spawn(refresh_loop(handle.clone(), cfg.refresh_interval()));
    let fetcher = tokio::spawn(fetch_loop(handle.clone(), library.clone(), fetch));

    shutdown_signal().await?;
    tracing::info!("shutting down");
    refresh.abort();
    fetcher.abort();
    if handle.shutdown().await.is_ok() {
        let _ = engine_task.await;
    }
    Ok(())
}

/// Re-announce and re-request catalogs periodically.
async fn refresh_loop(handle: EngineHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if handle.announce().await.is_err() || handle.request_catalog(BROADCAST).await.is_err() {
            return;
        }
        let (Ok(peers), Ok(songs)) = (handle.online_peers().await, handle.aggregated_catalog().await)
        else {
            return;
        };
        tracing::info!(peers = peers.len(), songs = songs.len(), "network refreshed");
    }
}

/// Request every `--fetch` hash once some peer offers it.
async fn fetch_loop(handle: EngineHandle, library: Arc<Library>, mut pending: Vec<String>) {
    pending.retain(|hash| library.path_of(hash).is_none());
    while !pending.is_empty() {
        tokio::time::sleep(FETCH_RETRY).await;
        let mut waiting = Vec::new();
        for hash in pending {
            let Ok(peers) = handle.peers_offering(&hash).await else {
                return;
            };
            match peers.first() {
                Some(peer) => {
                    tracing::info!(hash = %hash, peer = %peer, "fetching");
                    if handle.request_media(peer, &hash).await.is_err() {
                        return;
                    }
                }
                None => waiting.push(hash),
            }
        }
        pending = waiting;
    }
}

/// Share every received file from now on.
async fn record_downloads(
    handle: EngineHandle,
    mut received: broadcast::Receiver<FileReceived>,
    library: Arc<Library>,
) {
    loop {
        match received.recv().await {
            Ok(FileReceived { hash, path }) => {
                let song = match handle.known_song(&hash).await {
                    Ok(Some(song)) => song,
                    Ok(None) => {
                        let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                        library::song_for_download(&hash, &path, size)
                    }
                    Err(_) => return,
                };
                tracing::info!(hash = %hash, path = %path.display(), "download complete, now sharing");
                library.add(song, path);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "missed download notifications");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
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
