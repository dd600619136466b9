//! Engine: one task owns the [`ProtocolCore`]; bus messages, user commands and ticks are all
//! serialized through it. Effects are executed against a [`Transport`] and a [`FileStore`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::chunk::{self, TransferProgress};
use crate::core::{Effect, ProtocolCore};
use crate::protocol::{Message, Song, WireDialect, CHUNK_SIZE, DEFAULT_TOPIC};
use crate::store::FileStore;
use crate::transport::{Inbox, Transport, TransportError};
use crate::wire;

const COMMAND_QUEUE: usize = 128;
const EVENT_QUEUE: usize = 64;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine channel closed")]
    ChannelClosed,
    #[error("failed to subscribe to bus: {0}")]
    Subscribe(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub topic: String,
    /// Period of the logical clock driving the stall policy.
    pub tick_interval: Duration,
    /// Pause between consecutive chunk publishes.
    pub chunk_delay: Duration,
    /// Publish `online` as soon as the engine starts.
    pub announce_on_start: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            tick_interval: Duration::from_secs(1),
            chunk_delay: Duration::from_millis(10),
            announce_on_start: true,
        }
    }
}

/// A file was assembled, verified and written to `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReceived {
    pub hash: String,
    pub path: PathBuf,
}

#[derive(Debug)]
enum Command {
    Announce,
    AskOnline,
    RequestCatalog {
        target: String,
    },
    PushCatalog {
        recipient: String,
    },
    RequestMedia {
        peer: String,
        hash: String,
    },
    PushFullFile {
        recipient: String,
        hash: String,
    },
    OnlinePeers {
        reply: oneshot::Sender<Vec<String>>,
    },
    Catalog {
        peer: String,
        reply: oneshot::Sender<Vec<Song>>,
    },
    AggregatedCatalog {
        reply: oneshot::Sender<Vec<(Song, String)>>,
    },
    PeersOffering {
        hash: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    KnownSong {
        hash: String,
        reply: oneshot::Sender<Option<Song>>,
    },
    Transfers {
        reply: oneshot::Sender<Vec<TransferProgress>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end used by the UI layer. Intents return as soon as they are queued.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<FileReceived>,
}

impl EngineHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn announce(&self) -> Result<()> {
        self.send(Command::Announce).await
    }

    pub async fn ask_online(&self) -> Result<()> {
        self.send(Command::AskOnline).await
    }

    pub async fn request_catalog(&self, target: &str) -> Result<()> {
        self.send(Command::RequestCatalog {
            target: target.to_string(),
        })
        .await
    }

    pub async fn push_catalog(&self, recipient: &str) -> Result<()> {
        self.send(Command::PushCatalog {
            recipient: recipient.to_string(),
        })
        .await
    }

    pub async fn request_media(&self, peer: &str, hash: &str) -> Result<()> {
        self.send(Command::RequestMedia {
            peer: peer.to_string(),
            hash: hash.to_string(),
        })
        .await
    }

    pub async fn push_full_file(&self, recipient: &str, hash: &str) -> Result<()> {
        self.send(Command::PushFullFile {
            recipient: recipient.to_string(),
            hash: hash.to_string(),
        })
        .await
    }

    pub async fn online_peers(&self) -> Result<Vec<String>> {
        self.query(|reply| Command::OnlinePeers { reply }).await
    }

    pub async fn catalog(&self, peer: &str) -> Result<Vec<Song>> {
        let peer = peer.to_string();
        self.query(|reply| Command::Catalog { peer, reply }).await
    }

    pub async fn aggregated_catalog(&self) -> Result<Vec<(Song, String)>> {
        self.query(|reply| Command::AggregatedCatalog { reply })
            .await
    }

    pub async fn peers_offering(&self, hash: &str) -> Result<Vec<String>> {
        let hash = hash.to_string();
        self.query(|reply| Command::PeersOffering { hash, reply })
            .await
    }

    pub async fn known_song(&self, hash: &str) -> Result<Option<Song>> {
        let hash = hash.to_string();
        self.query(|reply| Command::KnownSong { hash, reply }).await
    }

    pub async fn transfers(&self) -> Result<Vec<TransferProgress>> {
        self.query(|reply| Command::Transfers { reply }).await
    }

    /// Notifications for every file received from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FileReceived> {
        self.events.subscribe()
    }

    /// Stop the engine task. Transfers in flight are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.query(|reply| Command::Shutdown { reply }).await
    }
}

/// Subscribe to the bus and start the engine task. Must be called inside a tokio runtime.
pub fn spawn(
    core: ProtocolCore,
    transport: Arc<dyn Transport>,
    store: Arc<dyn FileStore>,
    options: EngineOptions,
) -> Result<(EngineHandle, JoinHandle<()>)> {
    let inbox = transport.subscribe(&options.topic)?;
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let (events, _) = broadcast::channel(EVENT_QUEUE);
    let engine = Engine {
        core,
        transport,
        store,
        options,
        events: events.clone(),
    };
    let join = tokio::spawn(engine.run(rx, inbox));
    Ok((EngineHandle { tx, events }, join))
}

struct Engine {
    core: ProtocolCore,
    transport: Arc<dyn Transport>,
    store: Arc<dyn FileStore>,
    options: EngineOptions,
    events: broadcast::Sender<FileReceived>,
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut inbox: Inbox) {
        tracing::info!(peer = %self.core.peer_id(), topic = %self.options.topic, "engine started");
        let mut ticker = tokio::time::interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        if self.options.announce_on_start {
            let msg = self.core.announce();
            self.publish(&msg);
        }

        let mut inbox_open = true;
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                raw = inbox.recv(), if inbox_open => match raw {
                    Some(raw) => {
                        let effects = self.core.on_message(&raw);
                        self.execute(effects);
                    }
                    None => {
                        tracing::warn!("bus subscription closed; no more inbound messages");
                        inbox_open = false;
                    }
                },
                _ = ticker.tick() => {
                    let effects = self.core.tick();
                    self.execute(effects);
                }
            }
        }
        tracing::info!(peer = %self.core.peer_id(), "engine stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Announce => {
                let msg = self.core.announce();
                self.publish(&msg);
            }
            Command::AskOnline => {
                let msg = self.core.ask_online();
                self.publish(&msg);
            }
            Command::RequestCatalog { target } => {
                let msg = self.core.request_catalog(&target);
                self.publish(&msg);
            }
            Command::PushCatalog { recipient } => {
                let msg = self.core.push_catalog(&recipient);
                self.publish(&msg);
            }
            Command::RequestMedia { peer, hash } => {
                let msg = self.core.request_media(&peer, &hash);
                self.publish(&msg);
            }
            Command::PushFullFile { recipient, hash } => {
                let effects = self.core.push_full_file(&recipient, &hash);
                self.execute(effects);
            }
            Command::OnlinePeers { reply } => {
                let _ = reply.send(self.core.online_peers());
            }
            Command::Catalog { peer, reply } => {
                let _ = reply.send(self.core.catalog(&peer));
            }
            Command::AggregatedCatalog { reply } => {
                let _ = reply.send(self.core.aggregated_catalog());
            }
            Command::PeersOffering { hash, reply } => {
                let _ = reply.send(self.core.peers_offering(&hash));
            }
            Command::KnownSong { hash, reply } => {
                let _ = reply.send(self.core.known_song(&hash));
            }
            Command::Transfers { reply } => {
                let _ = reply.send(self.core.transfers());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn execute(&self, effects: impl IntoIterator<Item = Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(msg) => self.publish(&msg),
                Effect::ServeFile {
                    recipient,
                    hash,
                    path,
                } => self.spawn_serve(recipient, hash, path),
                Effect::SaveFile { hash, path, bytes } => self.spawn_save(hash, path, bytes),
            }
        }
    }

    fn publish(&self, msg: &Message) {
        publish(self.transport.as_ref(), &self.options.topic, msg);
    }

    fn spawn_serve(&self, recipient: String, hash: String, path: PathBuf) {
        let sender = self.core.peer_id().to_string();
        let dialect = self.core.config().dialect;
        let transport = self.transport.clone();
        let store = self.store.clone();
        let topic = self.options.topic.clone();
        let delay = self.options.chunk_delay;
        tokio::spawn(async move {
            let read_path = path.clone();
            let bytes = match tokio::task::spawn_blocking(move || store.read(&read_path)).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    tracing::debug!(path = %path.display(), error = %e, "local file unavailable");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "file read task failed");
                    return;
                }
            };
            serve_chunks(
                transport.as_ref(),
                &topic,
                &sender,
                &recipient,
                &hash,
                &bytes,
                dialect,
                delay,
            )
            .await;
        });
    }

    fn spawn_save(&self, hash: String, path: PathBuf, bytes: Vec<u8>) {
        let store = self.store.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let write_path = path.clone();
            match tokio::task::spawn_blocking(move || store.write(&write_path, &bytes)).await {
                Ok(Ok(())) => {
                    tracing::info!(hash = %hash, path = %path.display(), "file received");
                    let _ = events.send(FileReceived { hash, path });
                }
                Ok(Err(e)) => {
                    tracing::warn!(hash = %hash, path = %path.display(), error = %e, "failed to save received file");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "file write task failed");
                }
            }
        });
    }
}

/// Encode and publish; failures and a disconnected transport drop the message.
fn publish(transport: &dyn Transport, topic: &str, msg: &Message) {
    if !transport.is_connected() {
        tracing::debug!(action = %msg.action, "transport disconnected; dropping message");
        return;
    }
    let bytes = match wire::encode(msg) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(action = %msg.action, error = %e, "failed to encode message");
            return;
        }
    };
    match transport.publish(topic, bytes) {
        Ok(()) => {}
        Err(TransportError::TooLarge(len)) => {
            let songs = msg.song_list.as_ref().map_or(0, Vec::len);
            tracing::warn!(action = %msg.action, len, songs, "message too large for the bus; dropped");
        }
        Err(e) => {
            tracing::warn!(action = %msg.action, error = %e, "publish failed; message dropped");
        }
    }
}

/// Publish `bytes` to `recipient` one chunk per message, in order.
#[allow(clippy::too_many_arguments)]
async fn serve_chunks(
    transport: &dyn Transport,
    topic: &str,
    sender: &str,
    recipient: &str,
    hash: &str,
    bytes: &[u8],
    dialect: WireDialect,
    delay: Duration,
) {
    let chunks = chunk::split(bytes, CHUNK_SIZE);
    tracing::info!(recipient, hash, chunks = chunks.len(), "serving file");
    for (i, payload) in chunks.iter().enumerate() {
        let start = (i * CHUNK_SIZE) as u64;
        let msg = Message::media_chunk(sender, recipient, hash, start, payload, dialect);
        publish(transport, topic, &msg);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
