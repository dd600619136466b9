//! Host-driven protocol state machine: the host feeds bus messages, user intents and ticks;
//! the core returns effects (publish, serve a file, save a file). No I/O happens here.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::CatalogStore;
use crate::chunk::{self, Assembly, TransferProgress, Transfers};
use crate::integrity;
use crate::peers::PeerRegistry;
use crate::protocol::{is_broadcast, Action, Message, Song, WireDialect, CHUNK_SIZE, UNKNOWN_SIZE};
use crate::wire;

/// Completed hashes remembered so late duplicate chunks are dropped.
const RECENTLY_COMPLETED: usize = 64;

/// Local songs and their files, supplied by the host application.
pub trait LocalLibrary: Send + Sync {
    /// Songs we offer to other peers.
    fn catalog(&self) -> Vec<Song>;
    /// Path of the local file with content hash `hash`, if we have one.
    fn path_of(&self, hash: &str) -> Option<PathBuf>;
}

/// What to do about transfers that stop receiving chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallPolicy {
    /// Ticks without a new chunk before a transfer counts as stalled. 0 disables the policy
    /// and stalled transfers wait forever.
    pub timeout_ticks: u64,
    /// How many times a stalled transfer is requested again before it is abandoned.
    pub max_rerequests: u32,
}

impl StallPolicy {
    pub const DISABLED: StallPolicy = StallPolicy {
        timeout_ticks: 0,
        max_rerequests: 0,
    };

    pub fn is_enabled(&self) -> bool {
        self.timeout_ticks > 0
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Our peer name on the bus.
    pub peer_id: String,
    /// Where assembled files are saved.
    pub download_dir: PathBuf,
    pub dialect: WireDialect,
    pub stall: StallPolicy,
}

impl CoreConfig {
    pub fn new(peer_id: impl Into<String>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            peer_id: peer_id.into(),
            download_dir: download_dir.into(),
            dialect: WireDialect::default(),
            stall: StallPolicy::DISABLED,
        }
    }
}

/// Work for the host to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish a message on the bus.
    Publish(Message),
    /// Read `path`, split it into chunks and publish each to `recipient`.
    ServeFile {
        recipient: String,
        hash: String,
        path: PathBuf,
    },
    /// Write verified bytes to `path`, then report the file as received.
    SaveFile {
        hash: String,
        path: PathBuf,
        bytes: Vec<u8>,
    },
}

/// What an inbound message asks of us, independent of which alias carried it.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Presence { reply: bool },
    CatalogRequest,
    Catalog,
    MediaRequest,
    MediaChunk,
    Ignored,
}

fn classify(msg: &Message) -> Inbound {
    match msg.action {
        Action::Online => Inbound::Presence { reply: false },
        Action::AskOnline => Inbound::Presence { reply: true },
        Action::AskCatalog | Action::RequestCatalog => Inbound::CatalogRequest,
        Action::SendCatalog => Inbound::Catalog,
        Action::AskMedia | Action::AskFile if msg.has_payload() => Inbound::MediaChunk,
        Action::AskMedia | Action::AskFile | Action::MediaRequest => Inbound::MediaRequest,
        Action::SendMedia | Action::SendChunk | Action::MediaChunk => Inbound::MediaChunk,
        Action::Unknown(_) => Inbound::Ignored,
    }
}

/// Bookkeeping for one receive buffer.
struct TransferMeta {
    /// Peer we asked, or the first peer that sent us a chunk.
    source: Option<String>,
    /// We asked for this file; only requested transfers are asked for again when stalled.
    requested: bool,
    size: u64,
    last_progress_tick: u64,
    rerequests: u32,
}

/// Main coordinator. Host passes events; core returns effects.
pub struct ProtocolCore {
    config: CoreConfig,
    library: Arc<dyn LocalLibrary>,
    peers: PeerRegistry,
    catalogs: CatalogStore,
    transfers: Transfers,
    meta: HashMap<String, TransferMeta>,
    completed: VecDeque<String>,
    tick_count: u64,
}

impl ProtocolCore {
    pub fn new(config: CoreConfig, library: Arc<dyn LocalLibrary>) -> Self {
        Self {
            peers: PeerRegistry::new(config.peer_id.clone()),
            config,
            library,
            catalogs: CatalogStore::new(),
            transfers: Transfers::new(CHUNK_SIZE),
            meta: HashMap::new(),
            completed: VecDeque::new(),
            tick_count: 0,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Broadcast that we are online.
    pub fn announce(&self) -> Message {
        Message::online(self.peer_id())
    }

    /// Ask every peer to announce itself.
    pub fn ask_online(&self) -> Message {
        Message::ask_online(self.peer_id())
    }

    /// Ask `target` (or `*`) for its catalog. The answer arrives later through `on_message`.
    pub fn request_catalog(&self, target: &str) -> Message {
        Message::request_catalog(self.peer_id(), target)
    }

    /// Our catalog, addressed to `recipient`.
    pub fn push_catalog(&self, recipient: &str) -> Message {
        Message::send_catalog(self.peer_id(), recipient, self.library.catalog())
    }

    /// Ask `peer` for the whole file `hash` and get ready to receive it.
    pub fn request_media(&mut self, peer: &str, hash: &str) -> Message {
        let size = self
            .catalogs
            .find(hash)
            .map(|s| s.size_bytes)
            .filter(|&s| s > 0)
            .unwrap_or(UNKNOWN_SIZE);
        let key = integrity::normalize_hash(hash);
        self.completed.retain(|h| *h != key);
        self.transfers.start_receiving(&key, size);
        self.meta.insert(
            key,
            TransferMeta {
                source: Some(peer.to_string()),
                requested: true,
                size,
                last_progress_tick: self.tick_count,
                rerequests: 0,
            },
        );
        tracing::info!(peer, hash, size, "requesting media");
        Message::media_request(self.peer_id(), peer, hash, size, self.config.dialect)
    }

    /// Send our copy of `hash` to `recipient`. `None` if we have no such file.
    pub fn push_full_file(&self, recipient: &str, hash: &str) -> Option<Effect> {
        let Some(path) = self.library.path_of(hash) else {
            tracing::debug!(recipient, hash, "no local file for requested hash");
            return None;
        };
        Some(Effect::ServeFile {
            recipient: recipient.to_string(),
            hash: hash.to_string(),
            path,
        })
    }

    /// Process one raw bus payload.
    pub fn on_message(&mut self, raw: &[u8]) -> Vec<Effect> {
        match wire::decode(raw) {
            Ok(msg) => self.on_decoded(msg),
            Err(e) => {
                tracing::warn!(error = %e, len = raw.len(), "discarding malformed message");
                Vec::new()
            }
        }
    }

    /// Process one decoded message.
    pub fn on_decoded(&mut self, msg: Message) -> Vec<Effect> {
        if msg.sender == self.config.peer_id {
            return Vec::new();
        }
        if msg.recipient != self.config.peer_id && !is_broadcast(&msg.recipient) {
            return Vec::new();
        }
        tracing::trace!(action = %msg.action, sender = %msg.sender, "dispatching");

        let mut effects = Vec::new();
        match classify(&msg) {
            Inbound::Presence { reply } => {
                if self.peers.mark_online(&msg.sender) {
                    tracing::info!(peer = %msg.sender, "peer online");
                }
                if reply {
                    effects.push(Effect::Publish(self.announce()));
                }
            }
            Inbound::CatalogRequest => {
                effects.push(Effect::Publish(self.push_catalog(&msg.sender)));
            }
            Inbound::Catalog => {
                if let Some(songs) = msg.song_list {
                    tracing::debug!(peer = %msg.sender, songs = songs.len(), "catalog received");
                    self.catalogs.set_catalog(&msg.sender, songs);
                }
            }
            Inbound::MediaRequest => {
                if let Some(hash) = msg.hash.as_deref().filter(|h| !h.is_empty()) {
                    effects.extend(self.push_full_file(&msg.sender, hash));
                }
            }
            Inbound::MediaChunk => {
                effects.extend(self.on_chunk(&msg));
            }
            Inbound::Ignored => {
                tracing::debug!(action = %msg.action, "ignoring unknown action");
            }
        }
        effects
    }

    fn on_chunk(&mut self, msg: &Message) -> Option<Effect> {
        let (Some(hash), Some(start), Some(data)) =
            (msg.hash.as_deref(), msg.start_byte, msg.song_data.as_deref())
        else {
            tracing::debug!(sender = %msg.sender, "chunk without hash, start or payload");
            return None;
        };
        let payload = match wire::decode_payload(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(sender = %msg.sender, hash, error = %e, "bad chunk payload");
                return None;
            }
        };
        let chunk_size = self.transfers.chunk_size();
        if payload.len() > chunk_size {
            tracing::warn!(hash, len = payload.len(), "chunk larger than chunk size");
            return None;
        }
        let Some(index) = chunk::chunk_index(start, chunk_size) else {
            tracing::warn!(hash, start, "chunk start not aligned to chunk size");
            return None;
        };

        let key = integrity::normalize_hash(hash);
        if self.completed.contains(&key) {
            tracing::trace!(sender = %msg.sender, hash = %key, index, "chunk for completed file");
            return None;
        }
        let size_hint = self
            .catalogs
            .find(&key)
            .map(|s| s.size_bytes)
            .unwrap_or(0);
        if self.transfers.start_receiving(&key, size_hint) {
            tracing::debug!(sender = %msg.sender, hash = %key, "receiving unrequested transfer");
            self.meta.insert(
                key.clone(),
                TransferMeta {
                    source: Some(msg.sender.clone()),
                    requested: false,
                    size: if size_hint > 0 { size_hint } else { UNKNOWN_SIZE },
                    last_progress_tick: self.tick_count,
                    rerequests: 0,
                },
            );
        }
        if let Err(e) = self.transfers.add_chunk(&key, index, payload) {
            tracing::warn!(error = %e, "dropping chunk");
            return None;
        }
        // Advertised sizes are approximate; they only pick the log level below.
        let advertised = match self.meta.get_mut(&key) {
            Some(meta) => {
                meta.last_progress_tick = self.tick_count;
                Some(meta.size).filter(|&s| s != UNKNOWN_SIZE)
            }
            None => None,
        };

        match self.transfers.try_assemble(&key, &key) {
            Assembly::Complete(bytes) => {
                self.meta.remove(&key);
                if self.completed.len() == RECENTLY_COMPLETED {
                    self.completed.pop_front();
                }
                self.completed.push_back(key.clone());
                let path = self.save_path(&key);
                tracing::info!(hash = %key, bytes = bytes.len(), path = %path.display(), "file assembled");
                Some(Effect::SaveFile {
                    hash: key,
                    path,
                    bytes,
                })
            }
            Assembly::HashMismatch { actual } => {
                let buffered = self.transfers.progress(&key).map_or(0, |p| p.buffered_bytes);
                if advertised.is_some_and(|size| buffered >= size) {
                    tracing::warn!(hash = %key, actual = %actual, "assembled bytes do not match hash");
                } else {
                    tracing::trace!(hash = %key, "contiguous chunks do not hash to the file yet");
                }
                None
            }
            Assembly::Incomplete { .. } | Assembly::NotReceiving => None,
        }
    }

    /// Advance the logical clock and apply the stall policy.
    pub fn tick(&mut self) -> Vec<Effect> {
        self.tick_count = self.tick_count.saturating_add(1);
        let policy = self.config.stall;
        if !policy.is_enabled() {
            return Vec::new();
        }
        let now = self.tick_count;
        let stalled: Vec<String> = self
            .meta
            .iter()
            .filter(|(_, m)| now.saturating_sub(m.last_progress_tick) >= policy.timeout_ticks)
            .map(|(k, _)| k.clone())
            .collect();

        let mut effects = Vec::new();
        for key in stalled {
            let Some(meta) = self.meta.get_mut(&key) else {
                continue;
            };
            match meta.source.clone().filter(|_| meta.requested) {
                Some(source) if meta.rerequests < policy.max_rerequests => {
                    meta.rerequests += 1;
                    meta.last_progress_tick = now;
                    tracing::info!(hash = %key, peer = %source, attempt = meta.rerequests, "transfer stalled, requesting again");
                    effects.push(Effect::Publish(Message::media_request(
                        &self.config.peer_id,
                        &source,
                        &key,
                        meta.size,
                        self.config.dialect,
                    )));
                }
                _ => {
                    tracing::warn!(hash = %key, "abandoning stalled transfer");
                    self.meta.remove(&key);
                    self.transfers.abandon(&key);
                }
            }
        }
        effects
    }

    fn save_path(&self, hash: &str) -> PathBuf {
        let name = match self.catalogs.find(hash) {
            Some(song) => format!("{} - {}.mp3", song.artist, song.title),
            None => format!("{hash}.mp3"),
        };
        save_path_in(&self.config.download_dir, &name)
    }

    pub fn online_peers(&self) -> Vec<String> {
        self.peers.list_online()
    }

    pub fn catalog(&self, peer: &str) -> Vec<Song> {
        self.catalogs.catalog(peer).to_vec()
    }

    pub fn aggregated_catalog(&self) -> Vec<(Song, String)> {
        self.catalogs.aggregated()
    }

    pub fn known_song(&self, hash: &str) -> Option<Song> {
        self.catalogs.find(hash).cloned()
    }

    pub fn peers_offering(&self, hash: &str) -> Vec<String> {
        self.catalogs.peers_offering(hash)
    }

    pub fn transfers(&self) -> Vec<TransferProgress> {
        self.transfers.all_progress()
    }
}

fn save_path_in(dir: &Path, name: &str) -> PathBuf {
    let clean: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    dir.join(clean)
}
