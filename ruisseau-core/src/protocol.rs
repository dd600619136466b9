//! Ruisseau wire protocol: action vocabulary, message envelope, song records.

use serde::{Deserialize, Deserializer, Serialize};

/// Fixed chunk size in bytes. Receivers derive the chunk index from `start_byte / CHUNK_SIZE`.
pub const CHUNK_SIZE: usize = 4096;

/// Topic every peer publishes to and subscribes on.
pub const DEFAULT_TOPIC: &str = "BitRuisseau";

/// Canonical broadcast recipient.
pub const BROADCAST: &str = "*";

/// Size requested when the song is not in any cached catalog.
pub const UNKNOWN_SIZE: u64 = 100_000_000;

const BROADCAST_ALIASES: [&str; 3] = [BROADCAST, "0.0.0.0", "ALL"];

/// True if `recipient` addresses every peer.
pub fn is_broadcast(recipient: &str) -> bool {
    BROADCAST_ALIASES.contains(&recipient)
}

/// Action tag carried by every message. Aliases are kept as distinct variants so a message
/// re-encodes with the tag it arrived with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Online,
    AskOnline,
    AskCatalog,
    RequestCatalog,
    SendCatalog,
    /// Legacy: a request when `song_data` is absent, a chunk when present.
    AskMedia,
    /// Legacy alias of `AskMedia`.
    AskFile,
    SendMedia,
    SendChunk,
    /// Always a request, whatever the payload fields hold.
    MediaRequest,
    /// Always a chunk.
    MediaChunk,
    Unknown(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Online => "online",
            Action::AskOnline => "askOnline",
            Action::AskCatalog => "askCatalog",
            Action::RequestCatalog => "requestCatalog",
            Action::SendCatalog => "sendCatalog",
            Action::AskMedia => "askMedia",
            Action::AskFile => "askFile",
            Action::SendMedia => "sendMedia",
            Action::SendChunk => "sendChunk",
            Action::MediaRequest => "mediaRequest",
            Action::MediaChunk => "mediaChunk",
            Action::Unknown(s) => s,
        }
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        match s.as_str() {
            "online" => Action::Online,
            "askOnline" => Action::AskOnline,
            "askCatalog" => Action::AskCatalog,
            "requestCatalog" => Action::RequestCatalog,
            "sendCatalog" => Action::SendCatalog,
            "askMedia" => Action::AskMedia,
            "askFile" => Action::AskFile,
            "sendMedia" => Action::SendMedia,
            "sendChunk" => Action::SendChunk,
            "mediaRequest" => Action::MediaRequest,
            "mediaChunk" => Action::MediaChunk,
            _ => Action::Unknown(s),
        }
    }
}

impl From<Action> for String {
    fn from(a: Action) -> Self {
        a.as_str().to_string()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which media tags we emit. Both are always accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireDialect {
    /// `askMedia` / `sendMedia`, understood by every peer on the bus.
    #[default]
    Legacy,
    /// `mediaRequest` / `mediaChunk`.
    Explicit,
}

impl WireDialect {
    fn request_action(self) -> Action {
        match self {
            WireDialect::Legacy => Action::AskMedia,
            WireDialect::Explicit => Action::MediaRequest,
        }
    }

    fn chunk_action(self) -> Action {
        match self {
            WireDialect::Legacy => Action::SendMedia,
            WireDialect::Explicit => Action::MediaChunk,
        }
    }
}

/// A song offered in a catalog. Identity is `hash`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    #[serde(default, alias = "Title")]
    pub title: String,
    #[serde(default, alias = "Artist")]
    pub artist: String,
    #[serde(default, alias = "Year")]
    pub year: u32,
    #[serde(default, alias = "Duration", deserialize_with = "duration_secs")]
    pub duration_seconds: u64,
    #[serde(default, alias = "Size", alias = "SizeBytes")]
    pub size_bytes: u64,
    #[serde(default, alias = "Featuring")]
    pub featuring: Vec<String>,
    #[serde(default, alias = "Hash")]
    pub hash: String,
}

/// Wire envelope. Only `action` and `sender` are required; `null` reads as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "Action")]
    pub action: Action,
    #[serde(alias = "Sender")]
    pub sender: String,
    #[serde(default, alias = "Recipient")]
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "SongList")]
    pub song_list: Option<Vec<Song>>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "Hash")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "StartByte")]
    pub start_byte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "EndByte")]
    pub end_byte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "SongData")]
    pub song_data: Option<String>,
}

impl Message {
    fn bare(action: Action, sender: &str, recipient: &str) -> Self {
        Self {
            action,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            song_list: None,
            hash: None,
            start_byte: None,
            end_byte: None,
            song_data: None,
        }
    }

    pub fn online(sender: &str) -> Self {
        Self::bare(Action::Online, sender, BROADCAST)
    }

    pub fn ask_online(sender: &str) -> Self {
        Self::bare(Action::AskOnline, sender, BROADCAST)
    }

    pub fn request_catalog(sender: &str, recipient: &str) -> Self {
        Self::bare(Action::RequestCatalog, sender, recipient)
    }

    pub fn send_catalog(sender: &str, recipient: &str, songs: Vec<Song>) -> Self {
        Self {
            song_list: Some(songs),
            ..Self::bare(Action::SendCatalog, sender, recipient)
        }
    }

    /// Ask `recipient` for the whole file `[0, size]`.
    pub fn media_request(
        sender: &str,
        recipient: &str,
        hash: &str,
        size: u64,
        dialect: WireDialect,
    ) -> Self {
        Self {
            hash: Some(hash.to_string()),
            start_byte: Some(0),
            end_byte: Some(size),
            ..Self::bare(dialect.request_action(), sender, recipient)
        }
    }

    /// One chunk starting at `start_byte`. `end_byte` is inclusive.
    pub fn media_chunk(
        sender: &str,
        recipient: &str,
        hash: &str,
        start_byte: u64,
        payload: &[u8],
        dialect: WireDialect,
    ) -> Self {
        let end = start_byte + (payload.len() as u64).saturating_sub(1);
        Self {
            hash: Some(hash.to_string()),
            start_byte: Some(start_byte),
            end_byte: Some(end),
            song_data: Some(crate::wire::encode_payload(payload)),
            ..Self::bare(dialect.chunk_action(), sender, recipient)
        }
    }

    /// True if the message carries a non-empty chunk payload.
    pub fn has_payload(&self) -> bool {
        self.song_data.as_deref().is_some_and(|d| !d.is_empty())
    }
}

/// Seconds as a number, or a `[d.]hh:mm:ss[.fffffff]` time span string.
fn duration_secs<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Fractional(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(de)? {
        None => Ok(0),
        Some(Raw::Secs(secs)) => Ok(secs),
        Some(Raw::Fractional(secs)) if secs >= 0.0 => Ok(secs as u64),
        Some(Raw::Fractional(secs)) => Err(serde::de::Error::custom(format!(
            "negative duration {secs}"
        ))),
        Some(Raw::Text(text)) => parse_time_span(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {text:?}"))),
    }
}

fn parse_time_span(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<u64>() {
        return Some(secs);
    }
    let mut parts = text.split(':');
    let (head, minutes, seconds) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let (days, hours) = match head.split_once('.') {
        Some((d, h)) => (d.parse::<u64>().ok()?, h.parse::<u64>().ok()?),
        None => (0, head.parse::<u64>().ok()?),
    };
    let minutes: u64 = minutes.parse().ok()?;
    let whole_seconds = seconds.split('.').next()?;
    let seconds: u64 = whole_seconds.parse().ok()?;
    if minutes >= 60 || seconds >= 60 {
        return None;
    }
    Some(days * 86_400 + hours * 3_600 + minutes * 60 + seconds)
}
