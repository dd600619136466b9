//! Ruisseau peer-to-peer music sharing over a publish/subscribe bus.
//! [`core::ProtocolCore`] is host-driven: no I/O; the host feeds it bus messages and ticks and
//! executes the [`core::Effect`]s it returns. [`engine`] is the tokio host.

pub mod catalog;
pub mod chunk;
pub mod core;
pub mod engine;
pub mod integrity;
pub mod peers;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod wire;

pub use crate::core::{CoreConfig, Effect, LocalLibrary, ProtocolCore, StallPolicy};
pub use chunk::TransferProgress;
pub use engine::{EngineError, EngineHandle, EngineOptions, FileReceived};
pub use protocol::{Action, Message, Song, WireDialect, CHUNK_SIZE, DEFAULT_TOPIC};
pub use store::{FileStore, FsStore, MemoryStore};
pub use transport::{LocalBus, Transport, TransportError};
