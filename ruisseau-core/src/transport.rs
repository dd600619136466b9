//! Bus abstraction: fire-and-forget publish, per-topic subscription, connectivity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Messages delivered for one subscription.
pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("payload too large for transport ({0} bytes)")]
    TooLarge(usize),
    #[error("transport closed")]
    Closed,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A publish/subscribe bus with at-least-once, unordered delivery.
pub trait Transport: Send + Sync {
    /// Queue `payload` for delivery to every subscriber of `topic`. Does not wait.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
    /// Start receiving everything published on `topic`, including our own messages.
    fn subscribe(&self, topic: &str) -> Result<Inbox, TransportError>;
    fn is_connected(&self) -> bool;
}

/// In-process bus. Every subscriber of a topic sees every message published on it.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

#[derive(Default)]
struct LocalBusInner {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    offline: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the broker connection.
    pub fn set_connected(&self, connected: bool) {
        self.inner.offline.store(!connected, Ordering::SeqCst);
    }
}

impl Transport for LocalBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut subs = self.inner.subscribers.lock();
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<Inbox, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        !self.inner.offline.load(Ordering::SeqCst)
    }
}
