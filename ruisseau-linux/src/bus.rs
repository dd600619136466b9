//! LAN bus: every peer joins one UDP multicast group; each datagram carries a topic and a
//! message. Delivery is best-effort and unordered, like the broker it stands in for.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ruisseau_core::transport::Inbox;
use ruisseau_core::{Transport, TransportError};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65_507;

type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>>;

pub struct UdpBus {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
}

impl UdpBus {
    /// Join `group` on `port` and start the send and receive tasks.
    pub async fn bind(group: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = Arc::new(make_multicast_socket(group, port)?);
        let dest = SocketAddr::from((group, port));
        let (outbound, rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(send_loop(socket.clone(), dest, rx, connected.clone()));
        tokio::spawn(recv_loop(socket, subscribers.clone()));
        tracing::info!(%group, port, "joined multicast bus");
        Ok(Self {
            outbound,
            subscribers,
            connected,
        })
    }
}

impl Transport for UdpBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let frame = encode_frame(topic, &payload)?;
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self, topic: &str) -> Result<Inbox, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }
}

fn make_multicast_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        match socket.send_to(&frame, dest).await {
            Ok(_) => {
                if !connected.swap(true, Ordering::SeqCst) {
                    tracing::info!("bus reachable again");
                }
            }
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    tracing::warn!(error = %e, "bus send failed; treating bus as disconnected");
                }
            }
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, subscribers: Subscribers) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => match decode_frame(&buf[..n]) {
                Some((topic, payload)) => deliver(&subscribers, topic, payload),
                None => tracing::debug!(%from, len = n, "ignoring malformed datagram"),
            },
            Err(e) => {
                tracing::warn!(error = %e, "bus receive failed");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
}

fn deliver(subscribers: &Subscribers, topic: &str, payload: &[u8]) {
    let mut subs = subscribers.lock();
    if let Some(list) = subs.get_mut(topic) {
        list.retain(|tx| tx.send(payload.to_vec()).is_ok());
    }
}

/// `[topic len: u8][topic][payload]`.
fn encode_frame(topic: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let topic_len = u8::try_from(topic.len()).map_err(|_| TransportError::TooLarge(topic.len()))?;
    let total = 1 + topic.len() + payload.len();
    if total > MAX_DATAGRAM {
        return Err(TransportError::TooLarge(total));
    }
    let mut frame = Vec::with_capacity(total);
    frame.push(topic_len);
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn decode_frame(frame: &[u8]) -> Option<(&str, &[u8])> {
    let (&len, rest) = frame.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let (topic, payload) = rest.split_at(len);
    Some((std::str::from_utf8(topic).ok()?, payload))
}
