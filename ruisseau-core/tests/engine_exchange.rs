use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ruisseau_core::engine::{self, EngineHandle, EngineOptions};
use ruisseau_core::integrity;
use ruisseau_core::transport::Transport;
use ruisseau_core::{CoreConfig, LocalBus, LocalLibrary, MemoryStore, ProtocolCore, Song};

struct Shelf {
    files: Vec<(Song, PathBuf)>,
}

impl LocalLibrary for Shelf {
    fn catalog(&self) -> Vec<Song> {
        self.files.iter().map(|(s, _)| s.clone()).collect()
    }

    fn path_of(&self, hash: &str) -> Option<PathBuf> {
        self.files
            .iter()
            .find(|(s, _)| integrity::same_hash(&s.hash, hash))
            .map(|(_, p)| p.clone())
    }
}

fn song(title: &str, bytes: &[u8]) -> Song {
    Song {
        title: title.into(),
        artist: "Band".into(),
        year: 2004,
        duration_seconds: 200,
        size_bytes: bytes.len() as u64,
        featuring: vec!["Guest".into()],
        hash: integrity::digest(bytes),
    }
}

fn options() -> EngineOptions {
    EngineOptions {
        tick_interval: Duration::from_millis(50),
        chunk_delay: Duration::ZERO,
        ..EngineOptions::default()
    }
}

fn start(
    bus: &LocalBus,
    name: &str,
    files: Vec<(Song, PathBuf)>,
    store: &MemoryStore,
) -> EngineHandle {
    let core = ProtocolCore::new(
        CoreConfig::new(name, "/downloads"),
        Arc::new(Shelf { files }),
    );
    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let (handle, _join) =
        engine::spawn(core, transport, Arc::new(store.clone()), options()).unwrap();
    handle
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn presence_catalog_and_transfer() {
    let bus = LocalBus::new();
    let bytes: Vec<u8> = (0..9000u32).map(|i| (i * 7 % 251) as u8).collect();
    let hit = song("Hit", &bytes);
    let other = song("Other", b"other bytes");

    let b_store = MemoryStore::new();
    b_store.insert("/music/hit.mp3", bytes.clone());
    b_store.insert("/music/other.mp3", b"other bytes".to_vec());
    let b = start(
        &bus,
        "B",
        vec![
            (hit.clone(), "/music/hit.mp3".into()),
            (other.clone(), "/music/other.mp3".into()),
        ],
        &b_store,
    );
    let a_store = MemoryStore::new();
    let a = start(&bus, "A", Vec::new(), &a_store);
    let mut received = a.subscribe();

    a.ask_online().await.unwrap();
    assert!(eventually(|| {
        let a = a.clone();
        async move { a.online_peers().await.unwrap() == vec!["B".to_string()] }
    })
    .await);
    assert!(eventually(|| {
        let b = b.clone();
        async move { b.online_peers().await.unwrap() == vec!["A".to_string()] }
    })
    .await);

    a.request_catalog("B").await.unwrap();
    assert!(eventually(|| {
        let a = a.clone();
        async move { a.catalog("B").await.unwrap().len() == 2 }
    })
    .await);
    let catalog = a.catalog("B").await.unwrap();
    assert_eq!(catalog[0], hit);
    assert_eq!(a.peers_offering(&hit.hash).await.unwrap(), vec!["B".to_string()]);

    a.request_media("B", &hit.hash).await.unwrap();
    let done = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("file not received in time")
        .unwrap();
    assert_eq!(done.hash, hit.hash);
    assert_eq!(done.path, Path::new("/downloads/Band - Hit.mp3"));
    assert_eq!(a_store.get(&done.path).unwrap(), bytes);
    assert!(a.transfers().await.unwrap().is_empty());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pushed_file_is_saved_without_request() {
    let bus = LocalBus::new();
    let bytes = vec![42u8; 5000];
    let gift = song("Gift", &bytes);
    let b_store = MemoryStore::new();
    b_store.insert("/music/gift.mp3", bytes.clone());
    let b = start(&bus, "B", vec![(gift.clone(), "/music/gift.mp3".into())], &b_store);
    let a_store = MemoryStore::new();
    let a = start(&bus, "A", Vec::new(), &a_store);
    let mut received = a.subscribe();

    b.push_full_file("A", &gift.hash).await.unwrap();
    let done = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("file not received in time")
        .unwrap();
    // No catalog from B yet, so the file is named after its hash.
    assert_eq!(done.path, PathBuf::from(format!("/downloads/{}.mp3", gift.hash)));
    assert_eq!(a_store.get(&done.path).unwrap(), bytes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnected_bus_drops_messages() {
    let bus = LocalBus::new();
    let mut opts = options();
    opts.announce_on_start = false;
    let core = ProtocolCore::new(CoreConfig::new("B", "/downloads"), Arc::new(Shelf { files: vec![] }));
    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let (b, _join) = engine::spawn(core, transport, Arc::new(MemoryStore::new()), opts).unwrap();
    let a = start(&bus, "A", Vec::new(), &MemoryStore::new());
    assert!(eventually(|| {
        let b = b.clone();
        async move { b.online_peers().await.unwrap() == vec!["A".to_string()] }
    })
    .await);

    bus.set_connected(false);
    b.ask_online().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.online_peers().await.unwrap().is_empty());

    bus.set_connected(true);
    b.ask_online().await.unwrap();
    assert!(eventually(|| {
        let a = a.clone();
        async move { a.online_peers().await.unwrap() == vec!["B".to_string()] }
    })
    .await);
}

#[tokio::test]
async fn handle_fails_after_shutdown() {
    let bus = LocalBus::new();
    let a = start(&bus, "A", Vec::new(), &MemoryStore::new());
    a.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a.announce().await.is_err());
}
