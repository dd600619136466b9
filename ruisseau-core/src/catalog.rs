//! Last catalog received from each peer.

use std::collections::BTreeMap;

use crate::integrity;
use crate::protocol::Song;

#[derive(Default)]
pub struct CatalogStore {
    catalogs: BTreeMap<String, Vec<Song>>,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything known about `peer`'s catalog.
    pub fn set_catalog(&mut self, peer: &str, songs: Vec<Song>) {
        self.catalogs.insert(peer.to_string(), songs);
    }

    /// Songs last advertised by `peer`; empty if the peer never sent a catalog.
    pub fn catalog(&self, peer: &str) -> &[Song] {
        self.catalogs.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every known song paired with the peer offering it. Grouped by peer; no global order
    /// is promised.
    pub fn aggregated(&self) -> Vec<(Song, String)> {
        self.catalogs
            .iter()
            .flat_map(|(peer, songs)| songs.iter().map(move |s| (s.clone(), peer.clone())))
            .collect()
    }

    /// First cached entry for `hash` across all peers.
    pub fn find(&self, hash: &str) -> Option<&Song> {
        self.catalogs
            .values()
            .flatten()
            .find(|s| integrity::same_hash(&s.hash, hash))
    }

    pub fn peers_offering(&self, hash: &str) -> Vec<String> {
        self.catalogs
            .iter()
            .filter(|(_, songs)| songs.iter().any(|s| integrity::same_hash(&s.hash, hash)))
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}
