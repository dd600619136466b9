//! Songs we offer: the files listed in the config plus everything downloaded since start.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use ruisseau_core::{integrity, LocalLibrary, Song};

use crate::config::LibraryEntry;

/// Files above this size are not shared.
pub const MAX_FILE_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is {size} bytes, over the 20 MiB limit", path.display())]
    TooLarge { path: PathBuf, size: u64 },
}

#[derive(Default)]
pub struct Library {
    songs: RwLock<Vec<(Song, PathBuf)>>,
}

impl Library {
    /// Hash every configured file. Unreadable or oversized files are skipped with a warning.
    pub fn load(entries: &[LibraryEntry]) -> Self {
        let lib = Self::default();
        for entry in entries {
            match hash_entry(entry) {
                Ok(song) => lib.add(song, entry.path.clone()),
                Err(e) => tracing::warn!(error = %e, "skipping library entry"),
            }
        }
        lib
    }

    /// Offer `path` as `song`, replacing any previous file with the same hash.
    pub fn add(&self, song: Song, path: PathBuf) {
        let mut songs = self.songs.write();
        songs.retain(|(s, _)| !integrity::same_hash(&s.hash, &song.hash));
        tracing::debug!(hash = %song.hash, path = %path.display(), "library entry added");
        songs.push((song, path));
    }

    pub fn len(&self) -> usize {
        self.songs.read().len()
    }
}

impl LocalLibrary for Library {
    fn catalog(&self) -> Vec<Song> {
        self.songs.read().iter().map(|(s, _)| s.clone()).collect()
    }

    fn path_of(&self, hash: &str) -> Option<PathBuf> {
        self.songs
            .read()
            .iter()
            .find(|(s, _)| integrity::same_hash(&s.hash, hash))
            .map(|(_, p)| p.clone())
    }
}

fn read_limited(path: &Path) -> Result<Vec<u8>, LibraryError> {
    let io_err = |source| LibraryError::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = std::fs::metadata(path).map_err(io_err)?.len();
    if size > MAX_FILE_BYTES {
        return Err(LibraryError::TooLarge {
            path: path.to_path_buf(),
            size,
        });
    }
    std::fs::read(path).map_err(io_err)
}

fn hash_entry(entry: &LibraryEntry) -> Result<Song, LibraryError> {
    let bytes = read_limited(&entry.path)?;
    Ok(Song {
        title: entry.title.clone(),
        artist: entry.artist.clone(),
        year: entry.year,
        duration_seconds: entry.duration_seconds,
        size_bytes: bytes.len() as u64,
        featuring: entry.featuring.clone(),
        hash: integrity::digest(&bytes),
    })
}

/// Catalog entry for a downloaded file whose metadata we never saw.
pub fn song_for_download(hash: &str, path: &Path, size_bytes: u64) -> Song {
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| hash.to_string());
    Song {
        title,
        size_bytes,
        hash: hash.to_string(),
        ..Song::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: PathBuf, title: &str) -> LibraryEntry {
        LibraryEntry {
            path,
            title: title.into(),
            artist: "Band".into(),
            year: 2001,
            duration_seconds: 90,
            featuring: vec![],
        }
    }

    #[test]
    fn load_hashes_files_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp3");
        std::fs::write(&a, b"aaaa").unwrap();
        let lib = Library::load(&[
            entry(a.clone(), "A"),
            entry(dir.path().join("missing.mp3"), "Missing"),
        ]);
        assert_eq!(lib.len(), 1);
        let catalog = lib.catalog();
        assert_eq!(catalog[0].title, "A");
        assert_eq!(catalog[0].size_bytes, 4);
        assert_eq!(catalog[0].hash, integrity::digest(b"aaaa"));
        assert_eq!(lib.path_of(&catalog[0].hash.to_lowercase()), Some(a));
        assert_eq!(lib.path_of("FFFF"), None);
    }

    #[test]
    fn oversized_files_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.mp3");
        let f = std::fs::File::create(&big).unwrap();
        f.set_len(MAX_FILE_BYTES + 1).unwrap();
        assert!(matches!(
            read_limited(&big),
            Err(LibraryError::TooLarge { .. })
        ));
        assert_eq!(Library::load(&[entry(big, "Big")]).len(), 0);
    }

    #[test]
    fn add_replaces_same_hash() {
        let lib = Library::default();
        let song = song_for_download("ABCD", Path::new("/dl/ABCD.mp3"), 10);
        assert_eq!(song.title, "ABCD");
        lib.add(song.clone(), "/dl/ABCD.mp3".into());
        lib.add(song, "/dl/other.mp3".into());
        assert_eq!(lib.len(), 1);
        assert_eq!(lib.path_of("abcd"), Some(PathBuf::from("/dl/other.mp3")));
    }
}
