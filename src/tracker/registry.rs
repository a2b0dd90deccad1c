//! Tracker registry
//!
//! In-memory tables mapping files to metadata, full-file owners,
//! per-chunk owners and NAT signal ports. Every table lives behind one
//! coordination lock: mutations take the write guard, queries the read
//! guard, so readers never observe a half-applied update.

use crate::protocol::{ChunkDeclaration, FileDeclaration, PeerId};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Immutable metadata for one file, created on first sighting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub checksum: String,
    pub num_of_chunks: u32,
}

/// Snapshot answer for a QUERY_FILE request
#[derive(Debug, Clone)]
pub struct FileQuery {
    pub filename: String,
    pub checksum: String,
    pub num_of_chunks: u32,
    /// Owners per chunk index; full-file owners appear at every index
    pub chunks: BTreeMap<u32, Vec<PeerId>>,
    pub peer_behind_nat: Vec<PeerId>,
}

#[derive(Debug, Default)]
struct Tables {
    /// Filename -> immutable metadata
    files: HashMap<String, FileRecord>,
    /// Filename -> peers holding the complete file
    file_owners: HashMap<String, HashSet<PeerId>>,
    /// Filename -> chunk index -> peers holding that chunk
    chunk_owners: HashMap<String, HashMap<u32, HashSet<PeerId>>>,
    /// Peers behind NAT -> their external signal port
    nat_peers: HashMap<PeerId, u16>,
}

/// The shared registry, safe to clone behind an `Arc` across connection
/// handler tasks
#[derive(Debug, Default)]
pub struct Registry {
    tables: RwLock<Tables>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an INFORM_AND_UPDATE declaration. Set-union semantics make
    /// repeated registration idempotent.
    pub async fn inform_and_update(
        &self,
        peer: PeerId,
        files: &[FileDeclaration],
        chunks: &[ChunkDeclaration],
        signal_port: Option<u16>,
    ) {
        let mut tables = self.tables.write().await;

        for file in files {
            tables
                .files
                .entry(file.filename.clone())
                .or_insert_with(|| FileRecord {
                    checksum: file.checksum.clone(),
                    num_of_chunks: file.num_of_chunks,
                });
            tables
                .file_owners
                .entry(file.filename.clone())
                .or_default()
                .insert(peer.clone());
        }

        for declaration in chunks {
            // Chunk-only declarations carry no metadata, so a filename the
            // registry has never seen as a complete file cannot gain a
            // record here.
            if !tables.files.contains_key(&declaration.filename) {
                warn!(
                    "Ignoring chunk declaration for unknown file {} from {}",
                    declaration.filename, peer
                );
                continue;
            }
            let per_chunk = tables
                .chunk_owners
                .entry(declaration.filename.clone())
                .or_default();
            for &chunk_number in &declaration.chunks {
                per_chunk
                    .entry(chunk_number)
                    .or_default()
                    .insert(peer.clone());
            }
        }

        if let Some(port) = signal_port {
            debug!("Registering {} as behind NAT, signal port {}", peer, port);
            tables.nat_peers.insert(peer.clone(), port);
        }

        info!(
            "Registered {}: {} files, {} chunk declarations",
            peer,
            files.len(),
            chunks.len()
        );
    }

    /// De-duplicated union of every filename known via full or chunk
    /// ownership, sorted for stable output
    pub async fn list_files(&self) -> Vec<String> {
        let tables = self.tables.read().await;
        let mut names: Vec<String> = tables
            .file_owners
            .keys()
            .chain(tables.chunk_owners.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }

    /// Look up one file. Returns `None` for unknown filenames.
    pub async fn query_file(&self, filename: &str) -> Option<FileQuery> {
        let tables = self.tables.read().await;
        let record = tables.files.get(filename)?;

        let full_owners = tables.file_owners.get(filename);
        let per_chunk = tables.chunk_owners.get(filename);

        let mut chunks = BTreeMap::new();
        for chunk_number in 0..record.num_of_chunks {
            let mut owners: HashSet<PeerId> = per_chunk
                .and_then(|m| m.get(&chunk_number))
                .cloned()
                .unwrap_or_default();
            if let Some(full) = full_owners {
                owners.extend(full.iter().cloned());
            }
            let mut owners: Vec<PeerId> = owners.into_iter().collect();
            owners.sort();
            chunks.insert(chunk_number, owners);
        }

        let mut peer_behind_nat: Vec<PeerId> = tables.nat_peers.keys().cloned().collect();
        peer_behind_nat.sort();

        Some(FileQuery {
            filename: filename.to_string(),
            checksum: record.checksum.clone(),
            num_of_chunks: record.num_of_chunks,
            chunks,
            peer_behind_nat,
        })
    }

    /// Remove a departing peer from every table, dropping file records
    /// left with neither full nor chunk owners
    pub async fn remove_peer(&self, peer: &PeerId) {
        let mut tables = self.tables.write().await;

        for owners in tables.file_owners.values_mut() {
            owners.remove(peer);
        }
        tables.file_owners.retain(|_, owners| !owners.is_empty());

        for per_chunk in tables.chunk_owners.values_mut() {
            for owners in per_chunk.values_mut() {
                owners.remove(peer);
            }
            per_chunk.retain(|_, owners| !owners.is_empty());
        }
        tables.chunk_owners.retain(|_, per_chunk| !per_chunk.is_empty());

        let orphaned: Vec<String> = tables
            .files
            .keys()
            .filter(|name| {
                !tables.file_owners.contains_key(*name)
                    && !tables.chunk_owners.contains_key(*name)
            })
            .cloned()
            .collect();
        for name in orphaned {
            debug!("Dropping file record for {}: no owners remain", name);
            tables.files.remove(&name);
        }

        tables.nat_peers.remove(peer);
        info!("Removed peer {}", peer);
    }

    /// Registered signal port of a NAT-bound peer
    pub async fn signal_port(&self, peer: &PeerId) -> Option<u16> {
        self.tables.read().await.nat_peers.get(peer).copied()
    }

    /// Number of files with a live record
    pub async fn file_count(&self) -> usize {
        self.tables.read().await.files.len()
    }
}
