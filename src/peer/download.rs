//! Download engine
//!
//! Tracks in-progress file downloads. Each download is one
//! [`DownloadProcess`] identified by a sequential id, carried as the
//! correlation id in every chunk request and chunk frame. Chunk requests
//! are issued one at a time per process; the next request goes out only
//! once the previous chunk has been processed, and a retry task
//! re-issues the current request when a reply never arrives.

use crate::error::ShareError;
use crate::peer::client::ControlChannel;
use crate::protocol::{DataMessage, Frame, PeerId, Reply, Request};
use crate::storage::ChunkStore;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// How long a process waits on one chunk before re-requesting it
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

/// State of one in-progress file download
#[derive(Debug, Clone)]
pub struct DownloadProcess {
    /// Correlation id, stable for the lifetime of the download
    pub id: u32,
    pub filename: String,
    pub num_of_chunks: u32,
    /// Chunk index -> candidate owners; entries drain as chunks arrive
    pub chunks_needed: BTreeMap<u32, Vec<PeerId>>,
    /// When the current chunk request was last sent
    pub last_request: Instant,
}

#[derive(Debug, Default)]
struct DownloadTable {
    processes: HashMap<u32, DownloadProcess>,
    next_id: u32,
}

/// Pick one owner uniformly at random from the candidate list
pub fn pick_owner<'a, R: Rng + ?Sized>(owners: &'a [PeerId], rng: &mut R) -> Option<&'a PeerId> {
    if owners.is_empty() {
        None
    } else {
        owners.get(rng.gen_range(0..owners.len()))
    }
}

/// Fetches files from the swarm chunk by chunk
pub struct DownloadEngine {
    store: ChunkStore,
    socket: Arc<UdpSocket>,
    tracker: Arc<dyn ControlChannel>,
    /// Our reachable data endpoint, as registered with the tracker
    self_address: String,
    /// Whether this peer sits behind a NAT itself
    behind_nat: bool,
    /// Peers known to be behind NAT, refreshed from QUERY_FILE replies
    nat_peers: RwLock<HashSet<PeerId>>,
    table: Mutex<DownloadTable>,
    rng: Mutex<StdRng>,
}

impl DownloadEngine {
    /// Create a download engine
    pub fn new(
        store: ChunkStore,
        socket: Arc<UdpSocket>,
        tracker: Arc<dyn ControlChannel>,
        self_address: String,
        behind_nat: bool,
    ) -> Self {
        Self::with_rng(
            store,
            socket,
            tracker,
            self_address,
            behind_nat,
            StdRng::from_entropy(),
        )
    }

    /// Create a download engine with a caller-supplied random source
    pub fn with_rng(
        store: ChunkStore,
        socket: Arc<UdpSocket>,
        tracker: Arc<dyn ControlChannel>,
        self_address: String,
        behind_nat: bool,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            socket,
            tracker,
            self_address,
            behind_nat,
            nat_peers: RwLock::new(HashSet::new()),
            table: Mutex::new(DownloadTable::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Replace the known-NAT-peer set
    pub async fn update_nat_peers(&self, peers: Vec<PeerId>) {
        *self.nat_peers.write().await = peers.into_iter().collect();
    }

    /// Number of downloads currently in progress
    pub async fn active_downloads(&self) -> usize {
        self.table.lock().await.processes.len()
    }

    /// Snapshot of the chunk indices a process still needs
    pub async fn chunks_needed(&self, process_id: u32) -> Option<Vec<u32>> {
        self.table
            .lock()
            .await
            .processes
            .get(&process_id)
            .map(|p| p.chunks_needed.keys().copied().collect())
    }

    /// Start downloading a file from the swarm
    pub async fn initiate_download(&self, filename: &str) -> Result<()> {
        if self.store.has_file(filename) {
            info!("{} already exists in the shared directory", filename);
            return Ok(());
        }

        let reply = self
            .tracker
            .send(Request::QueryFile {
                filename: filename.to_string(),
            })
            .await?;
        let (num_of_chunks, chunk_owners, peer_behind_nat) = match reply {
            Reply::QueryFileReply {
                num_of_chunks,
                chunks,
                peer_behind_nat,
                ..
            } => (num_of_chunks, chunks, peer_behind_nat),
            Reply::QueryFileError { error } => {
                return Err(ShareError::registry_error(error).into());
            }
            other => {
                return Err(ShareError::protocol_error_with_source(
                    "Unexpected tracker reply to QUERY_FILE",
                    format!("{:?}", other),
                )
                .into());
            }
        };

        self.update_nat_peers(peer_behind_nat).await;

        let available = self.store.available_chunks(filename).await?;
        let mut chunks_needed = BTreeMap::new();
        for (key, owners) in chunk_owners {
            let chunk_number: u32 = key.parse().map_err(|_| {
                ShareError::protocol_error_with_source("Non-numeric chunk index", key.clone())
            })?;
            if !available.contains(&chunk_number) {
                chunks_needed.insert(chunk_number, owners);
            }
        }

        if chunks_needed.is_empty() {
            info!("All chunks of {} already on disk, reassembling", filename);
            self.store.combine(filename, num_of_chunks).await?;
            return Ok(());
        }

        let (process_id, first_chunk, owners) = {
            let mut table = self.table.lock().await;
            let id = table.next_id;
            table.next_id += 1;
            let process = DownloadProcess {
                id,
                filename: filename.to_string(),
                num_of_chunks,
                chunks_needed,
                last_request: Instant::now(),
            };
            // chunks_needed is non-empty here
            let first = process
                .chunks_needed
                .iter()
                .next()
                .map(|(chunk, owners)| (*chunk, owners.clone()));
            table.processes.insert(id, process);
            match first {
                Some((chunk, owners)) => (id, chunk, owners),
                None => return Ok(()),
            }
        };

        info!(
            "Started download process {} for {} ({} chunks to fetch)",
            process_id,
            filename,
            self.chunks_needed(process_id).await.map_or(0, |c| c.len())
        );
        self.request_chunk(process_id, filename, first_chunk, &owners)
            .await
    }

    /// Request one chunk from a randomly chosen owner, going through the
    /// tracker relay when the owner is behind NAT
    async fn request_chunk(
        &self,
        process_id: u32,
        filename: &str,
        chunk_number: u32,
        owners: &[PeerId],
    ) -> Result<()> {
        let owner = {
            let mut rng = self.rng.lock().await;
            pick_owner(owners, &mut *rng).cloned()
        }
        .ok_or_else(|| {
            ShareError::registry_error(format!(
                "No owners known for chunk {} of {}",
                chunk_number, filename
            ))
        })?;

        if self.behind_nat {
            // Open our NAT mapping toward the owner so the chunk frame
            // can come back in
            let owner_addr: SocketAddr = owner.parse()?;
            self.socket.send_to(&Frame::Ping.encode()?, owner_addr).await?;
            debug!("Sent hole-punch ping to {}", owner);
        }

        if self.nat_peers.read().await.contains(&owner) {
            debug!("Owner {} is behind NAT, asking tracker to relay", owner);
            let reply = self
                .tracker
                .send(Request::RequestFileChunkNat {
                    owner_address: owner.clone(),
                    filename: filename.to_string(),
                    file_download_process_id: process_id,
                    chunk_number,
                    receiver_address: Some(self.self_address.clone()),
                })
                .await?;
            if !matches!(reply, Reply::Ack) {
                warn!("Tracker did not acknowledge relay request: {:?}", reply);
            }
        } else {
            let owner_addr: SocketAddr = owner.parse()?;
            let frame = Frame::Control(DataMessage::RequestFileChunk {
                file_download_process_id: process_id,
                filename: filename.to_string(),
                chunk_number,
            });
            self.socket.send_to(&frame.encode()?, owner_addr).await.map_err(|e| {
                ShareError::network_error_full(
                    "Failed to send chunk request",
                    owner.clone(),
                    e.to_string(),
                )
            })?;
            debug!(
                "Requested chunk {} of {} from {} (process {})",
                chunk_number, filename, owner, process_id
            );
        }
        Ok(())
    }

    /// Process one received chunk frame: persist the payload, then either
    /// reassemble the file or request the next pending chunk
    pub async fn handle_chunk(
        &self,
        process_id: u32,
        chunk_number: u32,
        payload: &[u8],
    ) -> Result<()> {
        let (filename, num_of_chunks, next) = {
            let mut table = self.table.lock().await;
            let process = match table.processes.get_mut(&process_id) {
                Some(process) => process,
                None => {
                    warn!("Chunk frame for unknown download process {}", process_id);
                    return Ok(());
                }
            };
            if !process.chunks_needed.contains_key(&chunk_number) {
                debug!(
                    "Duplicate chunk {} for process {}, ignoring",
                    chunk_number, process_id
                );
                return Ok(());
            }

            let filename = process.filename.clone();
            self.store.write_chunk(&filename, chunk_number, payload).await?;
            process.chunks_needed.remove(&chunk_number);
            process.last_request = Instant::now();

            let next = process
                .chunks_needed
                .iter()
                .next()
                .map(|(chunk, owners)| (*chunk, owners.clone()));
            (filename, process.num_of_chunks, next)
        };

        match next {
            Some((next_chunk, owners)) => {
                self.request_chunk(process_id, &filename, next_chunk, &owners)
                    .await
            }
            None => self.finish_process(process_id, &filename, num_of_chunks).await,
        }
    }

    /// Reassemble the finished download and retire its process entry.
    /// The entry stays in the table until the combine succeeds, so the
    /// retry sweep re-drives a reassembly that failed or deferred.
    async fn finish_process(
        &self,
        process_id: u32,
        filename: &str,
        num_of_chunks: u32,
    ) -> Result<()> {
        let completed = self.store.combine(filename, num_of_chunks).await?;
        if completed {
            self.table.lock().await.processes.remove(&process_id);
            info!(
                "Download process {} complete, reassembled {}",
                process_id, filename
            );
        } else {
            warn!(
                "Reassembly of {} deferred, chunk artifacts missing (process {})",
                filename, process_id
            );
        }
        Ok(())
    }

    /// Revisit every process that has waited longer than `retry_after`:
    /// re-request its current chunk with a fresh random owner, or retry
    /// the reassembly when every chunk already arrived
    pub async fn retry_stalled(&self, retry_after: Duration) {
        let stalled: Vec<(u32, String, u32, Option<(u32, Vec<PeerId>)>)> = {
            let mut table = self.table.lock().await;
            let now = Instant::now();
            table
                .processes
                .values_mut()
                .filter(|process| now.duration_since(process.last_request) >= retry_after)
                .map(|process| {
                    process.last_request = now;
                    let pending = process
                        .chunks_needed
                        .iter()
                        .next()
                        .map(|(chunk, owners)| (*chunk, owners.clone()));
                    (
                        process.id,
                        process.filename.clone(),
                        process.num_of_chunks,
                        pending,
                    )
                })
                .collect()
        };

        for (process_id, filename, num_of_chunks, pending) in stalled {
            let outcome = match pending {
                Some((chunk_number, owners)) => {
                    warn!(
                        "Chunk {} of {} stalled (process {}), re-requesting",
                        chunk_number, filename, process_id
                    );
                    self.request_chunk(process_id, &filename, chunk_number, &owners)
                        .await
                }
                None => self.finish_process(process_id, &filename, num_of_chunks).await,
            };
            if let Err(e) = outcome {
                warn!("Retry for process {} failed: {}", process_id, e);
            }
        }
    }
}
