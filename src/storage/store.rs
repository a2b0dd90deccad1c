//! Shared-directory chunk store
//!
//! A peer's shared directory holds whole files plus partial-download
//! artifacts named `<filename>.<chunk_index>.chunk`. A file is complete
//! once the whole-file path exists and no chunk artifacts remain.

use crate::error::ShareError;
use crate::protocol::{ChunkDeclaration, FileDeclaration};
use anyhow::Result;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Default chunk size in bytes. Keeps a chunk frame comfortably inside
/// one datagram.
pub const DEFAULT_CHUNK_SIZE: usize = 1014;

const CHUNK_SUFFIX: &str = ".chunk";
const PARTIAL_SUFFIX: &str = ".partial";

/// File and chunk storage rooted at a peer's shared directory
#[derive(Debug, Clone)]
pub struct ChunkStore {
    directory: PathBuf,
    chunk_size: usize,
}

impl ChunkStore {
    /// Create a store over an existing directory
    pub fn new(directory: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            directory: directory.into(),
            chunk_size,
        }
    }

    /// The shared directory this store manages
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Configured chunk size in bytes
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Path of a whole file in the shared directory
    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }

    /// Path of one chunk artifact, `<filename>.<chunk_number>.chunk`
    pub fn chunk_path(&self, filename: &str, chunk_number: u32) -> PathBuf {
        self.directory
            .join(format!("{}.{}{}", filename, chunk_number, CHUNK_SUFFIX))
    }

    /// Whether the whole file exists locally
    pub fn has_file(&self, filename: &str) -> bool {
        self.file_path(filename).is_file()
    }

    /// Split a chunk artifact name into `(filename, chunk_number)`.
    /// Filenames may themselves contain dots, so only the last two
    /// components are stripped.
    pub fn parse_chunk_name(name: &str) -> Option<(String, u32)> {
        let stem = name.strip_suffix(CHUNK_SUFFIX)?;
        let (filename, number) = stem.rsplit_once('.')?;
        if filename.is_empty() {
            return None;
        }
        let chunk_number = number.parse::<u32>().ok()?;
        Some((filename.to_string(), chunk_number))
    }

    /// Enumerate the shared directory into complete-file and chunk
    /// declarations suitable for registering with the tracker
    pub async fn scan(&self) -> Result<(Vec<FileDeclaration>, Vec<ChunkDeclaration>)> {
        debug!("Scanning shared directory: {}", self.directory.display());
        let mut files = Vec::new();
        let mut chunk_map: BTreeMap<String, Vec<u32>> = BTreeMap::new();

        let mut entries = fs::read_dir(&self.directory).await.map_err(|e| {
            ShareError::storage_error_full(
                "Failed to read shared directory",
                self.directory.display().to_string(),
                e.to_string(),
            )
        })?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            if name.ends_with(CHUNK_SUFFIX) {
                match Self::parse_chunk_name(&name) {
                    Some((filename, chunk_number)) => {
                        chunk_map.entry(filename).or_default().push(chunk_number);
                    }
                    None => warn!("Ignoring unparseable chunk artifact: {}", name),
                }
            } else {
                files.push(self.describe_file(&name).await?);
            }
        }

        let chunks = chunk_map
            .into_iter()
            .map(|(filename, mut chunks)| {
                chunks.sort_unstable();
                ChunkDeclaration { filename, chunks }
            })
            .collect();

        Ok((files, chunks))
    }

    /// Build the declaration for one complete file: checksum over the
    /// full contents and the chunk count at the configured chunk size
    async fn describe_file(&self, filename: &str) -> Result<FileDeclaration> {
        let path = self.file_path(filename);
        let contents = fs::read(&path).await.map_err(|e| {
            ShareError::storage_error_full(
                "Failed to read file for checksum",
                path.display().to_string(),
                e.to_string(),
            )
        })?;

        let mut hasher = Sha1::new();
        hasher.update(&contents);
        let checksum = hex::encode(hasher.finalize());

        let num_of_chunks = contents.len().div_ceil(self.chunk_size) as u32;

        Ok(FileDeclaration {
            filename: filename.to_string(),
            checksum,
            num_of_chunks,
        })
    }

    /// The chunk indices of `filename` already present as artifacts
    pub async fn available_chunks(&self, filename: &str) -> Result<HashSet<u32>> {
        let mut available = HashSet::new();
        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some((owner_file, chunk_number)) = Self::parse_chunk_name(&name) {
                if owner_file == filename {
                    available.insert(chunk_number);
                }
            }
        }
        Ok(available)
    }

    /// Write one received chunk to its artifact file
    pub async fn write_chunk(&self, filename: &str, chunk_number: u32, payload: &[u8]) -> Result<()> {
        let path = self.chunk_path(filename, chunk_number);
        fs::write(&path, payload).await.map_err(|e| {
            ShareError::storage_error_full(
                "Failed to write chunk file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
        debug!("Wrote chunk {} of {} ({} bytes)", chunk_number, filename, payload.len());
        Ok(())
    }

    /// Read one chunk, either by seeking into the whole file or from the
    /// chunk artifact. Returns `None` when neither holds the chunk.
    pub async fn read_chunk(&self, filename: &str, chunk_number: u32) -> Result<Option<Vec<u8>>> {
        if self.has_file(filename) {
            let path = self.file_path(filename);
            let mut file = fs::File::open(&path).await?;
            let offset = chunk_number as u64 * self.chunk_size as u64;
            let len = file.metadata().await?.len();
            if offset >= len {
                return Ok(None);
            }
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buffer = vec![0u8; self.chunk_size];
            let mut read = 0;
            while read < buffer.len() {
                let n = file.read(&mut buffer[read..]).await?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            buffer.truncate(read);
            return Ok(Some(buffer));
        }

        let path = self.chunk_path(filename, chunk_number);
        match fs::read(&path).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ShareError::storage_error_full(
                "Failed to read chunk file",
                path.display().to_string(),
                e.to_string(),
            )
            .into()),
        }
    }

    /// Reassemble the whole file from its chunk artifacts.
    ///
    /// Chunks are appended in strictly increasing index order into a
    /// scratch file, which replaces the destination only once every chunk
    /// was present; a missing chunk defers the combine without error.
    /// Returns `true` when the file was completed.
    pub async fn combine(&self, filename: &str, num_of_chunks: u32) -> Result<bool> {
        let partial_path = self
            .directory
            .join(format!("{}{}", filename, PARTIAL_SUFFIX));
        let mut partial = fs::File::create(&partial_path).await.map_err(|e| {
            ShareError::storage_error_full(
                "Failed to create scratch file for combine",
                partial_path.display().to_string(),
                e.to_string(),
            )
        })?;

        for chunk_number in 0..num_of_chunks {
            let chunk_file = self.chunk_path(filename, chunk_number);
            let payload = match fs::read(&chunk_file).await {
                Ok(payload) => payload,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(
                        "Combine deferred: chunk {} of {} not on disk yet",
                        chunk_number, filename
                    );
                    drop(partial);
                    let _ = fs::remove_file(&partial_path).await;
                    return Ok(false);
                }
                Err(e) => {
                    drop(partial);
                    let _ = fs::remove_file(&partial_path).await;
                    return Err(ShareError::storage_error_full(
                        "Failed to read chunk during combine",
                        chunk_file.display().to_string(),
                        e.to_string(),
                    )
                    .into());
                }
            };
            partial.write_all(&payload).await.map_err(|e| {
                ShareError::storage_error_full(
                    "Failed to append chunk during combine",
                    partial_path.display().to_string(),
                    e.to_string(),
                )
            })?;
        }

        partial.flush().await?;
        drop(partial);
        fs::rename(&partial_path, self.file_path(filename)).await.map_err(|e| {
            ShareError::storage_error_full(
                "Failed to finalize combined file",
                partial_path.display().to_string(),
                e.to_string(),
            )
        })?;

        self.remove_chunk_artifacts(filename).await?;
        info!("Combined {} from {} chunks", filename, num_of_chunks);
        Ok(true)
    }

    /// Delete every `<filename>.*.chunk` artifact
    pub async fn remove_chunk_artifacts(&self, filename: &str) -> Result<()> {
        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some((owner_file, _)) = Self::parse_chunk_name(&name) {
                if owner_file == filename {
                    fs::remove_file(entry.path()).await?;
                }
            }
        }
        Ok(())
    }
}
