//! Upload engine
//!
//! Serves chunk requests out of the local chunk store, framing each
//! response as one chunk datagram. Both the direct path and the
//! tracker-signaled path land here; an absent file or chunk is logged
//! and dropped on either path, and the requester's retry covers the
//! loss.

use crate::protocol::Frame;
use crate::storage::ChunkStore;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Serves chunks from the shared directory over the data socket
pub struct UploadEngine {
    store: ChunkStore,
    socket: Arc<UdpSocket>,
}

impl UploadEngine {
    /// Create an upload engine over the peer's store and data socket
    pub fn new(store: ChunkStore, socket: Arc<UdpSocket>) -> Self {
        Self { store, socket }
    }

    /// Serve one chunk request, sending the framed chunk to `target`
    pub async fn serve_chunk(
        &self,
        filename: &str,
        process_id: u32,
        chunk_number: u32,
        target: SocketAddr,
    ) -> Result<()> {
        let payload = match self.store.read_chunk(filename, chunk_number).await? {
            Some(payload) => payload,
            None => {
                warn!(
                    "Requested chunk {} of {} is not available locally, dropping request",
                    chunk_number, filename
                );
                return Ok(());
            }
        };

        let frame = Frame::Chunk {
            process_id,
            chunk_number,
            payload,
        };
        self.socket.send_to(&frame.encode()?, target).await?;
        debug!(
            "Served chunk {} of {} to {} (process {})",
            chunk_number, filename, target, process_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn temp_store(tag: &str) -> ChunkStore {
        let dir = std::env::temp_dir().join(format!("upload_engine_{}", tag));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();
        ChunkStore::new(dir, 4)
    }

    #[tokio::test]
    async fn test_serves_chunk_from_whole_file() {
        let store = temp_store("whole").await;
        tokio::fs::write(store.file_path("data.bin"), b"aaaabbbb")
            .await
            .unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let engine = UploadEngine::new(store.clone(), socket);
        engine.serve_chunk("data.bin", 3, 1, target).await.unwrap();

        let mut buffer = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        match Frame::decode(&buffer[..len]).unwrap() {
            Frame::Chunk { process_id, chunk_number, payload } => {
                assert_eq!(process_id, 3);
                assert_eq!(chunk_number, 1);
                assert_eq!(payload, b"bbbb");
            }
            other => panic!("Unexpected frame: {:?}", other),
        }

        tokio::fs::remove_dir_all(store.directory()).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_chunk_sends_nothing() {
        let store = temp_store("missing").await;
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let engine = UploadEngine::new(store.clone(), socket);
        engine.serve_chunk("nothing.bin", 0, 0, target).await.unwrap();

        let mut buffer = [0u8; 64];
        let outcome =
            tokio::time::timeout(Duration::from_millis(200), receiver.recv_from(&mut buffer)).await;
        assert!(outcome.is_err());

        tokio::fs::remove_dir_all(store.directory()).await.unwrap();
    }
}
