//! NAT traversal support
//!
//! A peer behind NAT cannot accept inbound chunk requests directly. Two
//! mechanisms make it reachable anyway: its public endpoint is
//! discovered through a [`StunClient`] and registered with the tracker
//! in place of its private address, and a signal listener keeps a UDP
//! mapping open toward the tracker so chunk requests can be relayed in
//! as REQUEST_FILE_CHUNK_SIGNAL datagrams.

use crate::error::ShareError;
use crate::peer::UploadEngine;
use crate::protocol::SignalMessage;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// NAT type label for which hole punching cannot work
pub const SYMMETRIC_NAT: &str = "Symmetric NAT";

/// Interval between keepalive ACKs on the signal mapping
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A discovered NAT mapping for one local socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMapping {
    /// NAT classification, e.g. "Full Cone" or "Symmetric NAT"
    pub nat_type: String,
    pub external_ip: String,
    pub external_port: u16,
}

/// Discovers the public endpoint of a local UDP port. A trait so the
/// runtime can be tested without reaching an actual STUN server.
#[async_trait]
pub trait StunClient: Send + Sync {
    /// Classify the NAT and report the public mapping of `local_port`
    async fn discover(&self, local_port: u16) -> Result<StunMapping>;
}

/// Stun client with an operator-supplied mapping, for deployments where
/// the public endpoint is already known (port forwarding, tests).
/// Distinct local ports map to distinct external ports through
/// [`FixedStunClient::with_port`].
pub struct FixedStunClient {
    mapping: StunMapping,
    port_overrides: HashMap<u16, u16>,
}

impl FixedStunClient {
    pub fn new(mapping: StunMapping) -> Self {
        Self {
            mapping,
            port_overrides: HashMap::new(),
        }
    }

    /// Map one local port to its own external port
    pub fn with_port(mut self, local_port: u16, external_port: u16) -> Self {
        self.port_overrides.insert(local_port, external_port);
        self
    }
}

#[async_trait]
impl StunClient for FixedStunClient {
    async fn discover(&self, local_port: u16) -> Result<StunMapping> {
        let mut mapping = self.mapping.clone();
        if let Some(&external_port) = self.port_overrides.get(&local_port) {
            mapping.external_port = external_port;
        }
        Ok(mapping)
    }
}

/// Discover the data socket's public mapping and reject NAT types hole
/// punching cannot traverse
pub async fn discover_mapping(stun: &dyn StunClient, local_port: u16) -> Result<StunMapping> {
    let mapping = stun.discover(local_port).await?;
    if mapping.nat_type == SYMMETRIC_NAT {
        return Err(ShareError::unsupported_nat_type(mapping.nat_type).into());
    }
    info!(
        "NAT mapping for local port {}: {} -> {}:{}",
        local_port, mapping.nat_type, mapping.external_ip, mapping.external_port
    );
    Ok(mapping)
}

/// Listens for relayed chunk requests from the tracker's signal socket
/// and keeps the mapping toward the tracker alive
pub struct SignalListener {
    socket: Arc<UdpSocket>,
    tracker_signal_addr: SocketAddr,
    upload: Arc<UploadEngine>,
}

impl SignalListener {
    pub fn new(
        socket: Arc<UdpSocket>,
        tracker_signal_addr: SocketAddr,
        upload: Arc<UploadEngine>,
    ) -> Self {
        Self {
            socket,
            tracker_signal_addr,
            upload,
        }
    }

    /// Open the mapping toward the tracker, then serve relayed chunk
    /// requests until the task is dropped
    pub async fn run(self) {
        if let Err(e) = self.send_keepalive().await {
            warn!("Failed to open signal mapping: {}", e);
        }

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        let mut buffer = [0u8; 1024];
        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if let Err(e) = self.send_keepalive().await {
                        warn!("Signal keepalive failed: {}", e);
                    }
                }
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                        Err(e) => warn!("Signal socket receive failed: {}", e),
                    }
                }
            }
        }
    }

    async fn send_keepalive(&self) -> Result<()> {
        let payload = serde_json::to_vec(&SignalMessage::Ack)?;
        self.socket.send_to(&payload, self.tracker_signal_addr).await?;
        debug!("Signal keepalive sent to {}", self.tracker_signal_addr);
        Ok(())
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let signal = match serde_json::from_slice::<SignalMessage>(datagram) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Malformed signal datagram from {}: {}", from, e);
                return;
            }
        };
        match signal {
            SignalMessage::RequestFileChunkSignal {
                receiver_address,
                filename,
                file_download_process_id,
                chunk_number,
            } => {
                debug!(
                    "Relayed request for chunk {} of {} toward {}",
                    chunk_number, filename, receiver_address
                );
                let target: SocketAddr = match receiver_address.parse() {
                    Ok(target) => target,
                    Err(e) => {
                        warn!("Bad receiver address {}: {}", receiver_address, e);
                        return;
                    }
                };
                if let Err(e) = self
                    .upload
                    .serve_chunk(&filename, file_download_process_id, chunk_number, target)
                    .await
                {
                    warn!(
                        "Failed to serve relayed chunk {} of {}: {}",
                        chunk_number, filename, e
                    );
                }
            }
            SignalMessage::Ack => {
                debug!("Signal ACK from {}", from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::storage::ChunkStore;

    #[tokio::test]
    async fn test_fixed_stun_client_reports_its_mapping() {
        let mapping = StunMapping {
            nat_type: "Full Cone".to_string(),
            external_ip: "203.0.113.5".to_string(),
            external_port: 9400,
        };
        let stun = FixedStunClient::new(mapping.clone());
        let discovered = discover_mapping(&stun, 9000).await.unwrap();
        assert_eq!(discovered, mapping);
    }

    #[tokio::test]
    async fn test_per_port_mapping_overrides_default() {
        let stun = FixedStunClient::new(StunMapping {
            nat_type: "Full Cone".to_string(),
            external_ip: "203.0.113.5".to_string(),
            external_port: 9400,
        })
        .with_port(9001, 9401);

        let data = discover_mapping(&stun, 9000).await.unwrap();
        assert_eq!(data.external_port, 9400);

        let signal = discover_mapping(&stun, 9001).await.unwrap();
        assert_eq!(signal.external_port, 9401);
        assert_eq!(signal.external_ip, "203.0.113.5");
    }

    #[tokio::test]
    async fn test_symmetric_nat_is_fatal() {
        let stun = FixedStunClient::new(StunMapping {
            nat_type: SYMMETRIC_NAT.to_string(),
            external_ip: "203.0.113.5".to_string(),
            external_port: 9400,
        });
        let err = discover_mapping(&stun, 9000).await.unwrap_err();
        let share_err = err.downcast_ref::<ShareError>().unwrap();
        assert!(matches!(share_err, ShareError::NatError { .. }));
    }

    #[tokio::test]
    async fn test_signal_listener_serves_relayed_request() {
        let dir = std::env::temp_dir().join("signal_listener_serves");
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = ChunkStore::new(dir.clone(), 4);
        tokio::fs::write(store.file_path("data.bin"), b"aaaabbbb")
            .await
            .unwrap();

        let data_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let upload = Arc::new(UploadEngine::new(store, data_socket));

        // Stands in for the tracker's signal socket
        let tracker_signal = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker_signal.local_addr().unwrap();

        let signal_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let signal_addr = signal_socket.local_addr().unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let listener = SignalListener::new(signal_socket, tracker_addr, upload);
        tokio::spawn(listener.run());

        // The opening keepalive reaches the tracker
        let mut buffer = [0u8; 1024];
        let (len, _) =
            tokio::time::timeout(Duration::from_secs(5), tracker_signal.recv_from(&mut buffer))
                .await
                .unwrap()
                .unwrap();
        assert!(matches!(
            serde_json::from_slice::<SignalMessage>(&buffer[..len]).unwrap(),
            SignalMessage::Ack
        ));

        // Relay a chunk request the way the tracker would
        let signal = SignalMessage::RequestFileChunkSignal {
            receiver_address: receiver_addr.to_string(),
            filename: "data.bin".to_string(),
            file_download_process_id: 7,
            chunk_number: 1,
        };
        tracker_signal
            .send_to(&serde_json::to_vec(&signal).unwrap(), signal_addr)
            .await
            .unwrap();

        let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        match Frame::decode(&buffer[..len]).unwrap() {
            Frame::Chunk {
                process_id,
                chunk_number,
                payload,
            } => {
                assert_eq!(process_id, 7);
                assert_eq!(chunk_number, 1);
                assert_eq!(payload, b"bbbb");
            }
            other => panic!("Unexpected frame: {:?}", other),
        }

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
