//! Tracker control service
//!
//! Accepts control connections, dispatches requests to the registry and
//! relays NAT chunk signals over the shared UDP signal socket. Each
//! accepted connection is served by its own tokio task; all tasks share
//! one registry and one signal socket.

use crate::error::ShareError;
use crate::protocol::{make_peer_id, Reply, Request, SignalMessage};
use crate::tracker::registry::Registry;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

/// How long a connection handler waits for the request line
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The tracker's control service
pub struct TrackerService {
    registry: Arc<Registry>,
    signal_socket: Arc<UdpSocket>,
}

impl TrackerService {
    /// Create the service over an existing registry and signal socket
    pub fn new(registry: Arc<Registry>, signal_socket: Arc<UdpSocket>) -> Self {
        Self {
            registry,
            signal_socket,
        }
    }

    /// Bind the control listener and the signal socket on the given ports
    pub async fn bind(port: u16, signal_port: u16) -> Result<(Arc<Self>, TcpListener)> {
        let listen_addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&listen_addr).await.map_err(|e| {
            error!("Failed to bind control listener on {}: {}", listen_addr, e);
            ShareError::network_error_full("Failed to bind control listener", listen_addr.clone(), e.to_string())
        })?;

        let signal_addr = format!("0.0.0.0:{}", signal_port);
        let signal_socket = UdpSocket::bind(&signal_addr).await.map_err(|e| {
            error!("Failed to bind signal socket on {}: {}", signal_addr, e);
            ShareError::network_error_full("Failed to bind signal socket", signal_addr.clone(), e.to_string())
        })?;

        info!("Tracker listening on {} (signal socket {})", listen_addr, signal_addr);
        let service = Arc::new(Self::new(Arc::new(Registry::new()), Arc::new(signal_socket)));
        Ok((service, listener))
    }

    /// Shared registry, exposed for inspection in tests
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept loop: one task per control connection
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote) = listener.accept().await.map_err(|e| {
                error!("Failed to accept control connection: {}", e);
                ShareError::network_error_full("Failed to accept connection", "unknown".to_string(), e.to_string())
            })?;
            debug!("Accepted control connection from {}", remote);
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.handle_connection(stream, remote).await {
                    warn!("Connection from {} failed: {}", remote, e);
                }
            });
        }
    }

    /// Drain the signal socket: NAT-bound peers send an opening ACK to
    /// create the return mapping; anything else is logged and dropped
    pub async fn run_signal_drain(self: Arc<Self>) {
        let mut buffer = [0u8; 1024];
        loop {
            match self.signal_socket.recv_from(&mut buffer).await {
                Ok((len, from)) => match serde_json::from_slice::<SignalMessage>(&buffer[..len]) {
                    Ok(SignalMessage::Ack) => {
                        debug!("Signal mapping opened by {}", from);
                    }
                    Ok(other) => {
                        debug!("Unexpected signal message from {}: {:?}", from, other);
                    }
                    Err(e) => {
                        warn!("Malformed signal datagram from {}: {}", from, e);
                    }
                },
                Err(e) => {
                    warn!("Signal socket receive failed: {}", e);
                }
            }
        }
    }

    /// Serve one request/reply transaction and close the connection
    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| {
                ShareError::network_error_retryable("Timed out waiting for request", remote.to_string())
            })?
            .map_err(|e| {
                ShareError::network_error_full("Failed to read request", remote.to_string(), e.to_string())
            })?;

        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!("Request from {}: {:?}", remote, request);
                self.handle_request(request, remote).await
            }
            Err(e) => {
                warn!("Unrecognized request from {}: {}", remote, e);
                Reply::NotYetImplemented
            }
        };

        let mut payload = serde_json::to_vec(&reply)?;
        payload.push(b'\n');
        let stream = reader.get_mut();
        stream.write_all(&payload).await.map_err(|e| {
            ShareError::network_error_full("Failed to write reply", remote.to_string(), e.to_string())
        })?;
        stream.flush().await?;
        Ok(())
    }

    /// Dispatch one parsed request to the registry
    pub async fn handle_request(&self, request: Request, remote: SocketAddr) -> Reply {
        match request {
            Request::InformAndUpdate {
                source_ip,
                source_port,
                files,
                chunks,
                signal_port,
            } => {
                let ip = source_ip.unwrap_or_else(|| remote.ip().to_string());
                let peer = make_peer_id(&ip, source_port);
                self.registry
                    .inform_and_update(peer, &files, &chunks, signal_port)
                    .await;
                Reply::Ack
            }

            Request::QueryListOfFiles => Reply::QueryListOfFilesReply {
                files: self.registry.list_files().await,
            },

            Request::QueryFile { filename } => match self.registry.query_file(&filename).await {
                Some(query) => Reply::QueryFileReply {
                    filename: query.filename,
                    checksum: query.checksum,
                    num_of_chunks: query.num_of_chunks,
                    chunks: query
                        .chunks
                        .into_iter()
                        .map(|(chunk_number, owners)| (chunk_number.to_string(), owners))
                        .collect(),
                    peer_behind_nat: query.peer_behind_nat,
                },
                None => Reply::QueryFileError {
                    error: format!("File not found: {}", filename),
                },
            },

            Request::RequestFileChunkNat {
                owner_address,
                filename,
                file_download_process_id,
                chunk_number,
                receiver_address,
            } => {
                let receiver = receiver_address.unwrap_or_else(|| remote.to_string());
                if let Err(e) = self
                    .relay_chunk_signal(
                        &owner_address,
                        filename,
                        file_download_process_id,
                        chunk_number,
                        receiver,
                    )
                    .await
                {
                    warn!("Failed to relay chunk signal to {}: {}", owner_address, e);
                }
                Reply::Ack
            }

            Request::Exit {
                source_ip,
                source_port,
            } => {
                let ip = source_ip.unwrap_or_else(|| remote.ip().to_string());
                let peer = make_peer_id(&ip, source_port);
                self.registry.remove_peer(&peer).await;
                Reply::Ack
            }
        }
    }

    /// Send a REQUEST_FILE_CHUNK_SIGNAL to the owner's registered signal
    /// port. Pure relaying: no table is mutated here.
    async fn relay_chunk_signal(
        &self,
        owner_address: &str,
        filename: String,
        file_download_process_id: u32,
        chunk_number: u32,
        receiver_address: String,
    ) -> Result<()> {
        let signal_port = self
            .registry
            .signal_port(&owner_address.to_string())
            .await
            .ok_or_else(|| {
                ShareError::registry_error(format!(
                    "Owner {} has no registered signal port",
                    owner_address
                ))
            })?;

        let (owner_ip, _) = owner_address.rsplit_once(':').ok_or_else(|| {
            ShareError::protocol_error_with_source("Malformed owner address", owner_address.to_string())
        })?;
        let target: SocketAddr = format!("{}:{}", owner_ip, signal_port).parse().map_err(
            |e: std::net::AddrParseError| {
                ShareError::network_error_full(
                    "Invalid signal target",
                    owner_address.to_string(),
                    e.to_string(),
                )
            },
        )?;

        let signal = SignalMessage::RequestFileChunkSignal {
            receiver_address,
            filename,
            file_download_process_id,
            chunk_number,
        };
        let payload = serde_json::to_vec(&signal)?;
        self.signal_socket.send_to(&payload, target).await.map_err(|e| {
            ShareError::network_error_full("Failed to send chunk signal", target.to_string(), e.to_string())
        })?;
        info!("Relayed chunk signal for {} to {}", owner_address, target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChunkDeclaration, FileDeclaration};
    use tokio::io::AsyncReadExt;

    async fn start_service() -> (Arc<TrackerService>, SocketAddr, Arc<UdpSocket>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let signal_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let service = Arc::new(TrackerService::new(
            Arc::new(Registry::new()),
            signal_socket.clone(),
        ));
        tokio::spawn(service.clone().run(listener));
        (service, addr, signal_socket)
    }

    async fn exchange(addr: SocketAddr, request: &Request) -> Reply {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut payload = serde_json::to_vec(request).unwrap();
        payload.push(b'\n');
        stream.write_all(&payload).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        serde_json::from_str(response.trim()).unwrap()
    }

    fn register_doc_txt(port: u16) -> Request {
        Request::InformAndUpdate {
            source_ip: Some("10.0.0.1".to_string()),
            source_port: port,
            files: vec![FileDeclaration {
                filename: "doc.txt".to_string(),
                checksum: "abc".to_string(),
                num_of_chunks: 3,
            }],
            chunks: vec![ChunkDeclaration {
                filename: "doc.txt".to_string(),
                chunks: vec![0, 1, 2],
            }],
            signal_port: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_query_over_sockets() {
        let (_service, addr, _signal) = start_service().await;

        let reply = exchange(addr, &register_doc_txt(9000)).await;
        assert!(matches!(reply, Reply::Ack));

        let reply = exchange(
            addr,
            &Request::QueryFile {
                filename: "doc.txt".to_string(),
            },
        )
        .await;
        match reply {
            Reply::QueryFileReply { num_of_chunks, chunks, .. } => {
                assert_eq!(num_of_chunks, 3);
                for key in ["0", "1", "2"] {
                    assert_eq!(chunks.get(key).unwrap(), &vec!["10.0.0.1:9000".to_string()]);
                }
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_missing_file_returns_error_reply() {
        let (_service, addr, _signal) = start_service().await;
        let reply = exchange(
            addr,
            &Request::QueryFile {
                filename: "missing.txt".to_string(),
            },
        )
        .await;
        assert!(matches!(reply, Reply::QueryFileError { .. }));
    }

    #[tokio::test]
    async fn test_exit_drops_sole_owner() {
        let (_service, addr, _signal) = start_service().await;
        exchange(addr, &register_doc_txt(9000)).await;

        let reply = exchange(
            addr,
            &Request::Exit {
                source_ip: Some("10.0.0.1".to_string()),
                source_port: 9000,
            },
        )
        .await;
        assert!(matches!(reply, Reply::Ack));

        let reply = exchange(
            addr,
            &Request::QueryFile {
                filename: "doc.txt".to_string(),
            },
        )
        .await;
        assert!(matches!(reply, Reply::QueryFileError { .. }));
    }

    #[tokio::test]
    async fn test_unknown_message_type_gets_not_yet_implemented() {
        let (_service, addr, _signal) = start_service().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"message_type\":\"SOMETHING_ELSE\"}\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let reply: Reply = serde_json::from_str(response.trim()).unwrap();
        assert!(matches!(reply, Reply::NotYetImplemented));
    }

    #[tokio::test]
    async fn test_nat_relay_sends_signal_datagram() {
        let (_service, addr, _signal) = start_service().await;

        // The "owner" listens where its registered signal port points
        let owner_signal = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let owner_signal_port = owner_signal.local_addr().unwrap().port();

        let reply = exchange(
            addr,
            &Request::InformAndUpdate {
                source_ip: Some("127.0.0.1".to_string()),
                source_port: 9100,
                files: vec![FileDeclaration {
                    filename: "doc.txt".to_string(),
                    checksum: "abc".to_string(),
                    num_of_chunks: 3,
                }],
                chunks: vec![],
                signal_port: Some(owner_signal_port),
            },
        )
        .await;
        assert!(matches!(reply, Reply::Ack));

        let reply = exchange(
            addr,
            &Request::RequestFileChunkNat {
                owner_address: "127.0.0.1:9100".to_string(),
                filename: "doc.txt".to_string(),
                file_download_process_id: 4,
                chunk_number: 1,
                receiver_address: Some("127.0.0.1:9200".to_string()),
            },
        )
        .await;
        assert!(matches!(reply, Reply::Ack));

        let mut buffer = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), owner_signal.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let signal: SignalMessage = serde_json::from_slice(&buffer[..len]).unwrap();
        match signal {
            SignalMessage::RequestFileChunkSignal {
                receiver_address,
                filename,
                file_download_process_id,
                chunk_number,
            } => {
                assert_eq!(receiver_address, "127.0.0.1:9200");
                assert_eq!(filename, "doc.txt");
                assert_eq!(file_download_process_id, 4);
                assert_eq!(chunk_number, 1);
            }
            other => panic!("Unexpected signal: {:?}", other),
        }
    }
}
