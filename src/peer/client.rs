//! Tracker control client
//!
//! Synchronous request/reply exchanges with the tracker over a fresh TCP
//! connection per transaction, bounded by a timeout so a silent tracker
//! surfaces as a retryable network error instead of a hang.

use crate::error::ShareError;
use crate::protocol::{Reply, Request};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default bound on one full control exchange
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// The control channel to the tracker. A trait so engines can be tested
/// against a stub tracker.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Send one request and wait for its reply
    async fn send(&self, request: Request) -> Result<Reply>;
}

/// Real TCP control channel
pub struct TrackerClient {
    address: String,
    exchange_timeout: Duration,
}

impl TrackerClient {
    /// Create a client for a tracker at `"<host>:<port>"`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    /// Override the exchange timeout
    pub fn with_timeout(mut self, exchange_timeout: Duration) -> Self {
        self.exchange_timeout = exchange_timeout;
        self
    }

    /// Tracker address this client talks to
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn exchange(&self, request: &Request) -> Result<Reply> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            ShareError::network_error_full(
                "Failed to connect to tracker",
                self.address.clone(),
                e.to_string(),
            )
        })?;

        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');

        let mut reader = BufReader::new(stream);
        reader.get_mut().write_all(&payload).await.map_err(|e| {
            ShareError::network_error_full(
                "Failed to send request to tracker",
                self.address.clone(),
                e.to_string(),
            )
        })?;
        reader.get_mut().flush().await?;

        let mut line = String::new();
        reader.read_line(&mut line).await.map_err(|e| {
            ShareError::network_error_full(
                "Failed to read tracker reply",
                self.address.clone(),
                e.to_string(),
            )
        })?;

        let reply: Reply = serde_json::from_str(line.trim()).map_err(|e| {
            ShareError::protocol_error_with_source("Malformed tracker reply", e.to_string())
        })?;
        debug!("Tracker reply: {:?}", reply);
        Ok(reply)
    }
}

#[async_trait]
impl ControlChannel for TrackerClient {
    async fn send(&self, request: Request) -> Result<Reply> {
        timeout(self.exchange_timeout, self.exchange(&request))
            .await
            .map_err(|_| {
                ShareError::network_error_retryable(
                    "Tracker exchange timed out",
                    self.address.clone(),
                )
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Registry, TrackerService};
    use std::sync::Arc;
    use tokio::net::{TcpListener, UdpSocket};

    async fn start_tracker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let signal_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let service = Arc::new(TrackerService::new(Arc::new(Registry::new()), signal_socket));
        tokio::spawn(service.run(listener));
        addr.to_string()
    }

    #[tokio::test]
    async fn test_round_trip_against_live_tracker() {
        let address = start_tracker().await;
        let client = TrackerClient::new(address);

        let reply = client.send(Request::QueryListOfFiles).await.unwrap();
        match reply {
            Reply::QueryListOfFilesReply { files } => assert!(files.is_empty()),
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_network_error() {
        // Reserved port with nothing listening
        let client =
            TrackerClient::new("127.0.0.1:1").with_timeout(Duration::from_millis(500));
        let err = client.send(Request::QueryListOfFiles).await.unwrap_err();
        let share_err = err.downcast_ref::<ShareError>().unwrap();
        assert!(matches!(share_err, ShareError::NetworkError { .. }));
    }
}
