//! Peer runtime
//!
//! Binds the data socket, wires the upload and download engines
//! together, registers with the tracker and drives the interactive
//! command loop. Hole-punching peers additionally discover their public
//! endpoint and run a signal listener for tracker-relayed chunk
//! requests.

use crate::error::ShareError;
use crate::nat::{discover_mapping, SignalListener, StunClient};
use crate::peer::client::TrackerClient;
use crate::peer::download::{DownloadEngine, DEFAULT_RETRY_AFTER};
use crate::peer::upload::UploadEngine;
use crate::peer::ControlChannel;
use crate::protocol::{make_peer_id, DataMessage, Frame, Reply, Request, MAX_DATAGRAM_SIZE};
use crate::storage::{ChunkStore, DEFAULT_CHUNK_SIZE};
use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

const COMMAND_MENU: &str = "\
Commands:
  1           List all available files on the network
  2 <file>    List all peers possessing a file
  3 <file>    Download a file
  4           Update the tracker with your new files and chunks
  5           Exit the network";

/// Everything needed to bring a peer up
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Local data socket port (0 picks an ephemeral port)
    pub port: u16,
    pub tracker_ip: String,
    pub tracker_port: u16,
    pub tracker_signal_port: u16,
    /// Directory shared with the network
    pub shared_directory: PathBuf,
    /// Whether this peer sits behind a NAT and needs hole punching
    pub hole_punching: bool,
    /// Local signal socket port, used only when hole punching
    pub signal_port: u16,
    pub chunk_size: usize,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            port: 0,
            tracker_ip: "127.0.0.1".to_string(),
            tracker_port: 7000,
            tracker_signal_port: 7001,
            shared_directory: PathBuf::from("."),
            hole_punching: false,
            signal_port: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// A running peer: engines, sockets and tracker identity
pub struct PeerRuntime {
    store: ChunkStore,
    tracker: Arc<dyn ControlChannel>,
    upload: Arc<UploadEngine>,
    download: Arc<DownloadEngine>,
    /// The ip the tracker should key this peer under, when known
    source_ip: Option<String>,
    /// The port half of this peer's tracker identity
    source_port: u16,
    /// Registered signal port, present only for hole-punching peers
    signal_port: Option<u16>,
}

impl std::fmt::Debug for PeerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRuntime")
            .field("source_ip", &self.source_ip)
            .field("source_port", &self.source_port)
            .field("signal_port", &self.signal_port)
            .finish_non_exhaustive()
    }
}

impl PeerRuntime {
    /// Bring the peer up against the real tracker named in `settings`
    pub async fn start(
        settings: PeerSettings,
        stun: Option<Arc<dyn StunClient>>,
    ) -> Result<Arc<Self>> {
        let tracker_address = make_peer_id(&settings.tracker_ip, settings.tracker_port);
        let tracker: Arc<dyn ControlChannel> = Arc::new(TrackerClient::new(tracker_address));
        Self::assemble(settings, tracker, stun).await
    }

    /// Bring the peer up over a caller-supplied control channel. Binds
    /// the sockets, spawns the receive and retry loops and registers
    /// with the tracker.
    pub async fn assemble(
        settings: PeerSettings,
        tracker: Arc<dyn ControlChannel>,
        stun: Option<Arc<dyn StunClient>>,
    ) -> Result<Arc<Self>> {
        let store = ChunkStore::new(settings.shared_directory.clone(), settings.chunk_size);
        if !store.directory().is_dir() {
            return Err(ShareError::config_error_with_field(
                format!(
                    "Shared directory does not exist: {}",
                    store.directory().display()
                ),
                "shared_directory",
            )
            .into());
        }

        let socket = Arc::new(
            UdpSocket::bind(("0.0.0.0", settings.port)).await.map_err(|e| {
                ShareError::network_error_full(
                    "Failed to bind data socket",
                    format!("0.0.0.0:{}", settings.port),
                    e.to_string(),
                )
            })?,
        );
        let local_port = socket.local_addr()?.port();

        let stun = match (settings.hole_punching, stun) {
            (true, Some(stun)) => Some(stun),
            (true, None) => {
                return Err(ShareError::config_error_with_field(
                    "Hole punching requires a STUN client",
                    "hole_punching",
                )
                .into());
            }
            (false, _) => None,
        };

        // The identity other peers reach us under: the NAT mapping when
        // punched through, the local endpoint otherwise
        let (source_ip, source_port) = match &stun {
            Some(stun) => {
                let mapping = discover_mapping(stun.as_ref(), local_port).await?;
                (Some(mapping.external_ip), mapping.external_port)
            }
            None => (
                local_ip_toward(&settings.tracker_ip, settings.tracker_port),
                local_port,
            ),
        };

        let self_address = match &source_ip {
            Some(ip) => make_peer_id(ip, source_port),
            None => make_peer_id("127.0.0.1", source_port),
        };

        let upload = Arc::new(UploadEngine::new(store.clone(), socket.clone()));
        let download = Arc::new(DownloadEngine::new(
            store.clone(),
            socket.clone(),
            tracker.clone(),
            self_address,
            settings.hole_punching,
        ));

        let signal_port = if let Some(stun) = &stun {
            let signal_socket = Arc::new(
                UdpSocket::bind(("0.0.0.0", settings.signal_port))
                    .await
                    .map_err(|e| {
                        ShareError::network_error_full(
                            "Failed to bind signal socket",
                            format!("0.0.0.0:{}", settings.signal_port),
                            e.to_string(),
                        )
                    })?,
            );
            let bound_port = signal_socket.local_addr()?.port();
            // The signal socket sits behind the same NAT as the data
            // socket, so the tracker must relay to its external mapping,
            // not the locally bound port
            let mapping = discover_mapping(stun.as_ref(), bound_port).await?;
            let tracker_signal: SocketAddr =
                make_peer_id(&settings.tracker_ip, settings.tracker_signal_port).parse()?;
            tokio::spawn(
                SignalListener::new(signal_socket, tracker_signal, upload.clone()).run(),
            );
            Some(mapping.external_port)
        } else {
            None
        };

        let runtime = Arc::new(Self {
            store,
            tracker,
            upload: upload.clone(),
            download: download.clone(),
            source_ip,
            source_port,
            signal_port,
        });

        tokio::spawn(run_data_loop(socket, upload, download.clone()));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEFAULT_RETRY_AFTER);
            loop {
                interval.tick().await;
                download.retry_stalled(DEFAULT_RETRY_AFTER).await;
            }
        });

        runtime.register_as_peer().await?;
        Ok(runtime)
    }

    /// The download engine, exposed for inspection in tests
    pub fn download(&self) -> &Arc<DownloadEngine> {
        &self.download
    }

    /// The upload engine
    pub fn upload(&self) -> &Arc<UploadEngine> {
        &self.upload
    }

    /// Register everything in the shared directory with the tracker.
    /// Failure here is fatal: a peer the tracker does not know about
    /// cannot participate.
    pub async fn register_as_peer(&self) -> Result<()> {
        let (files, chunks) = self.store.scan().await?;
        info!(
            "Registering with tracker: {} files, {} partial downloads",
            files.len(),
            chunks.len()
        );
        let reply = self
            .tracker
            .send(Request::InformAndUpdate {
                source_ip: self.source_ip.clone(),
                source_port: self.source_port,
                files,
                chunks,
                signal_port: self.signal_port,
            })
            .await
            .map_err(|e| {
                error!("Tracker registration failed: {}", e);
                e
            })?;
        if !matches!(reply, Reply::Ack) {
            return Err(ShareError::protocol_error_with_source(
                "Tracker rejected registration",
                format!("{:?}", reply),
            )
            .into());
        }
        Ok(())
    }

    /// Re-scan the shared directory and tell the tracker what is new
    pub async fn update_tracker_new_files(&self) -> Result<()> {
        self.register_as_peer().await
    }

    /// Print every file the network offers
    pub async fn get_available_files(&self) -> Result<Vec<String>> {
        let reply = self.tracker.send(Request::QueryListOfFiles).await?;
        let files = match reply {
            Reply::QueryListOfFilesReply { files } => files,
            other => {
                return Err(ShareError::protocol_error_with_source(
                    "Unexpected tracker reply to QUERY_LIST_OF_FILES",
                    format!("{:?}", other),
                )
                .into());
            }
        };
        if files.is_empty() {
            println!("No files available in the network");
        } else {
            println!("These are the available files on the network:");
            for (index, filename) in files.iter().enumerate() {
                println!("{}: {}", index + 1, filename);
            }
        }
        Ok(files)
    }

    /// Print the owners of every chunk of one file
    pub async fn get_peers_with_file(&self, filename: &str) -> Result<()> {
        let reply = self
            .tracker
            .send(Request::QueryFile {
                filename: filename.to_string(),
            })
            .await?;
        match reply {
            Reply::QueryFileReply {
                filename,
                num_of_chunks,
                chunks,
                peer_behind_nat,
                ..
            } => {
                println!("{} ({} chunks)", filename, num_of_chunks);
                for (chunk_number, owners) in chunks {
                    println!("  chunk {}: {}", chunk_number, owners.join(", "));
                }
                if !peer_behind_nat.is_empty() {
                    println!("  behind NAT: {}", peer_behind_nat.join(", "));
                }
            }
            Reply::QueryFileError { error } => println!("{}", error),
            other => {
                return Err(ShareError::protocol_error_with_source(
                    "Unexpected tracker reply to QUERY_FILE",
                    format!("{:?}", other),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Deregister from the tracker
    pub async fn exit_network(&self) -> Result<()> {
        let reply = self
            .tracker
            .send(Request::Exit {
                source_ip: self.source_ip.clone(),
                source_port: self.source_port,
            })
            .await?;
        if !matches!(reply, Reply::Ack) {
            warn!("Tracker did not acknowledge exit: {:?}", reply);
        }
        info!("Deregistered from tracker");
        Ok(())
    }

    /// Run the interactive command loop on stdin until the user exits
    pub async fn run_command_loop(&self) -> Result<()> {
        println!("{}", COMMAND_MENU);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        print!("# > ");
        use std::io::Write as _;
        std::io::stdout().flush().ok();
        while let Some(line) = lines.next_line().await? {
            match self.handle_command(&line).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("Command failed: {}", e),
            }
            print!("# > ");
            std::io::stdout().flush().ok();
        }
        Ok(())
    }

    /// Dispatch one command line. Returns `false` once the peer should
    /// shut down.
    pub async fn handle_command(&self, line: &str) -> Result<bool> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (command, argument) = match tokens.as_slice() {
            [command] => (*command, None),
            [command, argument] => (*command, Some(*argument)),
            _ => {
                println!("{}", COMMAND_MENU);
                println!("Invalid command");
                return Ok(true);
            }
        };

        match (command, argument) {
            ("1", None) => {
                self.get_available_files().await?;
            }
            ("2", Some(filename)) => {
                self.get_peers_with_file(filename).await?;
            }
            ("3", Some(filename)) => {
                self.download.initiate_download(filename).await?;
            }
            ("4", None) => {
                self.update_tracker_new_files().await?;
                println!("Tracker updated");
            }
            ("5", None) => {
                self.exit_network().await?;
                println!("Exiting...");
                return Ok(false);
            }
            ("2" | "3", None) => {
                println!("Please provide a filename");
            }
            _ => {
                println!("{}", COMMAND_MENU);
                println!("Invalid command");
            }
        }
        Ok(true)
    }
}

/// Receive loop over the data socket: chunk requests go to the upload
/// engine, chunk frames to the download engine, pings open mappings and
/// carry no payload
async fn run_data_loop(
    socket: Arc<UdpSocket>,
    upload: Arc<UploadEngine>,
    download: Arc<DownloadEngine>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Data socket receive failed: {}", e);
                continue;
            }
        };
        let frame = match Frame::decode(&buffer[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed datagram from {}: {}", from, e);
                continue;
            }
        };
        match frame {
            Frame::Ping => {
                debug!("Hole-punch ping from {}", from);
            }
            Frame::Control(DataMessage::RequestFileChunk {
                file_download_process_id,
                filename,
                chunk_number,
            }) => {
                if let Err(e) = upload
                    .serve_chunk(&filename, file_download_process_id, chunk_number, from)
                    .await
                {
                    warn!("Failed to serve chunk {} of {}: {}", chunk_number, filename, e);
                }
            }
            Frame::Chunk {
                process_id,
                chunk_number,
                payload,
            } => {
                if let Err(e) = download.handle_chunk(process_id, chunk_number, &payload).await {
                    warn!("Failed to process chunk {}: {}", chunk_number, e);
                }
            }
        }
    }
}

/// Best-effort guess of the local ip a datagram to the tracker would
/// leave from. `None` leaves the choice to the tracker, which falls back
/// to the control connection's address.
fn local_ip_toward(tracker_ip: &str, tracker_port: u16) -> Option<String> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe
        .connect((tracker_ip, tracker_port))
        .ok()
        .and_then(|_| probe.local_addr().ok())
        .map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Registry, TrackerService};
    use tokio::net::TcpListener;

    async fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("peer_runtime_{}", tag));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();
        dir
    }

    async fn start_tracker() -> (Arc<TrackerService>, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let signal_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let service = Arc::new(TrackerService::new(
            Arc::new(Registry::new()),
            signal_socket,
        ));
        tokio::spawn(service.clone().run(listener));
        (service, port)
    }

    fn settings(dir: PathBuf, tracker_port: u16) -> PeerSettings {
        PeerSettings {
            port: 0,
            tracker_ip: "127.0.0.1".to_string(),
            tracker_port,
            tracker_signal_port: 1,
            shared_directory: dir,
            hole_punching: false,
            signal_port: 0,
            chunk_size: 4,
        }
    }

    #[tokio::test]
    async fn test_startup_registers_shared_files() {
        let dir = temp_dir("registers").await;
        tokio::fs::write(dir.join("shared.bin"), b"aaaabbbb").await.unwrap();
        let (service, tracker_port) = start_tracker().await;

        let runtime = PeerRuntime::start(settings(dir.clone(), tracker_port), None)
            .await
            .unwrap();

        assert_eq!(service.registry().file_count().await, 1);
        let listing = runtime.get_available_files().await.unwrap();
        assert_eq!(listing, vec!["shared.bin".to_string()]);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_shared_directory_is_config_error() {
        let (_service, tracker_port) = start_tracker().await;
        let missing = std::env::temp_dir().join("peer_runtime_does_not_exist");
        let err = PeerRuntime::start(settings(missing, tracker_port), None)
            .await
            .unwrap_err();
        let share_err = err.downcast_ref::<ShareError>().unwrap();
        assert!(matches!(share_err, ShareError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn test_exit_command_deregisters_and_stops_loop() {
        let dir = temp_dir("exit").await;
        tokio::fs::write(dir.join("shared.bin"), b"aaaabbbb").await.unwrap();
        let (service, tracker_port) = start_tracker().await;

        let runtime = PeerRuntime::start(settings(dir.clone(), tracker_port), None)
            .await
            .unwrap();
        assert_eq!(service.registry().file_count().await, 1);

        let keep_running = runtime.handle_command("5").await.unwrap();
        assert!(!keep_running);
        assert_eq!(service.registry().file_count().await, 0);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_commands_keep_the_loop_alive() {
        let dir = temp_dir("invalid").await;
        let (_service, tracker_port) = start_tracker().await;
        let runtime = PeerRuntime::start(settings(dir.clone(), tracker_port), None)
            .await
            .unwrap();

        assert!(runtime.handle_command("nonsense").await.unwrap());
        assert!(runtime.handle_command("9").await.unwrap());
        assert!(runtime.handle_command("3").await.unwrap());
        assert!(runtime.handle_command("1 2 3").await.unwrap());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_hole_punching_registers_external_signal_port() {
        use crate::nat::{FixedStunClient, StunMapping};

        let dir = temp_dir("nat_register").await;
        tokio::fs::write(dir.join("shared.bin"), b"aaaabbbb").await.unwrap();
        let (service, tracker_port) = start_tracker().await;

        // Reserve a local signal port so the mapping can be keyed on it
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_signal_port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut settings = settings(dir.clone(), tracker_port);
        settings.hole_punching = true;
        settings.signal_port = local_signal_port;

        let stun: Arc<dyn StunClient> = Arc::new(
            FixedStunClient::new(StunMapping {
                nat_type: "Full Cone".to_string(),
                external_ip: "127.0.0.1".to_string(),
                external_port: 9400,
            })
            .with_port(local_signal_port, 9401),
        );

        let _runtime = PeerRuntime::start(settings, Some(stun)).await.unwrap();

        // Registered under the external data endpoint, with the external
        // signal port rather than the locally bound one
        let peer_id = "127.0.0.1:9400".to_string();
        assert_eq!(service.registry().signal_port(&peer_id).await, Some(9401));
        assert_ne!(local_signal_port, 9401);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_peers_transfer_a_file_end_to_end() {
        let seed_dir = temp_dir("seed").await;
        let leech_dir = temp_dir("leech").await;
        tokio::fs::write(seed_dir.join("data.bin"), b"aaaabbbbcc").await.unwrap();
        let (_service, tracker_port) = start_tracker().await;

        let _seeder = PeerRuntime::start(settings(seed_dir.clone(), tracker_port), None)
            .await
            .unwrap();
        let leecher = PeerRuntime::start(settings(leech_dir.clone(), tracker_port), None)
            .await
            .unwrap();

        assert!(leecher.handle_command("3 data.bin").await.unwrap());

        // Chunks flow over loopback; poll until the file materializes
        let path = leech_dir.join("data.bin");
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if path.is_file() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "download timed out");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"aaaabbbbcc");

        tokio::fs::remove_dir_all(&seed_dir).await.unwrap();
        tokio::fs::remove_dir_all(&leech_dir).await.unwrap();
    }
}
