//! CLI configuration module
//!
//! Turns parsed arguments into validated tracker or peer configuration.

use crate::cli::args::{CliArgs, Role};
use crate::peer::PeerSettings;
use crate::storage::DEFAULT_CHUNK_SIZE;
use anyhow::Result;

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub enum Config {
    Tracker(TrackerConfig),
    Peer(PeerSettings),
}

/// Tracker-side configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Control port peers connect to
    pub port: u16,
    /// UDP port for relaying NAT chunk signals
    pub signal_port: u16,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        match &args.role {
            Role::Tracker { port, signal_port } => Config::Tracker(TrackerConfig {
                port: *port,
                signal_port: *signal_port,
            }),
            Role::Peer {
                shared_directory,
                port,
                tracker_ip,
                tracker_port,
                tracker_signal_port,
                hole_punching,
                signal_port,
                ..
            } => Config::Peer(PeerSettings {
                port: *port,
                tracker_ip: tracker_ip.clone(),
                tracker_port: *tracker_port,
                tracker_signal_port: *tracker_signal_port,
                shared_directory: shared_directory.clone(),
                hole_punching: *hole_punching,
                signal_port: *signal_port,
                chunk_size: DEFAULT_CHUNK_SIZE,
            }),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self {
            Config::Tracker(tracker) => {
                if tracker.port == 0 {
                    return Err(anyhow::anyhow!("Tracker port cannot be 0"));
                }
                if tracker.signal_port == 0 {
                    return Err(anyhow::anyhow!("Tracker signal port cannot be 0"));
                }
                if tracker.port == tracker.signal_port {
                    return Err(anyhow::anyhow!(
                        "Tracker control and signal ports must differ"
                    ));
                }
            }
            Config::Peer(peer) => {
                if peer.tracker_ip.is_empty() {
                    return Err(anyhow::anyhow!("Tracker ip cannot be empty"));
                }
                if peer.tracker_port == 0 {
                    return Err(anyhow::anyhow!("Tracker port cannot be 0"));
                }
                if peer.shared_directory.as_os_str().is_empty() {
                    return Err(anyhow::anyhow!("Shared directory cannot be empty"));
                }
                if peer.chunk_size == 0 {
                    return Err(anyhow::anyhow!("Chunk size must be at least 1"));
                }
                // The operator-supplied NAT mapping is keyed by the local
                // signal port, so an ephemeral one cannot be mapped
                if peer.hole_punching && peer.signal_port == 0 {
                    return Err(anyhow::anyhow!(
                        "Hole punching requires an explicit --signal-port"
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_tracker_config_from_args() {
        let args = CliArgs::try_parse_from(["p2p-chunk-share", "tracker", "--port", "8000"])
            .unwrap();
        let config = Config::from_args(&args);
        config.validate().unwrap();
        match config {
            Config::Tracker(tracker) => {
                assert_eq!(tracker.port, 8000);
                assert_eq!(tracker.signal_port, 7001);
            }
            other => panic!("Unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_equal_tracker_ports_rejected() {
        let args = CliArgs::try_parse_from([
            "p2p-chunk-share",
            "tracker",
            "--port",
            "7000",
            "--signal-port",
            "7000",
        ])
        .unwrap();
        assert!(Config::from_args(&args).validate().is_err());
    }

    #[test]
    fn test_hole_punching_requires_explicit_signal_port() {
        let args = CliArgs::try_parse_from([
            "p2p-chunk-share",
            "peer",
            "/srv/share",
            "--hole-punching",
            "--external-ip",
            "203.0.113.5",
            "--external-port",
            "9400",
            "--external-signal-port",
            "9401",
        ])
        .unwrap();
        assert!(Config::from_args(&args).validate().is_err());

        let args = CliArgs::try_parse_from([
            "p2p-chunk-share",
            "peer",
            "/srv/share",
            "--hole-punching",
            "--signal-port",
            "9001",
            "--external-ip",
            "203.0.113.5",
            "--external-port",
            "9400",
            "--external-signal-port",
            "9401",
        ])
        .unwrap();
        Config::from_args(&args).validate().unwrap();
    }

    #[test]
    fn test_peer_config_from_args() {
        let args =
            CliArgs::try_parse_from(["p2p-chunk-share", "peer", "/srv/share"]).unwrap();
        let config = Config::from_args(&args);
        config.validate().unwrap();
        match config {
            Config::Peer(peer) => {
                assert_eq!(peer.chunk_size, DEFAULT_CHUNK_SIZE);
                assert!(!peer.hole_punching);
            }
            other => panic!("Unexpected config: {:?}", other),
        }
    }
}
