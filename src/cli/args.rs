//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments for the p2p file sharing client
#[derive(Debug, Parser)]
#[command(name = "p2p-chunk-share")]
#[command(about = "A peer-to-peer chunked file sharing network", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub role: Role,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Which half of the network to run
#[derive(Debug, Subcommand)]
pub enum Role {
    /// Run the central tracker
    Tracker {
        /// Control port peers connect to
        #[arg(short, long, default_value_t = 7000)]
        port: u16,

        /// UDP port for relaying NAT chunk signals
        #[arg(long, default_value_t = 7001)]
        signal_port: u16,
    },

    /// Run a peer sharing a local directory
    Peer {
        /// Directory shared with the network
        #[arg(value_name = "SHARED_DIR")]
        shared_directory: PathBuf,

        /// UDP data port (0 picks an ephemeral port)
        #[arg(short, long, default_value_t = 0)]
        port: u16,

        /// Tracker host or ip
        #[arg(short, long, default_value = "127.0.0.1")]
        tracker_ip: String,

        /// Tracker control port
        #[arg(long, default_value_t = 7000)]
        tracker_port: u16,

        /// Tracker signal port
        #[arg(long, default_value_t = 7001)]
        tracker_signal_port: u16,

        /// Punch through a NAT before registering
        #[arg(long)]
        hole_punching: bool,

        /// Local UDP port for relayed chunk signals
        #[arg(long, default_value_t = 0)]
        signal_port: u16,

        /// Public ip of the NAT mapping, required with --hole-punching
        #[arg(long, requires = "hole_punching")]
        external_ip: Option<String>,

        /// Public port of the NAT mapping, required with --hole-punching
        #[arg(long, requires = "hole_punching")]
        external_port: Option<u16>,

        /// Public port of the signal socket's NAT mapping, required with
        /// --hole-punching
        #[arg(long, requires = "hole_punching")]
        external_signal_port: Option<u16>,
    },
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_defaults() {
        let args = CliArgs::try_parse_from(["p2p-chunk-share", "tracker"]).unwrap();
        match args.role {
            Role::Tracker { port, signal_port } => {
                assert_eq!(port, 7000);
                assert_eq!(signal_port, 7001);
            }
            other => panic!("Unexpected role: {:?}", other),
        }
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_peer_flags() {
        let args = CliArgs::try_parse_from([
            "p2p-chunk-share",
            "peer",
            "/srv/share",
            "--tracker-ip",
            "192.0.2.10",
            "--hole-punching",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
        match args.role {
            Role::Peer {
                shared_directory,
                tracker_ip,
                tracker_port,
                hole_punching,
                ..
            } => {
                assert_eq!(shared_directory, PathBuf::from("/srv/share"));
                assert_eq!(tracker_ip, "192.0.2.10");
                assert_eq!(tracker_port, 7000);
                assert!(hole_punching);
            }
            other => panic!("Unexpected role: {:?}", other),
        }
    }

    #[test]
    fn test_peer_requires_shared_directory() {
        assert!(CliArgs::try_parse_from(["p2p-chunk-share", "peer"]).is_err());
    }
}
