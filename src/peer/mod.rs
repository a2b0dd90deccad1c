//! Peer module
//!
//! Everything a network participant runs: the tracker control client,
//! the chunked download engine, the upload engine serving chunk
//! requests, and the runtime wiring the sockets and command loop.

pub mod client;
pub mod download;
pub mod runtime;
pub mod upload;

pub use client::{ControlChannel, TrackerClient};
pub use download::{pick_owner, DownloadEngine, DownloadProcess};
pub use runtime::{PeerRuntime, PeerSettings};
pub use upload::UploadEngine;
