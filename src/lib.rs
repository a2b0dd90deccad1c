//! p2p-chunk-share
//!
//! A peer-to-peer chunked file sharing network: a central tracker keeps
//! the file and chunk registry while peers move chunks between each
//! other over UDP, punching through NATs where needed.

pub mod cli;
pub mod error;
pub mod nat;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod tracker;

pub use error::ShareError;

pub use cli::{CliArgs, Config, Role, TrackerConfig};
pub use nat::{
    discover_mapping, FixedStunClient, SignalListener, StunClient, StunMapping, SYMMETRIC_NAT,
};
pub use peer::{
    pick_owner, ControlChannel, DownloadEngine, DownloadProcess, PeerRuntime, PeerSettings,
    TrackerClient, UploadEngine,
};
pub use protocol::{
    make_peer_id, ChunkDeclaration, DataMessage, FileDeclaration, Frame, FrameKind, PeerId,
    Reply, Request, SignalMessage, CHUNK_HEADER_LEN, MAX_DATAGRAM_SIZE,
};
pub use storage::{ChunkStore, DEFAULT_CHUNK_SIZE};
pub use tracker::{FileQuery, FileRecord, Registry, TrackerService};
