//! Protocol module
//!
//! Control-plane JSON messages exchanged with the tracker and the
//! data-plane datagram framing used between peers.

pub mod message;
pub mod wire;

pub use message::{
    ChunkDeclaration, DataMessage, FileDeclaration, PeerId, Reply, Request, SignalMessage,
    make_peer_id,
};
pub use wire::{Frame, FrameKind, CHUNK_HEADER_LEN, MAX_DATAGRAM_SIZE};
