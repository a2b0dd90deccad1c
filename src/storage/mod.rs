//! Storage module
//!
//! The shared-directory chunk store used by the peer.

pub mod store;

pub use store::{ChunkStore, DEFAULT_CHUNK_SIZE};
