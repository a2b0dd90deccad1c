//! Tracker module
//!
//! The central coordination service: the in-memory registry of files,
//! chunks and their owners, and the control service that answers peer
//! requests and relays NAT signals.

pub mod registry;
pub mod service;

pub use registry::{FileQuery, FileRecord, Registry};
pub use service::TrackerService;
