//! Control protocol messages
//!
//! Every control exchange with the tracker is one JSON object per line.
//! The `message_type` field selects the variant; a request whose
//! `message_type` is unknown deserializes to an error and is answered
//! with [`Reply::NotYetImplemented`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifies a peer by its reachable endpoint, formatted `"<ip>:<port>"`
pub type PeerId = String;

/// Build a peer id from an ip and port
pub fn make_peer_id(ip: &str, port: u16) -> PeerId {
    format!("{}:{}", ip, port)
}

/// A complete file a peer is sharing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDeclaration {
    pub filename: String,
    pub checksum: String,
    pub num_of_chunks: u32,
}

/// The chunks of a partially held file a peer is sharing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDeclaration {
    pub filename: String,
    pub chunks: Vec<u32>,
}

/// Requests sent peer -> tracker over the control connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum Request {
    /// Declare the files and chunks this peer is sharing
    #[serde(rename = "INFORM_AND_UPDATE")]
    InformAndUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_ip: Option<String>,
        source_port: u16,
        files: Vec<FileDeclaration>,
        chunks: Vec<ChunkDeclaration>,
        /// Present only for peers behind NAT
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal_port: Option<u16>,
    },

    /// Ask for every filename known to the network
    #[serde(rename = "QUERY_LIST_OF_FILES")]
    QueryListOfFiles,

    /// Ask for the metadata and owners of one file
    #[serde(rename = "QUERY_FILE")]
    QueryFile { filename: String },

    /// Ask the tracker to signal a NAT-bound owner to push a chunk
    #[serde(rename = "REQUEST_FILE_CHUNK_NAT")]
    RequestFileChunkNat {
        owner_address: String,
        filename: String,
        file_download_process_id: u32,
        chunk_number: u32,
        /// Defaults to the requester's observed control-connection address
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_address: Option<String>,
    },

    /// Leave the network
    #[serde(rename = "EXIT")]
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_ip: Option<String>,
        source_port: u16,
    },
}

/// Replies sent tracker -> peer over the control connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum Reply {
    #[serde(rename = "ACK")]
    Ack,

    #[serde(rename = "QUERY_LIST_OF_FILES_REPLY")]
    QueryListOfFilesReply { files: Vec<String> },

    /// File metadata plus per-chunk owners. Full-file owners appear at
    /// every chunk index. Map keys are decimal chunk indices.
    #[serde(rename = "QUERY_FILE_REPLY")]
    QueryFileReply {
        filename: String,
        checksum: String,
        num_of_chunks: u32,
        chunks: BTreeMap<String, Vec<PeerId>>,
        peer_behind_nat: Vec<PeerId>,
    },

    #[serde(rename = "QUERY_FILE_ERROR")]
    QueryFileError { error: String },

    #[serde(rename = "NOT_YET_IMPLEMENTED")]
    NotYetImplemented,
}

/// Control-style messages carried inside data-plane CONTROL frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum DataMessage {
    /// Ask the receiving peer to send one chunk back
    #[serde(rename = "REQUEST_FILE_CHUNK")]
    RequestFileChunk {
        file_download_process_id: u32,
        filename: String,
        chunk_number: u32,
    },
}

/// Messages carried on the signal plane (tracker signal socket)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum SignalMessage {
    /// Tracker -> owner: push a chunk to `receiver_address`
    #[serde(rename = "REQUEST_FILE_CHUNK_SIGNAL")]
    RequestFileChunkSignal {
        receiver_address: String,
        filename: String,
        file_download_process_id: u32,
        chunk_number: u32,
    },

    /// Peer -> tracker on signal listener startup, opens the NAT mapping
    /// so the tracker can later relay signals back
    #[serde(rename = "ACK")]
    Ack,
}
