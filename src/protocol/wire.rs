//! Data-plane datagram framing
//!
//! Every datagram on a peer's data socket starts with a one-byte frame
//! kind, so control messages and raw chunk payloads share one socket
//! without guessing from parse failures. Chunk frames carry a binary
//! header of two big-endian u32 fields (process id, chunk number)
//! followed by the raw chunk bytes.

use crate::error::ShareError;
use crate::protocol::message::DataMessage;
use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};

/// Largest datagram a peer will send or accept on the data plane
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Frame kind byte + process id + chunk number
pub const CHUNK_HEADER_LEN: usize = 9;

/// Discriminator byte prepended to every data-plane datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Empty hole-punch datagram, dropped by the receiver
    Ping = 0x00,
    /// JSON control message ([`DataMessage`])
    Control = 0x01,
    /// Binary chunk header + raw chunk bytes
    Chunk = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(FrameKind::Ping),
            0x01 => Ok(FrameKind::Control),
            0x02 => Ok(FrameKind::Chunk),
            _ => Err(ShareError::protocol_error_with_source(
                "Unknown frame kind",
                format!("byte: {:#04x}", value),
            )
            .into()),
        }
    }
}

/// A decoded data-plane datagram
#[derive(Debug, Clone)]
pub enum Frame {
    Ping,
    Control(DataMessage),
    Chunk {
        process_id: u32,
        chunk_number: u32,
        payload: Vec<u8>,
    },
}

impl Frame {
    /// Kind byte of this frame
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Ping => FrameKind::Ping,
            Frame::Control(_) => FrameKind::Control,
            Frame::Chunk { .. } => FrameKind::Chunk,
        }
    }

    /// Serialize the frame to one datagram
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind() as u8);
        match self {
            Frame::Ping => {}
            Frame::Control(message) => {
                let body = serde_json::to_vec(message)
                    .map_err(|e| ShareError::protocol_error_with_source(
                        "Failed to serialize control message",
                        e.to_string(),
                    ))?;
                buf.put_slice(&body);
            }
            Frame::Chunk { process_id, chunk_number, payload } => {
                buf.put_u32(*process_id);
                buf.put_u32(*chunk_number);
                buf.put_slice(payload);
            }
        }
        Ok(buf.to_vec())
    }

    /// Parse one received datagram
    pub fn decode(data: &[u8]) -> Result<Frame> {
        if data.is_empty() {
            return Err(ShareError::protocol_error("Empty datagram").into());
        }
        let kind = FrameKind::try_from(data[0])?;
        match kind {
            FrameKind::Ping => Ok(Frame::Ping),
            FrameKind::Control => {
                let message: DataMessage = serde_json::from_slice(&data[1..])
                    .map_err(|e| ShareError::protocol_error_with_source(
                        "Malformed control frame",
                        e.to_string(),
                    ))?;
                Ok(Frame::Control(message))
            }
            FrameKind::Chunk => {
                if data.len() < CHUNK_HEADER_LEN {
                    return Err(ShareError::protocol_error_with_source(
                        "Truncated chunk frame",
                        format!("length: {}", data.len()),
                    )
                    .into());
                }
                let mut header = &data[1..CHUNK_HEADER_LEN];
                let process_id = header.get_u32();
                let chunk_number = header.get_u32();
                Ok(Frame::Chunk {
                    process_id,
                    chunk_number,
                    payload: data[CHUNK_HEADER_LEN..].to_vec(),
                })
            }
        }
    }
}
