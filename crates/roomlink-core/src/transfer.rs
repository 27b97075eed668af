//! Chunked file transfer protocol over a direct peer channel
//!
//! A transfer is a descriptor frame, any number of chunk frames, and a
//! completion frame, all tagged with the transfer id. Several transfers may
//! be interleaved on one channel. The channel is reliable and ordered, so
//! the receiver never resequences chunks.
//!
//! Frames are serialized with bincode.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::{ErrorCode, ProtocolError};

/// Metadata announced before the first chunk of a transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub id: String,
    pub name: String,
    pub media_type: Option<String>,
    pub total_size: u64,
}

/// A single frame on the transfer channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFrame {
    Descriptor(TransferDescriptor),
    Chunk { id: String, data: Vec<u8> },
    Complete { id: String },
}

impl TransferFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Transfer id this frame belongs to
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferFrame::Descriptor(d) => &d.id,
            TransferFrame::Chunk { id, .. } => id,
            TransferFrame::Complete { id } => id,
        }
    }
}

/// Transfer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("chunk or completion for unknown transfer {0}")]
    UnknownTransfer(String),

    #[error("transfer {0} already in progress")]
    DuplicateTransfer(String),

    #[error("transfer {id} length mismatch: declared {expected} bytes, received {actual}")]
    LengthMismatch { id: String, expected: u64, actual: u64 },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("channel error: {0}")]
    Channel(String),
}

impl From<&TransferError> for ErrorCode {
    fn from(e: &TransferError) -> Self {
        match e {
            TransferError::TooLarge { .. } => ErrorCode::ResourceLimit,
            TransferError::UnknownTransfer(_) => ErrorCode::ProtocolViolation,
            TransferError::DuplicateTransfer(_) => ErrorCode::ProtocolViolation,
            TransferError::LengthMismatch { .. } => ErrorCode::ProtocolViolation,
            TransferError::Protocol(p) => ErrorCode::from(p),
            TransferError::Channel(_) => ErrorCode::TransientIo,
        }
    }
}

/// Split a payload into the frame sequence for one transfer.
///
/// Fails with `TooLarge` before producing anything if the payload exceeds
/// `max_bytes`.
pub fn outgoing_frames<'a>(
    id: &str,
    name: &str,
    media_type: Option<&str>,
    data: &'a [u8],
    chunk_size: usize,
    max_bytes: u64,
) -> Result<OutgoingFrames<'a>, TransferError> {
    let size = data.len() as u64;
    if size > max_bytes {
        return Err(TransferError::TooLarge {
            size,
            max: max_bytes,
        });
    }

    Ok(OutgoingFrames {
        id: id.to_string(),
        descriptor: Some(TransferDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            media_type: media_type.map(str::to_string),
            total_size: size,
        }),
        chunks: data.chunks(chunk_size.max(1)),
        completed: false,
    })
}

/// Iterator over the frames of one outgoing transfer
pub struct OutgoingFrames<'a> {
    id: String,
    descriptor: Option<TransferDescriptor>,
    chunks: std::slice::Chunks<'a, u8>,
    completed: bool,
}

impl Iterator for OutgoingFrames<'_> {
    type Item = TransferFrame;

    fn next(&mut self) -> Option<TransferFrame> {
        if let Some(descriptor) = self.descriptor.take() {
            return Some(TransferFrame::Descriptor(descriptor));
        }

        if let Some(chunk) = self.chunks.next() {
            return Some(TransferFrame::Chunk {
                id: self.id.clone(),
                data: chunk.to_vec(),
            });
        }

        if !self.completed {
            self.completed = true;
            return Some(TransferFrame::Complete {
                id: self.id.clone(),
            });
        }

        None
    }
}

/// A fully received payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFile {
    pub descriptor: TransferDescriptor,
    pub data: Vec<u8>,
}

struct Accumulator {
    descriptor: TransferDescriptor,
    chunks: Vec<Vec<u8>>,
    received: u64,
}

/// Demultiplexes interleaved transfers arriving on one channel
pub struct TransferReceiver {
    max_bytes: u64,
    in_flight: HashMap<String, Accumulator>,
}

impl TransferReceiver {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            in_flight: HashMap::new(),
        }
    }

    /// Feed one frame. Returns the payload when a transfer completes.
    ///
    /// A failed transfer is discarded; other transfers on the channel are
    /// unaffected.
    pub fn handle_frame(
        &mut self,
        frame: TransferFrame,
    ) -> Result<Option<ReceivedFile>, TransferError> {
        match frame {
            TransferFrame::Descriptor(descriptor) => {
                if descriptor.total_size > self.max_bytes {
                    return Err(TransferError::TooLarge {
                        size: descriptor.total_size,
                        max: self.max_bytes,
                    });
                }
                if self.in_flight.contains_key(&descriptor.id) {
                    return Err(TransferError::DuplicateTransfer(descriptor.id));
                }

                debug!(
                    "Receiving {} ({} bytes) as transfer {}",
                    descriptor.name, descriptor.total_size, descriptor.id
                );
                self.in_flight.insert(
                    descriptor.id.clone(),
                    Accumulator {
                        descriptor,
                        chunks: Vec::new(),
                        received: 0,
                    },
                );
                Ok(None)
            }

            TransferFrame::Chunk { id, data } => {
                let acc = self
                    .in_flight
                    .get_mut(&id)
                    .ok_or_else(|| TransferError::UnknownTransfer(id.clone()))?;

                let received = acc.received + data.len() as u64;
                if received > acc.descriptor.total_size {
                    let expected = acc.descriptor.total_size;
                    self.in_flight.remove(&id);
                    return Err(TransferError::LengthMismatch {
                        id,
                        expected,
                        actual: received,
                    });
                }

                acc.received = received;
                acc.chunks.push(data);
                Ok(None)
            }

            TransferFrame::Complete { id } => {
                let acc = self
                    .in_flight
                    .remove(&id)
                    .ok_or_else(|| TransferError::UnknownTransfer(id.clone()))?;

                if acc.received != acc.descriptor.total_size {
                    return Err(TransferError::LengthMismatch {
                        id,
                        expected: acc.descriptor.total_size,
                        actual: acc.received,
                    });
                }

                Ok(Some(ReceivedFile {
                    descriptor: acc.descriptor,
                    data: acc.chunks.concat(),
                }))
            }
        }
    }

    /// Decode and feed a raw frame
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> Result<Option<ReceivedFile>, TransferError> {
        let frame = TransferFrame::decode(bytes)?;
        self.handle_frame(frame)
    }

    /// Drop a partially received transfer
    pub fn abort(&mut self, id: &str) -> bool {
        self.in_flight.remove(id).is_some()
    }

    /// Number of transfers currently being received
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Bytes received so far for a transfer, with its declared size
    pub fn progress(&self, id: &str) -> Option<(u64, u64)> {
        self.in_flight
            .get(id)
            .map(|acc| (acc.received, acc.descriptor.total_size))
    }
}
