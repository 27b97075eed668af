//! File transfer over an established peer channel

use std::sync::Arc;

use tracing::{debug, info, warn};

use roomlink_core::ids::generate_transfer_id;
use roomlink_core::transfer::{outgoing_frames, ReceivedFile, TransferError, TransferReceiver};
use roomlink_core::ClientConfig;

use crate::transport::DataChannel;

/// Sends and receives files on one peer's data channel
pub struct TransferSession {
    channel: Arc<dyn DataChannel>,
    chunk_size: usize,
    max_bytes: u64,
    receiver: TransferReceiver,
}

impl TransferSession {
    pub fn new(channel: Arc<dyn DataChannel>, config: &ClientConfig) -> Self {
        Self {
            channel,
            chunk_size: config.chunk_size,
            max_bytes: config.max_transfer_bytes,
            receiver: TransferReceiver::new(config.max_transfer_bytes),
        }
    }

    /// Send one file. Returns the transfer id.
    ///
    /// Oversized payloads are rejected before anything reaches the channel.
    pub async fn send_file(
        &self,
        name: &str,
        media_type: Option<&str>,
        data: &[u8],
    ) -> Result<String, TransferError> {
        let id = generate_transfer_id().map_err(|e| TransferError::Channel(e.to_string()))?;
        let frames = outgoing_frames(&id, name, media_type, data, self.chunk_size, self.max_bytes)?;

        for frame in frames {
            let bytes = frame.encode()?;
            self.channel
                .send(bytes)
                .await
                .map_err(|e| TransferError::Channel(e.to_string()))?;
        }

        info!("Sent '{}' ({} bytes) as transfer {}", name, data.len(), id);
        Ok(id)
    }

    /// Wait for the next completed file
    ///
    /// Failed transfers are logged and discarded; the session keeps
    /// receiving. Returns `None` when the channel closes.
    pub async fn recv_file(&mut self) -> Option<ReceivedFile> {
        while let Some(bytes) = self.channel.recv().await {
            match self.receiver.handle_bytes(&bytes) {
                Ok(Some(file)) => {
                    info!(
                        "Received '{}' ({} bytes)",
                        file.descriptor.name,
                        file.data.len()
                    );
                    return Some(file);
                }
                Ok(None) => {}
                Err(e) => warn!("Discarding transfer: {}", e),
            }
        }

        let pending = self.receiver.in_flight();
        if pending > 0 {
            debug!("Channel closed with {} transfers in flight", pending);
        }
        None
    }

    /// Bytes received so far for an in-flight transfer
    pub fn progress(&self, id: &str) -> Option<(u64, u64)> {
        self.receiver.progress(id)
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}
