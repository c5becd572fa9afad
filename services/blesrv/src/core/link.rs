//! Fragmented JSON link
//!
//! The send path splits a serialized document into notify frames and pushes
//! them through the multiplexer one at a time, waiting for each `OK`. The
//! receive path reads frames from a byte stream and reassembles them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info};
use uuid::Uuid;
use voltage_ble::{BleError, FrameFormat, PacketCodec, Reassembler};

use super::config::LinkSettings;
use super::multiplexer::SerialMultiplexer;
use crate::error::{BleSrvError, Result};

/// Outbound channel to the peripheral
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    /// Send one JSON document to the peripheral
    async fn send_value(&self, value: &serde_json::Value) -> Result<()>;
}

/// Sends JSON documents as notify packets over the multiplexer
#[derive(Debug, Clone)]
pub struct JsonLinkSender {
    mux: Arc<SerialMultiplexer>,
    format: FrameFormat,
    packet_timeout: Duration,
    read_delay: Duration,
    queue_wait: Duration,
}

impl JsonLinkSender {
    pub fn new(mux: Arc<SerialMultiplexer>, settings: &LinkSettings) -> Result<Self> {
        Ok(Self {
            mux,
            format: settings.frame_format()?,
            packet_timeout: settings.packet_timeout(),
            read_delay: settings.read_delay(),
            queue_wait: settings.queue_wait(),
        })
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Serialize `value` and send it
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.send_bytes(&data).await
    }

    /// Send pre-serialized bytes; stops at the first packet that fails
    pub async fn send_bytes(&self, data: &[u8]) -> Result<()> {
        let tag = Uuid::new_v4();
        let packets = self.format.split(data)?;
        if packets.is_empty() {
            debug!("[Link] message {} is empty, nothing sent", tag);
            return Ok(());
        }

        for packet in &packets {
            let frame = self.format.encode(packet);
            let frame_len = frame.len();
            match self
                .mux
                .enqueue(frame, self.packet_timeout, self.read_delay, self.queue_wait)
                .await
            {
                Ok(_) => debug!(
                    "[Link] message {} packet {}/{} sent ({} bytes)",
                    tag,
                    packet.index + 1,
                    packet.total,
                    frame_len
                ),
                Err(e) => {
                    error!(
                        "[Link] message {} packet {}/{} failed: {}",
                        tag,
                        packet.index + 1,
                        packet.total,
                        e
                    );
                    return Err(e);
                },
            }
        }

        info!(
            "[Link] message {} sent: {} bytes in {} packets",
            tag,
            data.len(),
            packets.len()
        );
        Ok(())
    }
}

#[async_trait]
impl PeripheralLink for JsonLinkSender {
    async fn send_value(&self, value: &serde_json::Value) -> Result<()> {
        self.send_json(value).await
    }
}

/// Reassembles JSON documents from a stream of frames
pub struct JsonLinkReceiver<R> {
    frames: FramedRead<R, PacketCodec>,
    reassembler: Reassembler,
}

impl<R: AsyncRead + Unpin> JsonLinkReceiver<R> {
    pub fn new(reader: R, format: FrameFormat, max_age: Option<Duration>) -> Self {
        Self {
            frames: FramedRead::new(reader, PacketCodec::new(format)),
            reassembler: Reassembler::new(max_age),
        }
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Next complete, well-formed JSON document; `None` at end of stream
    pub async fn next_message(&mut self) -> Result<Option<Vec<u8>>> {
        while let Some(frame) = self.frames.next().await {
            let packet = frame?;
            debug!(
                "[Link] received packet {}/{} ({} bytes)",
                packet.index + 1,
                packet.total,
                packet.payload.len()
            );
            if let Some(data) = self.reassembler.push(packet)? {
                serde_json::from_slice::<serde_json::Value>(&data).map_err(BleError::from)?;
                return Ok(Some(data));
            }
        }
        Ok(None)
    }
}

/// Read frames from `reader` until one complete JSON document is rebuilt
pub async fn receive_json<R: AsyncRead + Unpin>(
    reader: R,
    format: FrameFormat,
    max_age: Option<Duration>,
) -> Result<Vec<u8>> {
    JsonLinkReceiver::new(reader, format, max_age)
        .next_message()
        .await?
        .ok_or_else(|| BleSrvError::reassembly("stream ended before the message was complete"))
}
