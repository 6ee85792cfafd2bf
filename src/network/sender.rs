//! Outbound side of the framed protocol
//!
//! [`FrameWriter`] serializes whole frames onto the byte source.
//! [`ReliableSender`] runs stop-and-wait on top of it: one outstanding
//! packet, a fresh sequence byte per transmission, retransmission when the
//! acknowledgment does not arrive in time.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ByteSource, OutboundHook};
use crate::core::packet_type::{ACK, PACKET_ACK, PACKET_NO_ACK};
use crate::core::{Error, PacketizerConfig, Result, MTU};
use crate::protocol::{FrameCodec, TypeDemux};

/// Encodes frames and writes each one to the transport in a single call
pub(crate) struct FrameWriter {
    source: Arc<dyn ByteSource>,
    scratch: Mutex<BytesMut>,
}

impl FrameWriter {
    pub(crate) fn new(source: Arc<dyn ByteSource>) -> Self {
        FrameWriter {
            source,
            scratch: Mutex::new(BytesMut::with_capacity(2 * MTU + 2)),
        }
    }

    /// Frames and transmits `payload`; frames never interleave on the wire
    pub(crate) async fn write_frame(
        &self,
        packet_type: u8,
        header: Option<u8>,
        payload: &[u8],
    ) -> Result<()> {
        let mut buf = self.scratch.lock().await;
        buf.clear();
        FrameCodec::encode_frame(packet_type, header, payload, &mut buf)?;
        self.source.write_bytes(&buf).await
    }
}

/// Stop-and-wait sender for acknowledged packets
pub struct ReliableSender {
    name: String,
    writer: Arc<FrameWriter>,
    demux: Arc<TypeDemux>,
    hook: Option<Arc<dyn OutboundHook>>,
    /// Last sequence byte sent; the lock also keeps sends one at a time
    sequence: Mutex<u8>,
    ack_timeout: Duration,
    max_attempts: u32,
}

impl ReliableSender {
    pub(crate) fn new(
        config: &PacketizerConfig,
        writer: Arc<FrameWriter>,
        demux: Arc<TypeDemux>,
    ) -> Self {
        ReliableSender {
            name: config.name.clone(),
            writer,
            demux,
            hook: None,
            sequence: Mutex::new(config.initial_sequence),
            ack_timeout: config.ack_timeout,
            max_attempts: config.max_attempts,
        }
    }

    pub(crate) fn set_hook(&mut self, hook: Arc<dyn OutboundHook>) {
        self.hook = Some(hook);
    }

    /// Sends `packet` and waits for the peer to acknowledge it.
    ///
    /// The outbound hook runs before every transmission and may rewrite the
    /// packet in place. Returns `Ok(false)` when no matching acknowledgment
    /// arrived within the attempt limit; transport failures are errors.
    pub async fn send(&self, packet: &mut [u8]) -> Result<bool> {
        let mut sequence = self.sequence.lock().await;

        for attempt in 1..=self.max_attempts {
            if let Some(hook) = &self.hook {
                hook.before_send(packet);
            }

            *sequence = sequence.wrapping_add(1);
            let seq = *sequence;
            self.writer.write_frame(PACKET_ACK, Some(seq), packet).await?;

            let deadline = Instant::now() + self.ack_timeout;
            match self.demux.pop(ACK, Some(deadline)).await? {
                None => debug!("{}: ACK timed out (seq {}, attempt {})", self.name, seq, attempt),
                Some(ack) if ack.payload.first() == Some(&seq) => {
                    debug!("{}: received ACK for seq {}", self.name, seq);
                    return Ok(true);
                }
                Some(ack) => debug!(
                    "{}: ACK {:?} does not match seq {} (attempt {})",
                    self.name,
                    ack.payload.first(),
                    seq,
                    attempt
                ),
            }
        }

        warn!(
            "{}: no acknowledgment after {} attempts",
            self.name, self.max_attempts
        );
        Ok(false)
    }

    /// Sends `packet` once as a no-ack packet, without the outbound hook
    pub async fn send_unreliable(&self, packet: &[u8]) -> Result<()> {
        if packet.is_empty() {
            return Err(Error::protocol("packet too short"));
        }
        self.writer.write_frame(PACKET_NO_ACK, None, packet).await
    }

    /// Last sequence byte handed out
    pub async fn sequence(&self) -> u8 {
        *self.sequence.lock().await
    }
}
