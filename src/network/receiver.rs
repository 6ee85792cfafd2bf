use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::sender::FrameWriter;
use super::ByteSource;
use crate::core::packet_type::{ACK, PACKET_ACK, PACKET_NO_ACK, UNKNOWN};
use crate::core::Result;
use crate::protocol::{Frame, FrameCodec, Routed, TypeDemux};

/// Everything the background receive task needs
pub(crate) struct ReceiveLoop {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn ByteSource>,
    pub(crate) writer: Arc<FrameWriter>,
    pub(crate) demux: Arc<TypeDemux>,
    pub(crate) stop: watch::Receiver<bool>,
}

impl ReceiveLoop {
    /// Decodes and dispatches frames until stopped or the transport fails.
    ///
    /// The stop signal is observed while reading and while replying, so a
    /// write stuck behind a peer that no longer reads does not keep the loop
    /// alive. The demux is closed on the way out so blocked readers see the
    /// end.
    pub(crate) async fn run(self) -> Result<()> {
        let mut codec = FrameCodec::new();
        let mut stop = self.stop.clone();

        let result = loop {
            if *stop.borrow() {
                break Ok(());
            }

            let step = tokio::select! {
                _ = stop.changed() => break Ok(()),
                step = self.receive_one(&mut codec) => step,
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => debug!("{}: receive loop stopped", self.name),
            Err(e) => warn!("{}: receive loop terminated: {}", self.name, e),
        }
        self.demux.close();
        result
    }

    async fn receive_one(&self, codec: &mut FrameCodec) -> Result<()> {
        let frame = next_frame(&self.name, self.source.as_ref(), codec).await?;
        self.dispatch(frame).await
    }

    /// Acknowledges, classifies and queues one frame
    async fn dispatch(&self, frame: Frame) -> Result<()> {
        let (packet_type, payload) = if frame.packet_type == PACKET_ACK {
            let Some(seq) = frame.header() else {
                return Ok(());
            };
            self.writer.write_frame(ACK, Some(seq), &[]).await?;
            // acknowledged data joins the no-ack stream without its sequence byte
            (PACKET_NO_ACK, frame.payload())
        } else {
            (frame.packet_type, frame.data)
        };

        match self.demux.push(packet_type, payload) {
            Routed::Queued => {}
            Routed::Unregistered(UNKNOWN) => {
                debug!("{}: peer reported an unknown packet type", self.name)
            }
            Routed::Unregistered(packet_type) => {
                self.writer
                    .write_frame(UNKNOWN, Some(packet_type), &[])
                    .await?;
                warn!(
                    "{}: ignoring unknown packet type 0x{:02x}",
                    self.name, packet_type
                );
            }
        }
        Ok(())
    }
}

/// Reads bytes until the codec completes a valid frame
async fn next_frame(name: &str, source: &dyn ByteSource, codec: &mut FrameCodec) -> Result<Frame> {
    loop {
        let byte = source.read_byte().await?;
        match codec.push_byte(byte) {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) => {}
            Err(e) if e.lost_sync() => warn!("{}: {}, resynchronising", name, e),
            Err(e) => warn!("{}: {}", name, e),
        }
    }
}
