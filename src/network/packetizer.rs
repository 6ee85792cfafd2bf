use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::receiver::ReceiveLoop;
use super::sender::{FrameWriter, ReliableSender};
use super::{ByteSource, OutboundHook, PacketSource, TimestampedPacketSource};
use crate::core::packet_type::{ACK, PACKET_NO_ACK};
use crate::core::{Error, PacketizerConfig, Result, TimestampedPacket};
use crate::protocol::TypeDemux;

/// A packet connection over an unreliable byte stream.
///
/// Packets travel in sync-delimited, escaped, CRC-checked frames. A
/// background task decodes incoming frames, acknowledges the ones that ask
/// for it and sorts them into per-type queues; writes are acknowledged with
/// stop-and-wait retransmission.
pub struct Packetizer {
    config: PacketizerConfig,
    source: Arc<dyn ByteSource>,
    writer: Arc<FrameWriter>,
    demux: Arc<TypeDemux>,
    sender: ReliableSender,
    stop: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<Result<()>>>>,
    opened: AtomicBool,
}

impl Packetizer {
    /// Creates a packetizer over `source`; call [`open`](PacketSource::open) to start it
    pub fn new(config: PacketizerConfig, source: Arc<dyn ByteSource>) -> Result<Self> {
        config.validate()?;

        let writer = Arc::new(FrameWriter::new(source.clone()));
        let demux = Arc::new(TypeDemux::new(&[ACK, PACKET_NO_ACK]));
        let sender = ReliableSender::new(&config, writer.clone(), demux.clone());
        let (stop, _) = watch::channel(false);

        Ok(Packetizer {
            config,
            source,
            writer,
            demux,
            sender,
            stop,
            reader: Mutex::new(None),
            opened: AtomicBool::new(false),
        })
    }

    /// Registers the hook that rewrites reliable packets right before framing
    pub fn with_outbound_hook(mut self, hook: Arc<dyn OutboundHook>) -> Self {
        self.sender.set_hook(hook);
        self
    }

    /// Connection configuration
    pub fn config(&self) -> &PacketizerConfig {
        &self.config
    }

    /// Whether the receive loop has been started and not yet stopped
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire) && !self.demux.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.demux.is_closed() {
            Err(Error::Closed)
        } else if !self.opened.load(Ordering::Acquire) {
            Err(Error::invalid_state(format!("{} is not open", self.config.name)))
        } else {
            Ok(())
        }
    }

    /// Sends a packet that the peer must acknowledge.
    ///
    /// The outbound hook may rewrite `packet` in place. `Ok(false)` means the
    /// attempts ran out; the connection stays usable.
    pub async fn send_reliable(&self, packet: &mut [u8]) -> Result<bool> {
        self.ensure_open()?;
        self.sender.send(packet).await
    }

    /// Sends a packet once without asking for an acknowledgment
    pub async fn send_unreliable(&self, packet: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.sender.send_unreliable(packet).await
    }

    /// Waits for the next non-empty data packet, with its arrival time
    pub async fn read_timestamped(&self) -> Result<TimestampedPacket> {
        loop {
            if let Some(packet) = self.read_until(None).await? {
                return Ok(packet);
            }
        }
    }

    /// Waits for the next non-empty data packet until `deadline`; `None` waits forever
    pub async fn read_until(&self, deadline: Option<Instant>) -> Result<Option<TimestampedPacket>> {
        self.ensure_open()?;
        loop {
            match self.demux.pop(PACKET_NO_ACK, deadline).await? {
                Some(packet) if packet.payload.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }
}

#[async_trait]
impl PacketSource for Packetizer {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn open(&self) -> Result<()> {
        if self.demux.is_closed() {
            return Err(Error::invalid_state(format!(
                "{} has been closed and cannot be reopened",
                self.config.name
            )));
        }
        if self.opened.load(Ordering::Acquire) {
            return Ok(());
        }

        self.source.open().await?;

        let receive_loop = ReceiveLoop {
            name: self.config.name.clone(),
            source: self.source.clone(),
            writer: self.writer.clone(),
            demux: self.demux.clone(),
            stop: self.stop.subscribe(),
        };
        let handle = tokio::spawn(receive_loop.run());

        let mut reader = self
            .reader
            .lock()
            .map_err(|_| Error::invalid_state("receive task handle poisoned"))?;
        if reader.is_some() || self.opened.swap(true, Ordering::AcqRel) {
            handle.abort();
            return Ok(());
        }
        *reader = Some(handle);

        info!("{}: opened", self.config.name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop.send_replace(true);

        if let Err(e) = self.source.close().await {
            warn!("{}: closing transport failed: {}", self.config.name, e);
        }

        let handle = self
            .reader
            .lock()
            .map_err(|_| Error::invalid_state("receive task handle poisoned"))?
            .take();

        if let Some(handle) = handle {
            while !handle.is_finished() {
                tokio::time::sleep(self.config.shutdown_poll_interval).await;
            }
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_fatal() => {
                    debug!("{}: receive loop ended with {}", self.config.name, e)
                }
                Ok(Err(e)) => warn!("{}: receive loop failed: {}", self.config.name, e),
                Err(e) => warn!("{}: receive task failed: {}", self.config.name, e),
            }
        }

        self.demux.close();
        info!("{}: closed", self.config.name);
        Ok(())
    }

    async fn read_packet(&self) -> Result<Bytes> {
        Ok(self.read_timestamped().await?.payload)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<bool> {
        let mut packet = packet.to_vec();
        self.send_reliable(&mut packet).await
    }
}

impl TimestampedPacketSource for Packetizer {
    fn last_timestamp(&self) -> i64 {
        self.demux.last_timestamp()
    }

    fn supports_timestamping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet_type::{PACKET_ACK, UNKNOWN};
    use crate::network::StreamByteSource;
    use crate::protocol::{Frame, FrameCodec};
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::timeout;
    use tokio_util::codec::{FramedRead, FramedWrite};

    type PeerReader = FramedRead<ReadHalf<DuplexStream>, FrameCodec>;
    type PeerWriter = FramedWrite<WriteHalf<DuplexStream>, FrameCodec>;

    fn test_config() -> PacketizerConfig {
        PacketizerConfig {
            ack_timeout: Duration::from_millis(40),
            ..PacketizerConfig::named("test")
        }
    }

    async fn connect(config: PacketizerConfig) -> (Packetizer, PeerReader, PeerWriter) {
        let (local, remote) = tokio::io::duplex(4096);
        let packetizer = Packetizer::new(config, Arc::new(StreamByteSource::new(local))).unwrap();
        packetizer.open().await.unwrap();

        let (read, write) = tokio::io::split(remote);
        (
            packetizer,
            FramedRead::new(read, FrameCodec::new()),
            FramedWrite::new(write, FrameCodec::new()),
        )
    }

    async fn next(peer: &mut PeerReader) -> Frame {
        timeout(Duration::from_secs(5), peer.next())
            .await
            .expect("peer timed out")
            .expect("stream ended")
            .unwrap()
    }

    #[tokio::test]
    async fn test_ack_required_packet_is_acknowledged() {
        let (packetizer, mut peer_rx, mut peer_tx) = connect(test_config()).await;

        peer_tx
            .send(Frame::new(PACKET_ACK, Some(0x21), b"data"))
            .await
            .unwrap();

        let ack = next(&mut peer_rx).await;
        assert_eq!(ack.packet_type, ACK);
        assert_eq!(&ack.data[..], &[0x21]);

        let packet = packetizer.read_packet().await.unwrap();
        assert_eq!(&packet[..], b"data");
        packetizer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_ack_packets_in_order() {
        let (packetizer, _peer_rx, mut peer_tx) = connect(test_config()).await;

        for i in 0..20u8 {
            peer_tx
                .send(Frame::new(PACKET_NO_ACK, None, &[i, i]))
                .await
                .unwrap();
        }

        let mut last = i64::MIN;
        for i in 0..20u8 {
            let packet = packetizer.read_timestamped().await.unwrap();
            assert_eq!(&packet.payload[..], &[i, i]);
            assert!(packet.arrival_millis >= last);
            assert_eq!(packetizer.last_timestamp(), packet.arrival_millis);
            last = packet.arrival_millis;
        }
        packetizer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_answered_once() {
        let (packetizer, mut peer_rx, mut peer_tx) = connect(test_config()).await;

        peer_tx.send(Frame::new(0x10, Some(0xaa), b"?")).await.unwrap();
        // a peer's own unknown-type reply is not answered
        peer_tx.send(Frame::new(UNKNOWN, Some(0x77), &[])).await.unwrap();
        peer_tx.send(Frame::new(PACKET_NO_ACK, None, b"marker")).await.unwrap();

        let reply = next(&mut peer_rx).await;
        assert_eq!(reply.packet_type, UNKNOWN);
        assert_eq!(reply.header(), Some(0x10));

        let marker = packetizer.read_packet().await.unwrap();
        assert_eq!(&marker[..], b"marker");

        packetizer.close().await.unwrap();
        assert!(timeout(Duration::from_secs(5), peer_rx.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reliable_send_acknowledged() {
        let (packetizer, mut peer_rx, mut peer_tx) = connect(test_config()).await;

        let peer = tokio::spawn(async move {
            let frame = next(&mut peer_rx).await;
            assert_eq!(frame.packet_type, PACKET_ACK);
            peer_tx.send(Frame::new(ACK, frame.header(), &[])).await.unwrap();
            frame
        });

        assert!(packetizer.write_packet(b"hello").await.unwrap());
        let frame = peer.await.unwrap();
        assert_eq!(frame.header(), Some(14));
        assert_eq!(&frame.payload()[..], b"hello");
        packetizer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_ack_counts_as_missed() {
        let (packetizer, mut peer_rx, mut peer_tx) = connect(test_config()).await;

        let peer = tokio::spawn(async move {
            let first = next(&mut peer_rx).await;
            let seq = first.header().unwrap();
            peer_tx.send(Frame::new(ACK, Some(seq.wrapping_sub(1)), &[])).await.unwrap();

            let second = next(&mut peer_rx).await;
            peer_tx.send(Frame::new(ACK, second.header(), &[])).await.unwrap();
            (seq, second.header().unwrap())
        });

        assert!(packetizer.write_packet(b"x").await.unwrap());
        let (first, second) = peer.await.unwrap();
        assert_eq!(second, first.wrapping_add(1));
        packetizer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequence_wraps() {
        let config = PacketizerConfig {
            initial_sequence: 254,
            ..test_config()
        };
        let (packetizer, mut peer_rx, mut peer_tx) = connect(config).await;

        let peer = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let frame = next(&mut peer_rx).await;
                seen.push(frame.header().unwrap());
                peer_tx.send(Frame::new(ACK, frame.header(), &[])).await.unwrap();
            }
            seen
        });

        assert!(packetizer.write_packet(b"a").await.unwrap());
        assert!(packetizer.write_packet(b"b").await.unwrap());
        assert_eq!(peer.await.unwrap(), vec![255, 0]);
        packetizer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreliable_send() {
        let (packetizer, mut peer_rx, _peer_tx) = connect(test_config()).await;

        packetizer.send_unreliable(b"fire and forget").await.unwrap();
        let frame = next(&mut peer_rx).await;
        assert_eq!(frame.packet_type, PACKET_NO_ACK);
        assert_eq!(&frame.data[..], b"fire and forget");

        assert!(matches!(packetizer.send_unreliable(&[]).await, Err(Error::Protocol(_))));
        packetizer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_reader() {
        let (packetizer, _peer_rx, _peer_tx) = connect(test_config()).await;
        let packetizer = Arc::new(packetizer);

        let reader = {
            let packetizer = packetizer.clone();
            tokio::spawn(async move { packetizer.read_packet().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        packetizer.close().await.unwrap();
        assert!(!packetizer.is_open());
        assert!(matches!(reader.await.unwrap(), Err(Error::Closed)));
        assert!(packetizer.open().await.is_err());
        assert!(matches!(packetizer.write_packet(b"late").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_transport_failure_ends_loop() {
        let (packetizer, peer_rx, peer_tx) = connect(test_config()).await;
        drop(peer_rx);
        drop(peer_tx);

        assert!(matches!(packetizer.read_packet().await, Err(Error::Closed)));
        assert!(!packetizer.is_open());
        packetizer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_use_before_open() {
        let (local, _remote) = tokio::io::duplex(64);
        let packetizer =
            Packetizer::new(test_config(), Arc::new(StreamByteSource::new(local))).unwrap();
        assert!(matches!(
            packetizer.write_packet(b"x").await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(packetizer.name(), "test");
        assert!(packetizer.supports_timestamping());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (local, _remote) = tokio::io::duplex(64);
        let config = PacketizerConfig {
            max_attempts: 0,
            ..test_config()
        };
        assert!(Packetizer::new(config, Arc::new(StreamByteSource::new(local))).is_err());
    }
}
