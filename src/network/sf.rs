use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::info;

use super::{PacketSource, TimestampedPacketSource};
use crate::core::{Error, Result};
use crate::protocol::sf::{
    negotiate, sf_handshake, SfCodec, SfPacket, SF_LOCAL_VERSION, SF_VERSION_TIMESTAMPED,
};

/// Packet source speaking the length-prefixed serial forwarder protocol.
///
/// Meant for transports that already guarantee order and integrity, so there
/// is no framing, checksum or acknowledgment; the version handshake decides
/// whether packets carry a sender timestamp.
pub struct SfSource<S> {
    name: String,
    /// Stream waiting for the handshake; taken by `open`
    stream: std::sync::Mutex<Option<S>>,
    reader: Mutex<Option<FramedRead<ReadHalf<S>, SfCodec>>>,
    writer: Mutex<Option<FramedWrite<WriteHalf<S>, SfCodec>>>,
    /// Negotiated version, 0 until open
    version: AtomicU8,
    last_timestamp: AtomicI64,
}

impl<S> SfSource<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wraps a connected stream; the handshake runs on `open`
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        SfSource {
            name: name.into(),
            stream: std::sync::Mutex::new(Some(stream)),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            version: AtomicU8::new(0),
            last_timestamp: AtomicI64::new(0),
        }
    }

    /// Negotiated protocol version, if the handshake has completed
    pub fn version(&self) -> Option<u8> {
        match self.version.load(Ordering::Acquire) {
            0 => None,
            version => Some(version),
        }
    }
}

impl SfSource<TcpStream> {
    /// Connects to a serial forwarder at `addr`
    pub async fn connect_tcp(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let name = format!("sf@{}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::transport(format!("Failed to connect: {}", e)))?;
        Ok(Self::new(name, stream))
    }
}

#[async_trait]
impl<S> PacketSource for SfSource<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<()> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| Error::invalid_state("stream state poisoned"))?
            .take();
        let Some(mut stream) = stream else {
            return Err(Error::invalid_state(format!("{} is already open", self.name)));
        };

        stream.write_all(&sf_handshake()).await?;
        stream.flush().await?;
        let mut partner = [0u8; 2];
        stream.read_exact(&mut partner).await?;
        let version = negotiate(SF_LOCAL_VERSION, partner)?;

        let (read, write) = tokio::io::split(stream);
        *self.reader.lock().await = Some(FramedRead::new(read, SfCodec::new(version)));
        *self.writer.lock().await = Some(FramedWrite::new(write, SfCodec::new(version)));
        self.version.store(version, Ordering::Release);

        info!("{}: negotiated protocol version '{}'", self.name, version as char);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            SinkExt::<SfPacket>::close(&mut writer).await?;
        }
        info!("{}: closed", self.name);
        Ok(())
    }

    async fn read_packet(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let reader = reader
            .as_mut()
            .ok_or_else(|| Error::invalid_state(format!("{} is not open", self.name)))?;

        match reader.next().await {
            Some(packet) => {
                let packet = packet?;
                self.last_timestamp
                    .store(packet.timestamp.unwrap_or(0), Ordering::Relaxed);
                Ok(packet.payload)
            }
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "end-of-stream",
            ))),
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| Error::invalid_state(format!("{} is not open", self.name)))?;

        writer
            .send(SfPacket::new(Bytes::copy_from_slice(packet)))
            .await?;
        Ok(true)
    }
}

impl<S> TimestampedPacketSource for SfSource<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn last_timestamp(&self) -> i64 {
        self.last_timestamp.load(Ordering::Relaxed)
    }

    fn supports_timestamping(&self) -> bool {
        self.version.load(Ordering::Acquire) >= SF_VERSION_TIMESTAMPED
    }
}
