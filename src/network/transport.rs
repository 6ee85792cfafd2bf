use async_trait::async_trait;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::ByteSource;
use crate::core::{Error, Result};

/// Byte source over any async stream, split into independently locked halves.
///
/// Closing interrupts reads and writes already in progress, so a peer that
/// stops reading cannot hold a close up.
pub struct StreamByteSource<S> {
    /// Buffered read half
    reader: Mutex<BufReader<ReadHalf<S>>>,
    /// Write half
    writer: Mutex<WriteHalf<S>>,
    /// Flips to true once the source has been closed
    closed: watch::Sender<bool>,
}

impl<S> StreamByteSource<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps an already connected stream
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        StreamByteSource {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            closed: watch::channel(false).0,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Resolves once `close` has been called
    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        // the sender lives in self, so this only returns once closed
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl StreamByteSource<TcpStream> {
    /// Connects to a TCP endpoint such as a serial-to-network bridge
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::transport(format!("Failed to connect: {}", e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::transport(format!("Failed to set TCP_NODELAY: {}", e)))?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl<S> ByteSource for StreamByteSource<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn open(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        // pending writes have released the lock by now
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("stream shutdown failed: {}", e);
        }
        Ok(())
    }

    async fn read_byte(&self) -> Result<u8> {
        self.ensure_open()?;
        tokio::select! {
            _ = self.wait_closed() => Err(Error::Closed),
            byte = async {
                let mut reader = self.reader.lock().await;
                reader.read_u8().await
            } => Ok(byte?),
        }
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        tokio::select! {
            _ = self.wait_closed() => Err(Error::Closed),
            written = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(bytes).await?;
                writer.flush().await
            } => Ok(written?),
        }
    }
}
