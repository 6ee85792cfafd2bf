use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serialport::SerialPort;
use tracing::info;

use super::ByteSource;
use crate::core::{Error, Result, SerialConfig};

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Read and write handles onto one open serial port
struct PortHandles {
    reader: SharedPort,
    writer: SharedPort,
}

/// Byte source backed by a serial line.
///
/// Port I/O is blocking, so every read and write runs on the blocking thread
/// pool. Reads use the configured port timeout and re-check the closed flag
/// between attempts, which bounds how long a close waits on a pending read.
pub struct SerialByteSource {
    /// Serial line settings
    config: SerialConfig,
    /// Handles, present while open
    port: Mutex<Option<PortHandles>>,
    /// Bytes read from the port but not yet handed out
    pending: Mutex<VecDeque<u8>>,
    /// Set by close, observed by pending reads
    closed: Arc<AtomicBool>,
}

const READ_CHUNK: usize = 64;

impl SerialByteSource {
    /// Creates a source for the configured device; nothing is opened yet
    pub fn new(config: SerialConfig) -> Self {
        SerialByteSource {
            config,
            port: Mutex::new(None),
            pending: Mutex::new(VecDeque::with_capacity(READ_CHUNK)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Serial device path
    pub fn device(&self) -> &str {
        &self.config.device
    }

    fn handles(&self) -> Result<(SharedPort, SharedPort)> {
        let port = self
            .port
            .lock()
            .map_err(|_| Error::transport("serial port state poisoned"))?;
        match port.as_ref() {
            Some(handles) => Ok((handles.reader.clone(), handles.writer.clone())),
            None if self.closed.load(Ordering::Acquire) => Err(Error::Closed),
            None => Err(Error::invalid_state(format!(
                "serial port {} is not open",
                self.config.device
            ))),
        }
    }

    fn take_pending(&self) -> Option<u8> {
        self.pending.lock().ok().and_then(|mut pending| pending.pop_front())
    }

    /// Drops bytes buffered from an earlier session
    fn clear_pending(&self) {
        match self.pending.lock() {
            Ok(mut pending) => pending.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

fn lock_port(port: &SharedPort) -> io::Result<std::sync::MutexGuard<'_, Box<dyn SerialPort>>> {
    port.lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "serial port lock poisoned"))
}

#[async_trait]
impl ByteSource for SerialByteSource {
    async fn open(&self) -> Result<()> {
        let reader = serialport::new(&self.config.device, self.config.baud_rate)
            .timeout(self.config.read_timeout)
            .open()
            .map_err(|e| {
                Error::transport(format!(
                    "Failed to open serial port {}: {}",
                    self.config.device, e
                ))
            })?;
        let writer = reader
            .try_clone()
            .map_err(|e| Error::transport(format!("Failed to clone serial port: {}", e)))?;

        let mut port = self
            .port
            .lock()
            .map_err(|_| Error::transport("serial port state poisoned"))?;
        self.clear_pending();
        *port = Some(PortHandles {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        });
        self.closed.store(false, Ordering::Release);

        info!(
            "opened serial port {} at {} baud",
            self.config.device, self.config.baud_rate
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut port) = self.port.lock() {
            port.take();
        }
        self.clear_pending();
        Ok(())
    }

    async fn read_byte(&self) -> Result<u8> {
        if let Some(byte) = self.take_pending() {
            return Ok(byte);
        }
        let (reader, _) = self.handles()?;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let port = reader.clone();
            let read = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
                let mut port = lock_port(&port)?;
                let mut buf = [0u8; READ_CHUNK];
                let n = port.read(&mut buf)?;
                Ok(buf[..n].to_vec())
            })
            .await
            .map_err(|e| Error::transport(format!("serial read task failed: {}", e)))?;

            match read {
                Ok(bytes) if bytes.is_empty() => {
                    return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()))
                }
                Ok(bytes) => {
                    let mut bytes = bytes.into_iter();
                    let first = bytes.next();
                    if let Ok(mut pending) = self.pending.lock() {
                        pending.extend(bytes);
                    }
                    if let Some(byte) = first {
                        return Ok(byte);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let (_, writer) = self.handles()?;
        let bytes = bytes.to_vec();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut port = lock_port(&writer)?;
            port.write_all(&bytes)?;
            port.flush()
        })
        .await
        .map_err(|e| Error::transport(format!("serial write task failed: {}", e)))??;
        Ok(())
    }
}
