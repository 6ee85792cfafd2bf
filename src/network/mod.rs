//! Transports and packet sources
//!
//! A [`ByteSource`] is the raw, possibly unreliable byte pipe (a serial line,
//! a TCP socket). A [`PacketSource`] turns a connection into whole packets:
//! [`Packetizer`] does so with the framed, acknowledged serial protocol and
//! [`SfSource`] with the length-prefixed serial forwarder protocol used over
//! transports that are already reliable.

mod packetizer;
mod receiver;
mod sender;
mod serial;
mod sf;
mod transport;

pub use self::packetizer::Packetizer;
pub use self::sender::ReliableSender;
pub use self::serial::SerialByteSource;
pub use self::sf::SfSource;
pub use self::transport::StreamByteSource;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::Result;

/// Raw byte transport underneath a packet protocol.
///
/// Reads and writes may run concurrently from different tasks. Any error is
/// fatal to the operation that hit it.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Opens the underlying device or connection
    async fn open(&self) -> Result<()>;

    /// Closes the transport; pending and later reads fail
    async fn close(&self) -> Result<()>;

    /// Reads exactly one byte, waiting as long as it takes
    async fn read_byte(&self) -> Result<u8>;

    /// Writes all of `bytes`
    async fn write_bytes(&self, bytes: &[u8]) -> Result<()>;
}

/// A connection that exchanges whole packets
#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Human readable connection name
    fn name(&self) -> &str;

    /// Opens the connection and starts receiving
    async fn open(&self) -> Result<()>;

    /// Stops receiving and closes the connection
    async fn close(&self) -> Result<()>;

    /// Waits for the next packet
    async fn read_packet(&self) -> Result<Bytes>;

    /// Sends a packet; `Ok(false)` means it was not delivered
    async fn write_packet(&self, packet: &[u8]) -> Result<bool>;
}

/// A packet source that can report when packets arrived
pub trait TimestampedPacketSource: PacketSource {
    /// Arrival time, in Unix milliseconds, of the last packet read
    fn last_timestamp(&self) -> i64;

    /// Whether the connection delivers arrival timestamps at all
    fn supports_timestamping(&self) -> bool;
}

/// Rewrites an outbound packet in place right before it is framed
pub trait OutboundHook: Send + Sync {
    /// Inspects and possibly mutates `packet`; must not fail the send
    fn before_send(&self, packet: &mut [u8]);
}
