//! Moteproto: host-side serial packet protocol for sensor motes
//!
//! This library turns an unreliable byte stream into a packet connection.
//! Frames are delimited and escaped, checked with CRC-16, and sorted into
//! per-type queues by a background receive task. Packets can be sent with a
//! stop-and-wait acknowledgment protocol, and outbound time synchronization
//! messages get the host clock written into them just before transmission.
//!
//! The main entry point is [`network::Packetizer`]; [`network::SfSource`]
//! speaks the simpler serial forwarder protocol over reliable streams.

pub mod core;
pub mod network;
pub mod protocol;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use crate::core::{
    Error, FramingError, PacketizerConfig, Result, SerialConfig, TimestampedPacket,
};
pub use crate::network::{PacketSource, Packetizer, TimestampedPacketSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
