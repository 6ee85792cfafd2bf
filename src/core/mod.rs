//! Core types and constants for the serial packet protocol
//!
//! This module contains the wire constants, the error types and the
//! configuration shared by every layer of the library.

pub mod error;
pub mod types;
pub mod serde;

use std::time::Duration;

pub use self::error::{Error, FramingError, Result};
pub use self::types::{PacketizerConfig, SerialConfig, TimestampedPacket};

/// Frame delimiter
pub const SYNC_BYTE: u8 = 0x7e;

/// Escape prefix; the escaped byte follows xored with [`ESCAPE_XOR`]
pub const ESCAPE_BYTE: u8 = 0x7d;

/// Value xored into an escaped byte
pub const ESCAPE_XOR: u8 = 0x20;

/// Maximum unescaped frame length, CRC included
pub const MTU: usize = 256;

/// Smallest frame worth checking: type, one byte, two CRC bytes
pub const MIN_FRAME_LEN: usize = 4;

/// Per-attempt acknowledgment timeout
pub const ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Transmissions per reliable send
pub const MAX_SEND_ATTEMPTS: u32 = 25;

/// Sequence counter value before the first reliable send
pub const INITIAL_SEQUENCE: u8 = 13;

/// Protocol packet type bytes
pub mod packet_type {
    /// Acknowledgment of an ack-required packet; carries its sequence byte
    pub const ACK: u8 = 0x43;
    /// User packet preceded by a sequence byte; the peer must acknowledge it
    pub const PACKET_ACK: u8 = 0x44;
    /// User packet, no acknowledgment
    pub const PACKET_NO_ACK: u8 = 0x45;
    /// Reply to a packet of unrecognized type; carries that type byte
    pub const UNKNOWN: u8 = 0xff;
}
