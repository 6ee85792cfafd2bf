use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Result};
use crate::time::now_millis;

/// First handshake byte of the serial forwarder protocol
pub const SF_MAGIC: u8 = b'U';

/// Initial version: length byte followed by data
pub const SF_VERSION_PLAIN: u8 = b' ';

/// Timestamped version: length byte, 8-byte timestamp, data
pub const SF_VERSION_TIMESTAMPED: u8 = b'T';

/// Version this implementation offers
pub const SF_LOCAL_VERSION: u8 = SF_VERSION_TIMESTAMPED;

/// Size of the big-endian timestamp in timestamped packets
pub const TIMESTAMP_SIZE: usize = 8;

/// Handshake bytes sent at connect time
pub const fn sf_handshake() -> [u8; 2] {
    [SF_MAGIC, SF_LOCAL_VERSION]
}

/// Picks the protocol version from the partner's handshake
pub fn negotiate(local: u8, partner: [u8; 2]) -> Result<u8> {
    if partner[0] != SF_MAGIC {
        return Err(Error::protocol("protocol error: bad handshake"));
    }
    match partner[1].min(local) {
        version @ (SF_VERSION_PLAIN | SF_VERSION_TIMESTAMPED) => Ok(version),
        version => Err(Error::protocol(format!(
            "bad protocol version 0x{:02x}",
            version
        ))),
    }
}

/// A serial forwarder packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfPacket {
    /// Packet data
    pub payload: Bytes,
    /// Sender timestamp in Unix milliseconds; timestamped version only
    pub timestamp: Option<i64>,
}

impl SfPacket {
    /// A packet to be stamped with the local time when it is encoded
    pub fn new(payload: impl Into<Bytes>) -> Self {
        SfPacket {
            payload: payload.into(),
            timestamp: None,
        }
    }
}

/// Length-prefixed codec for a negotiated serial forwarder version
#[derive(Debug, Clone, Copy)]
pub struct SfCodec {
    version: u8,
}

impl SfCodec {
    /// Creates a codec for an already negotiated version
    pub fn new(version: u8) -> Self {
        SfCodec { version }
    }

    /// Negotiated protocol version
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Whether packets carry timestamps under this version
    pub fn timestamped(&self) -> bool {
        self.version >= SF_VERSION_TIMESTAMPED
    }
}

impl Decoder for SfCodec {
    type Item = SfPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(&length) = src.first() else {
            return Ok(None);
        };
        let length = length as usize;

        if self.timestamped() {
            if length <= TIMESTAMP_SIZE {
                return Err(Error::protocol("0-byte packet"));
            }
        } else if length == 0 {
            return Err(Error::protocol("0-byte packet"));
        }

        if src.len() < 1 + length {
            src.reserve(1 + length - src.len());
            return Ok(None);
        }
        src.advance(1);

        let timestamp = if self.timestamped() {
            Some(src.get_i64())
        } else {
            None
        };
        let data_len = length - timestamp.map_or(0, |_| TIMESTAMP_SIZE);

        Ok(Some(SfPacket {
            payload: src.split_to(data_len).freeze(),
            timestamp,
        }))
    }
}

impl Encoder<SfPacket> for SfCodec {
    type Error = Error;

    fn encode(&mut self, item: SfPacket, dst: &mut BytesMut) -> Result<()> {
        if item.payload.is_empty() {
            return Err(Error::protocol("packet too short"));
        }

        let extra = if self.timestamped() { TIMESTAMP_SIZE } else { 0 };
        let length = item.payload.len() + extra;
        if length > u8::MAX as usize {
            return Err(Error::protocol("packet too long"));
        }

        dst.reserve(1 + length);
        dst.put_u8(length as u8);
        if self.timestamped() {
            dst.put_i64(item.timestamp.unwrap_or_else(now_millis));
        }
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
