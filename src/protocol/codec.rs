use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_XMODEM};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::core::{Error, FramingError, ESCAPE_BYTE, ESCAPE_XOR, MIN_FRAME_LEN, MTU, SYNC_BYTE};

/// CRC-16 over the unescaped type, header and payload bytes
const FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// A decoded frame: the packet type and everything between it and the CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol packet type byte
    pub packet_type: u8,
    /// Header byte (if any) followed by the payload
    pub data: Bytes,
}

impl Frame {
    /// Builds a frame from its type, optional header byte and payload
    pub fn new(packet_type: u8, header: Option<u8>, payload: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(payload.len() + 1);
        if let Some(header) = header {
            data.put_u8(header);
        }
        data.extend_from_slice(payload);
        Frame {
            packet_type,
            data: data.freeze(),
        }
    }

    /// First byte after the type; the sequence byte for acknowledged packets
    pub fn header(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Bytes after the header byte
    pub fn payload(&self) -> Bytes {
        if self.data.is_empty() {
            Bytes::new()
        } else {
            self.data.slice(1..)
        }
    }

    /// Frame length before escaping, without the sync markers
    pub fn unescaped_len(&self) -> usize {
        1 + self.data.len() + 2
    }

    /// CRC the frame carries on the wire
    pub fn crc(&self) -> u16 {
        frame_crc(self.packet_type, &self.data)
    }
}

/// Computes the frame checksum over the type byte followed by `data`
pub fn frame_crc(packet_type: u8, data: &[u8]) -> u16 {
    let mut digest = FRAME_CRC.digest();
    digest.update(&[packet_type]);
    digest.update(data);
    digest.finalize()
}

fn put_escaped(dst: &mut BytesMut, byte: u8) {
    if byte == SYNC_BYTE || byte == ESCAPE_BYTE {
        dst.put_u8(ESCAPE_BYTE);
        dst.put_u8(byte ^ ESCAPE_XOR);
    } else {
        dst.put_u8(byte);
    }
}

/// Encoder and stateful decoder for the sync-delimited, escaped frame format.
///
/// Decoding keeps its synchronization state between calls: it starts out of
/// sync and drops everything up to the first sync byte. A bad CRC drops the
/// frame but keeps sync, so noise on the line before the first real frame
/// does not cost that frame.
#[derive(Debug)]
pub struct FrameCodec {
    in_sync: bool,
    escaped: bool,
    buffer: BytesMut,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Creates a codec that has not yet seen a sync byte
    pub fn new() -> Self {
        FrameCodec {
            in_sync: false,
            escaped: false,
            buffer: BytesMut::with_capacity(MTU),
        }
    }

    /// Whether the decoder currently considers itself synchronized
    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    /// Feeds one byte from the line into the decoder.
    ///
    /// Returns a frame once a terminating sync byte closes a frame with a
    /// valid CRC. Frames shorter than [`MIN_FRAME_LEN`] are ignored.
    pub fn push_byte(&mut self, byte: u8) -> Result<Option<Frame>, FramingError> {
        if !self.in_sync {
            if byte == SYNC_BYTE {
                self.start_frame();
                self.in_sync = true;
            }
            return Ok(None);
        }

        if self.buffer.len() >= MTU {
            self.lose_sync();
            if byte == SYNC_BYTE {
                self.in_sync = true;
            }
            return Err(FramingError::TooLong);
        }

        if self.escaped {
            self.escaped = false;
            if byte == SYNC_BYTE {
                self.lose_sync();
                return Err(FramingError::UnexpectedSync);
            }
            self.buffer.put_u8(byte ^ ESCAPE_XOR);
            return Ok(None);
        }

        match byte {
            ESCAPE_BYTE => {
                self.escaped = true;
                Ok(None)
            }
            SYNC_BYTE => self.finish_frame(),
            _ => {
                self.buffer.put_u8(byte);
                Ok(None)
            }
        }
    }

    /// Writes one complete frame: sync, escaped body and CRC, sync
    pub fn encode_frame(
        packet_type: u8,
        header: Option<u8>,
        payload: &[u8],
        dst: &mut BytesMut,
    ) -> crate::core::Result<()> {
        let unescaped = 1 + header.map_or(0, |_| 1) + payload.len() + 2;
        if unescaped >= MTU {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds the {} byte MTU",
                unescaped, MTU
            )));
        }

        let mut digest = FRAME_CRC.digest();
        dst.reserve(2 * unescaped + 2);
        dst.put_u8(SYNC_BYTE);

        digest.update(&[packet_type]);
        put_escaped(dst, packet_type);
        if let Some(header) = header {
            digest.update(&[header]);
            put_escaped(dst, header);
        }
        digest.update(payload);
        for &byte in payload {
            put_escaped(dst, byte);
        }

        let crc = digest.finalize();
        put_escaped(dst, (crc & 0xff) as u8);
        put_escaped(dst, (crc >> 8) as u8);

        dst.put_u8(SYNC_BYTE);
        Ok(())
    }

    fn start_frame(&mut self) {
        self.escaped = false;
        self.buffer.clear();
    }

    fn lose_sync(&mut self) {
        trace!("frame decoder resynchronising");
        self.in_sync = false;
        self.start_frame();
    }

    fn finish_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        let count = self.buffer.len();
        if count < MIN_FRAME_LEN {
            self.buffer.clear();
            return Ok(None);
        }

        let mut raw = self.buffer.split().freeze();
        let crc_bytes = raw.split_off(count - 2);
        let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let computed = frame_crc(raw[0], &raw[1..]);

        if received != computed {
            return Err(FramingError::BadCrc { received, computed });
        }

        Ok(Some(Frame {
            packet_type: raw[0],
            data: raw.slice(1..),
        }))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            let byte = src.get_u8();
            match self.push_byte(byte) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => warn!("dropping frame: {}", e),
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        FrameCodec::encode_frame(item.packet_type, None, &item.data, dst)
    }
}
