//! Fixed-offset big-endian bit fields over byte buffers
//!
//! Message layouts are described as tables of [`Field`]s; a field is read or
//! written relative to a base byte offset and bounded by the length of the
//! message view it belongs to.

use crate::core::{Error, Result};

/// An unsigned big-endian field at a fixed bit offset within a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Field name, used in error messages
    pub name: &'static str,
    /// Offset in bits from the start of the message
    pub offset_bits: usize,
    /// Width in bits, at most 64
    pub width_bits: usize,
}

impl Field {
    /// Declares a field
    pub const fn new(name: &'static str, offset_bits: usize, width_bits: usize) -> Self {
        Field {
            name,
            offset_bits,
            width_bits,
        }
    }

    /// Byte offset of the first byte the field touches
    pub const fn offset_bytes(&self) -> usize {
        self.offset_bits / 8
    }

    fn check(&self, buf_len: usize, base: usize, limit: usize) -> Result<()> {
        if self.width_bits == 0 || self.width_bits > 64 {
            return Err(Error::field(format!(
                "field '{}' has unsupported width {}",
                self.name, self.width_bits
            )));
        }
        let end_bits = self.offset_bits + self.width_bits;
        if end_bits > limit * 8 {
            return Err(Error::field(format!(
                "field '{}' ends at bit {} past the {} byte message",
                self.name, end_bits, limit
            )));
        }
        if base + (end_bits + 7) / 8 > buf_len {
            return Err(Error::field(format!(
                "field '{}' at base {} runs past the {} byte buffer",
                self.name, base, buf_len
            )));
        }
        Ok(())
    }

    /// Reads the field from the message starting at `base`, `limit` bytes long
    pub fn get(&self, buf: &[u8], base: usize, limit: usize) -> Result<u64> {
        self.check(buf.len(), base, limit)?;

        let mut value = 0u64;
        for i in 0..self.width_bits {
            let bit = self.offset_bits + i;
            let byte = buf[base + bit / 8];
            let set = (byte >> (7 - bit % 8)) & 1;
            value = (value << 1) | u64::from(set);
        }
        Ok(value)
    }

    /// Writes the low `width_bits` of `value` into the message at `base`
    pub fn set(&self, buf: &mut [u8], base: usize, limit: usize, value: u64) -> Result<()> {
        self.check(buf.len(), base, limit)?;

        for i in 0..self.width_bits {
            let bit = self.offset_bits + i;
            let mask = 1u8 << (7 - bit % 8);
            let set = (value >> (self.width_bits - 1 - i)) & 1 == 1;
            let byte = &mut buf[base + bit / 8];
            if set {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
        Ok(())
    }
}

/// Serial active-message packet header, following the dispatch byte
pub mod serial_header {
    use super::Field;

    /// Header length in bytes
    pub const SIZE: usize = 7;

    pub const DEST: Field = Field::new("dest", 0, 16);
    pub const SRC: Field = Field::new("src", 16, 16);
    pub const LENGTH: Field = Field::new("length", 32, 8);
    pub const GROUP: Field = Field::new("group", 40, 8);
    pub const TYPE: Field = Field::new("type", 48, 8);
}

/// Low-level time sync message with the time split into two 32-bit halves
pub mod timesync32 {
    use super::Field;

    pub const SIZE: usize = 12;

    pub const COUNTER: Field = Field::new("counter", 0, 8);
    pub const OFFSET: Field = Field::new("offset", 8, 16);
    pub const HIGH: Field = Field::new("high", 24, 32);
    pub const LOW: Field = Field::new("low", 56, 32);
    pub const FLAGS: Field = Field::new("flags", 88, 8);
}

/// Low-level time sync message with a single 64-bit global time
pub mod timesync64 {
    use super::Field;

    pub const SIZE: usize = 12;

    pub const COUNTER: Field = Field::new("counter", 0, 8);
    pub const OFFSET: Field = Field::new("offset", 8, 16);
    pub const GLOBAL_TIME: Field = Field::new("globalTime", 24, 64);
    pub const FLAGS: Field = Field::new("flags", 88, 8);
}
