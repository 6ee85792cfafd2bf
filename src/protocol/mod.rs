//! Wire protocols
//!
//! This module holds the byte-level codecs and the inbound packet queues:
//! the escaped, CRC-checked frame codec used on serial lines, the per-type
//! demultiplexer the receive task feeds, and the length-prefixed serial
//! forwarder codec.

pub mod codec;
pub mod demux;
pub mod sf;

pub use self::codec::{frame_crc, Frame, FrameCodec};
pub use self::demux::{Routed, TypeDemux};
pub use self::sf::{negotiate, SfCodec, SfPacket};
