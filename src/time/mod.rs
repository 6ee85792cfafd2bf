//! Clock access and outbound time synchronization
//!
//! Motes synchronize their clocks against the host by receiving a low-level
//! time sync message whose time fields are filled in at the last possible
//! moment before the packet goes onto the wire:
//!
//! - [`fields`] describes message layouts as fixed-offset big-endian bit fields
//! - [`TimeSyncPatcher`] detects such a message inside an outbound serial
//!   packet and writes `local time + embedded offset` into it
//!
//! # Examples
//!
//! ```no_run
//! use moteproto::network::{PacketSource, Packetizer, StreamByteSource};
//! use moteproto::time::TimeSyncPatcher;
//! use moteproto::PacketizerConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> moteproto::Result<()> {
//!     let source = StreamByteSource::connect_tcp("127.0.0.1:9001").await?;
//!     let packetizer = Packetizer::new(PacketizerConfig::named("mote"), Arc::new(source))?
//!         .with_outbound_hook(Arc::new(TimeSyncPatcher::new()));
//!     packetizer.open().await?;
//!     Ok(())
//! }
//! ```

pub mod fields;
mod timesync;

pub use self::timesync::{
    TimeSyncPatch, TimeSyncPatcher, AM_LOWLEVEL_TIMESYNC, SERIAL_ACTIVE_MESSAGE_ID,
};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
