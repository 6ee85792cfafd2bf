use tracing::{debug, warn};

use super::fields::{serial_header, timesync32, timesync64};
use super::now_millis;
use crate::core::Result;
use crate::network::OutboundHook;

/// Dispatch byte of a serial active-message packet
pub const SERIAL_ACTIVE_MESSAGE_ID: u8 = 0x00;

/// Active-message type of the low-level time sync message
pub const AM_LOWLEVEL_TIMESYNC: u8 = 234;

/// Byte offset of the serial header inside an outbound packet
const SERIAL_HEADER_BASE: usize = 1;

/// Byte offset of the active-message data inside an outbound packet
const SERIAL_DATA_BASE: usize = SERIAL_HEADER_BASE + serial_header::SIZE;

/// Time written into a low-level time sync message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncPatch {
    /// Local time plus the message's embedded offset, in milliseconds
    pub global_time: i64,
    /// Whether the single 64-bit field was written instead of the two halves
    pub wide: bool,
}

/// Stamps outbound low-level time sync messages with the local send time.
///
/// The patch rewrites the packet bytes in place, right before the reliable
/// sender frames them, so the embedded time is as close to the moment of
/// transmission as the host can make it.
#[derive(Debug, Clone, Copy)]
pub struct TimeSyncPatcher {
    am_type: u8,
}

impl Default for TimeSyncPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSyncPatcher {
    /// Creates a patcher for the standard low-level time sync AM type
    pub fn new() -> Self {
        TimeSyncPatcher {
            am_type: AM_LOWLEVEL_TIMESYNC,
        }
    }

    /// Creates a patcher matching a different AM type
    pub fn with_am_type(am_type: u8) -> Self {
        TimeSyncPatcher { am_type }
    }

    /// Returns the data offset and declared data length of an embedded time
    /// sync message, or `None` if the packet does not carry one
    pub fn detect(&self, packet: &[u8]) -> Result<Option<(usize, usize)>> {
        if packet.first() != Some(&SERIAL_ACTIVE_MESSAGE_ID) {
            return Ok(None);
        }

        let am_type = serial_header::TYPE.get(packet, SERIAL_HEADER_BASE, serial_header::SIZE)?;
        if am_type != u64::from(self.am_type) {
            return Ok(None);
        }

        let length = serial_header::LENGTH.get(packet, SERIAL_HEADER_BASE, serial_header::SIZE)?;
        Ok(Some((SERIAL_DATA_BASE, length as usize)))
    }

    /// Patches the packet with the current local time
    pub fn patch(&self, packet: &mut [u8]) -> Result<Option<TimeSyncPatch>> {
        self.patch_at(packet, now_millis())
    }

    /// Patches the packet as if the local clock read `local_millis`
    pub fn patch_at(&self, packet: &mut [u8], local_millis: i64) -> Result<Option<TimeSyncPatch>> {
        let Some((base, limit)) = self.detect(packet)? else {
            return Ok(None);
        };

        let flags = timesync32::FLAGS.get(packet, base, limit)?;
        let offset = timesync32::OFFSET.get(packet, base, limit)?;
        let global_time = local_millis.wrapping_add(offset as i64);
        let wide = flags & 1 != 0;

        if wide {
            timesync64::GLOBAL_TIME.set(packet, base, limit, global_time as u64)?;
        } else {
            let time = global_time as u64;
            timesync32::LOW.set(packet, base, limit, time & 0xffff_ffff)?;
            timesync32::HIGH.set(packet, base, limit, (time >> 32) & 0xffff_ffff)?;
        }

        Ok(Some(TimeSyncPatch { global_time, wide }))
    }
}

impl OutboundHook for TimeSyncPatcher {
    fn before_send(&self, packet: &mut [u8]) {
        match self.patch(packet) {
            Ok(Some(patch)) => debug!(
                "stamped time sync message with {} ({} bit)",
                patch.global_time,
                if patch.wide { 64 } else { 32 }
            ),
            Ok(None) => {}
            Err(e) => warn!("problem with pre-send packet modification: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fields::Field;

    /// Serial AM packet carrying a 12-byte time sync message
    fn timesync_packet(offset: u16, flags: u8) -> Vec<u8> {
        let mut packet = vec![0u8; SERIAL_DATA_BASE + timesync32::SIZE];
        packet[0] = SERIAL_ACTIVE_MESSAGE_ID;
        let hdr = |f: Field, p: &mut Vec<u8>, v: u64| {
            f.set(p, SERIAL_HEADER_BASE, serial_header::SIZE, v).unwrap()
        };
        hdr(serial_header::DEST, &mut packet, 0xffff);
        hdr(serial_header::LENGTH, &mut packet, timesync32::SIZE as u64);
        hdr(serial_header::TYPE, &mut packet, u64::from(AM_LOWLEVEL_TIMESYNC));

        let base = SERIAL_DATA_BASE;
        timesync32::COUNTER.set(&mut packet, base, 12, 5).unwrap();
        timesync32::OFFSET.set(&mut packet, base, 12, u64::from(offset)).unwrap();
        timesync32::FLAGS.set(&mut packet, base, 12, u64::from(flags)).unwrap();
        packet
    }

    #[test]
    fn test_split_halves() {
        let patcher = TimeSyncPatcher::new();
        let mut packet = timesync_packet(500, 0);

        let before = now_millis();
        let patch = patcher.patch(&mut packet).unwrap().unwrap();
        let after = now_millis();

        assert!(!patch.wide);
        assert!(patch.global_time >= before + 500 && patch.global_time <= after + 500);

        let base = SERIAL_DATA_BASE;
        let high = timesync32::HIGH.get(&packet, base, 12).unwrap();
        let low = timesync32::LOW.get(&packet, base, 12).unwrap();
        assert_eq!(((high << 32) | low) as i64, patch.global_time);
        // untouched fields
        assert_eq!(timesync32::COUNTER.get(&packet, base, 12).unwrap(), 5);
        assert_eq!(timesync32::OFFSET.get(&packet, base, 12).unwrap(), 500);
    }

    #[test]
    fn test_global_time_field() {
        let patcher = TimeSyncPatcher::new();
        let mut packet = timesync_packet(0xffff, 0x01);

        let before = now_millis();
        let patch = patcher.patch(&mut packet).unwrap().unwrap();
        let after = now_millis();

        assert!(patch.wide);
        let global = timesync64::GLOBAL_TIME.get(&packet, SERIAL_DATA_BASE, 12).unwrap() as i64;
        assert_eq!(global, patch.global_time);
        assert!(global >= before + 0xffff && global <= after + 0xffff);
        assert_eq!(timesync64::FLAGS.get(&packet, SERIAL_DATA_BASE, 12).unwrap(), 1);
    }

    #[test]
    fn test_fixed_clock() {
        let mut packet = timesync_packet(10, 0);
        let patch = TimeSyncPatcher::new()
            .patch_at(&mut packet, 0x0000_0001_0000_0000)
            .unwrap()
            .unwrap();
        assert_eq!(patch.global_time, 0x0000_0001_0000_000a);
        assert_eq!(&packet[SERIAL_DATA_BASE + 3..SERIAL_DATA_BASE + 11], &[0, 0, 0, 1, 0, 0, 0, 0x0a]);
    }

    #[test]
    fn test_other_packets_untouched() {
        let patcher = TimeSyncPatcher::new();

        let mut packet = timesync_packet(10, 0);
        packet[SERIAL_HEADER_BASE + 6] = 0x07; // different AM type
        let original = packet.clone();
        assert!(patcher.patch(&mut packet).unwrap().is_none());
        assert_eq!(packet, original);

        let mut packet = timesync_packet(10, 0);
        packet[0] = 0x01; // not an AM dispatch
        assert!(patcher.patch(&mut packet).unwrap().is_none());

        assert!(patcher.patch(&mut []).unwrap().is_none());
    }

    #[test]
    fn test_malformed_message_reported() {
        let patcher = TimeSyncPatcher::new();

        // header claims fewer data bytes than the message needs
        let mut packet = timesync_packet(10, 0);
        packet[SERIAL_HEADER_BASE + 4] = 6;
        assert!(patcher.patch(&mut packet).is_err());

        // truncated before the header ends
        let mut packet = timesync_packet(10, 0);
        packet.truncate(5);
        assert!(patcher.patch(&mut packet).is_err());
    }

    #[test]
    fn test_hook_leaves_malformed_packet_unchanged() {
        let mut packet = timesync_packet(10, 0);
        packet.truncate(SERIAL_DATA_BASE + 8);
        let original = packet.clone();

        TimeSyncPatcher::new().before_send(&mut packet);
        assert_eq!(packet, original);
    }

    #[test]
    fn test_custom_am_type() {
        let mut packet = timesync_packet(1, 0);
        packet[SERIAL_HEADER_BASE + 6] = 0x42;
        assert!(TimeSyncPatcher::with_am_type(0x42).detect(&packet).unwrap().is_some());
        assert!(TimeSyncPatcher::new().detect(&packet).unwrap().is_none());
    }
}
