use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// A received payload together with the wall-clock time it was dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedPacket {
    /// Packet payload, protocol header bytes already stripped
    pub payload: Bytes,
    /// Arrival time in milliseconds since the Unix epoch
    pub arrival_millis: i64,
}

/// Configuration for a framed serial packet connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketizerConfig {
    /// Connection name used in log output
    pub name: String,
    /// How long a reliable send waits for each acknowledgment
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub ack_timeout: Duration,
    /// Transmissions per reliable send before giving up
    pub max_attempts: u32,
    /// Sequence counter value before the first reliable send
    pub initial_sequence: u8,
    /// Sleep between liveness checks while waiting for the receive loop to stop
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub shutdown_poll_interval: Duration,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        PacketizerConfig {
            name: "packetizer".to_string(),
            ack_timeout: super::ACK_TIMEOUT,
            max_attempts: super::MAX_SEND_ATTEMPTS,
            initial_sequence: super::INITIAL_SEQUENCE,
            shutdown_poll_interval: Duration::from_millis(10),
        }
    }
}

impl PacketizerConfig {
    /// Creates the default configuration under another connection name
    pub fn named(name: impl Into<String>) -> Self {
        PacketizerConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Checks that the configuration can drive a connection
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("max_attempts must be at least 1"));
        }
        if self.ack_timeout.is_zero() {
            return Err(Error::config("ack_timeout must be non-zero"));
        }
        if self.shutdown_poll_interval.is_zero() {
            return Err(Error::config("shutdown_poll_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial device path
    pub device: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Port read timeout; bounds how long a close waits on a pending read
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 57600,
            read_timeout: Duration::from_millis(100),
        }
    }
}
