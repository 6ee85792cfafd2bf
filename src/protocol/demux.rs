//! Per-packet-type receive queues
//!
//! The receive loop pushes every decoded packet here; consumers pop from the
//! queue of the type they care about, optionally bounded by a deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::core::{Error, Result, TimestampedPacket};
use crate::time::now_millis;

/// Outcome of handing a packet to the demultiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Appended to the queue for its type
    Queued,
    /// No queue is registered for this type
    Unregistered(u8),
}

#[derive(Default)]
struct TypeQueue {
    packets: Mutex<VecDeque<TimestampedPacket>>,
    ready: Notify,
}

/// FIFO queues keyed by packet type, with deadline-bounded blocking reads
pub struct TypeDemux {
    queues: HashMap<u8, TypeQueue>,
    last_timestamp: AtomicI64,
    closed: AtomicBool,
}

impl TypeDemux {
    /// Creates queues for the given packet types; all other types are unregistered
    pub fn new(types: &[u8]) -> Self {
        TypeDemux {
            queues: types.iter().map(|&t| (t, TypeQueue::default())).collect(),
            last_timestamp: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a queue exists for `packet_type`
    pub fn is_registered(&self, packet_type: u8) -> bool {
        self.queues.contains_key(&packet_type)
    }

    /// Queues `payload` under its type, stamped with the current time.
    ///
    /// Wakes at most one waiter. Packets of unregistered types are not kept;
    /// the caller is told so it can answer the peer.
    pub fn push(&self, packet_type: u8, payload: Bytes) -> Routed {
        let Some(queue) = self.queues.get(&packet_type) else {
            return Routed::Unregistered(packet_type);
        };

        let packet = TimestampedPacket {
            payload,
            arrival_millis: now_millis(),
        };
        match queue.packets.lock() {
            Ok(mut packets) => packets.push_back(packet),
            Err(poisoned) => poisoned.into_inner().push_back(packet),
        }
        queue.ready.notify_one();
        Routed::Queued
    }

    /// Removes the oldest packet of `packet_type`.
    ///
    /// Waits until one arrives or `deadline` passes; `None` waits forever.
    /// Returns `Ok(None)` on timeout and [`Error::Closed`] once the demux is
    /// closed and the queue has drained.
    pub async fn pop(
        &self,
        packet_type: u8,
        deadline: Option<Instant>,
    ) -> Result<Option<TimestampedPacket>> {
        let queue = self.queues.get(&packet_type).ok_or_else(|| {
            Error::invalid_state(format!("no queue for packet type 0x{:02x}", packet_type))
        })?;

        loop {
            // register interest before checking, so a push in between is not missed
            let ready = queue.ready.notified();

            let next = match queue.packets.lock() {
                Ok(mut packets) => packets.pop_front(),
                Err(poisoned) => poisoned.into_inner().pop_front(),
            };
            if let Some(packet) = next {
                self.last_timestamp
                    .store(packet.arrival_millis, Ordering::Relaxed);
                return Ok(Some(packet));
            }

            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline || timeout_at(deadline, ready).await.is_err() {
                        return Ok(None);
                    }
                }
                None => ready.await,
            }
        }
    }

    /// Arrival time of the most recently popped packet, across all types
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp.load(Ordering::Relaxed)
    }

    /// Number of packets waiting under `packet_type`
    pub fn len(&self, packet_type: u8) -> usize {
        self.queues
            .get(&packet_type)
            .map(|q| match q.packets.lock() {
                Ok(packets) => packets.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .unwrap_or(0)
    }

    /// Marks the demux closed and releases every waiter
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for queue in self.queues.values() {
            queue.ready.notify_waiters();
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet_type::{ACK, PACKET_NO_ACK, UNKNOWN};
    use std::sync::Arc;
    use std::time::Duration;

    fn demux() -> TypeDemux {
        TypeDemux::new(&[ACK, PACKET_NO_ACK])
    }

    #[tokio::test]
    async fn test_fifo_with_timestamps() {
        let demux = demux();
        for i in 0..10u8 {
            assert_eq!(demux.push(PACKET_NO_ACK, Bytes::from(vec![i])), Routed::Queued);
        }
        assert_eq!(demux.len(PACKET_NO_ACK), 10);

        let mut last = i64::MIN;
        for i in 0..10u8 {
            let packet = demux.pop(PACKET_NO_ACK, None).await.unwrap().unwrap();
            assert_eq!(&packet.payload[..], &[i]);
            assert!(packet.arrival_millis >= last);
            assert_eq!(demux.last_timestamp(), packet.arrival_millis);
            last = packet.arrival_millis;
        }
    }

    #[tokio::test]
    async fn test_unregistered_type() {
        let demux = demux();
        assert_eq!(demux.push(0x10, Bytes::from_static(b"x")), Routed::Unregistered(0x10));
        assert_eq!(demux.push(UNKNOWN, Bytes::from_static(b"x")), Routed::Unregistered(UNKNOWN));
        assert!(!demux.is_registered(0x10));
        assert!(demux.pop(0x10, None).await.is_err());
    }

    #[tokio::test]
    async fn test_pop_deadline() {
        let demux = demux();
        let start = Instant::now();
        let result = demux
            .pop(ACK, Some(start + Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));

        // an already expired deadline still returns a queued packet
        demux.push(ACK, Bytes::from_static(&[7]));
        let packet = demux.pop(ACK, Some(start)).await.unwrap().unwrap();
        assert_eq!(&packet.payload[..], &[7]);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_push() {
        let demux = Arc::new(demux());
        let reader = {
            let demux = demux.clone();
            tokio::spawn(async move { demux.pop(PACKET_NO_ACK, None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        demux.push(PACKET_NO_ACK, Bytes::from_static(b"late"));

        let packet = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(&packet.payload[..], b"late");
    }

    #[test]
    fn test_pending_pop_is_woken() {
        let demux = demux();
        let mut pop = tokio_test::task::spawn(demux.pop(ACK, None));
        tokio_test::assert_pending!(pop.poll());

        demux.push(ACK, Bytes::from_static(&[14]));
        assert!(pop.is_woken());
        let packet = tokio_test::assert_ready_ok!(pop.poll()).unwrap();
        assert_eq!(&packet.payload[..], &[14]);
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let demux = Arc::new(demux());
        let reader = {
            let demux = demux.clone();
            tokio::spawn(async move { demux.pop(PACKET_NO_ACK, None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        demux.close();
        assert!(matches!(reader.await.unwrap(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_closed_queue_drains_first() {
        let demux = demux();
        demux.push(PACKET_NO_ACK, Bytes::from_static(b"kept"));
        demux.close();
        assert!(demux.is_closed());

        let packet = demux.pop(PACKET_NO_ACK, None).await.unwrap().unwrap();
        assert_eq!(&packet.payload[..], b"kept");
        assert!(matches!(demux.pop(PACKET_NO_ACK, None).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_last_timestamp_shared_across_types() {
        let demux = demux();
        demux.push(ACK, Bytes::from_static(&[1]));
        tokio::time::sleep(Duration::from_millis(5)).await;
        demux.push(PACKET_NO_ACK, Bytes::from_static(&[2]));

        let data = demux.pop(PACKET_NO_ACK, None).await.unwrap().unwrap();
        assert_eq!(demux.last_timestamp(), data.arrival_millis);
        let ack = demux.pop(ACK, None).await.unwrap().unwrap();
        assert_eq!(demux.last_timestamp(), ack.arrival_millis);
    }
}
