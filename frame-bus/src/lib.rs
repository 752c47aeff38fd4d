//! Single-slot "latest JPEG" broadcast.
//!
//! One producer publishes encoded frames; any number of consumers wait for a
//! frame newer than the last one they saw. Only the most recent frame is
//! retained, so a slow consumer never holds back the producer and never sees
//! stale history. Published bytes are immutable and shared zero-copy.
//!
//! Implemented as a versioned slot on `tokio::sync::watch`: publishing swaps
//! the bytes and bumps the version atomically, waking all waiters.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

#[derive(Clone, Debug)]
struct Slot {
    seq: u64,
    bytes: Option<Bytes>,
    closed: bool,
}

/// Producer side. Cheap to clone; all clones publish into the same slot.
#[derive(Clone)]
pub struct FrameBus {
    tx: watch::Sender<Slot>,
}

/// One consumer's view of the bus.
pub struct FrameTap {
    rx: watch::Receiver<Slot>,
}

/// Result of [`FrameTap::wait_newer`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// A frame newer than `last_seen`.
    Frame { bytes: Bytes, frame_id: u64 },
    /// No newer frame arrived within the timeout.
    TimedOut,
    /// The bus was closed; no further frames will arrive.
    Shutdown,
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Slot {
            seq: 0,
            bytes: None,
            closed: false,
        });
        Self { tx }
    }

    /// Publish a new frame, replacing the previous one, and wake all
    /// waiters. Returns the frame id, which strictly increases.
    pub fn publish(&self, bytes: Bytes) -> u64 {
        let mut id = 0;
        self.tx.send_modify(|slot| {
            slot.seq += 1;
            slot.bytes = Some(bytes);
            id = slot.seq;
        });
        id
    }

    /// Drop the current frame without bumping the version. Waiters keep
    /// waiting; new subscribers see no frame until the next publish.
    pub fn clear(&self) {
        self.tx.send_modify(|slot| slot.bytes = None);
    }

    /// Close the bus. All current and future waiters get
    /// [`WaitOutcome::Shutdown`].
    pub fn close(&self) {
        self.tx.send_modify(|slot| {
            slot.closed = true;
            slot.bytes = None;
        });
    }

    /// Id of the most recently published frame (0 before the first publish).
    pub fn current_frame_id(&self) -> u64 {
        self.tx.borrow().seq
    }

    pub fn subscribe(&self) -> FrameTap {
        FrameTap {
            rx: self.tx.subscribe(),
        }
    }
}

impl FrameTap {
    /// Wait until a frame with id greater than `last_seen` is available,
    /// the bus shuts down, or the timeout elapses.
    pub async fn wait_newer(&mut self, last_seen: u64, timeout: Duration) -> WaitOutcome {
        let wait = self
            .rx
            .wait_for(|slot| slot.closed || (slot.seq > last_seen && slot.bytes.is_some()));
        match tokio::time::timeout(timeout, wait).await {
            Err(_elapsed) => WaitOutcome::TimedOut,
            // The producer side was dropped entirely.
            Ok(Err(_)) => WaitOutcome::Shutdown,
            Ok(Ok(slot)) => {
                if slot.closed {
                    WaitOutcome::Shutdown
                } else {
                    match &slot.bytes {
                        Some(bytes) => WaitOutcome::Frame {
                            bytes: bytes.clone(),
                            frame_id: slot.seq,
                        },
                        // Unreachable given the predicate, but harmless.
                        None => WaitOutcome::Shutdown,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn frame_ids_strictly_increase() {
        let bus = FrameBus::new();
        let mut prev = 0;
        for i in 0..100u8 {
            let id = bus.publish(Bytes::from(vec![i]));
            assert!(id > prev);
            prev = id;
        }
    }

    #[tokio::test]
    async fn waiter_sees_each_frame_at_most_once() {
        let bus = FrameBus::new();
        let mut tap = bus.subscribe();
        let mut last = 0;
        let mut seen = Vec::new();
        for i in 0..5u8 {
            bus.publish(Bytes::from(vec![i]));
            match tap.wait_newer(last, LONG).await {
                WaitOutcome::Frame { frame_id, .. } => {
                    assert!(frame_id > last);
                    last = frame_id;
                    seen.push(frame_id);
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        // Nothing newer: must time out rather than repeat a frame.
        assert_eq!(tap.wait_newer(last, SHORT).await, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn slow_consumer_only_sees_latest() {
        let bus = FrameBus::new();
        let mut tap = bus.subscribe();
        for i in 0..10u8 {
            bus.publish(Bytes::from(vec![i]));
        }
        match tap.wait_newer(0, LONG).await {
            WaitOutcome::Frame { bytes, frame_id } => {
                assert_eq!(frame_id, 10);
                assert_eq!(bytes.as_ref(), &[9u8]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_when_nothing_published() {
        let bus = FrameBus::new();
        let mut tap = bus.subscribe();
        assert_eq!(tap.wait_newer(0, SHORT).await, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let bus = FrameBus::new();
        let mut tap = bus.subscribe();
        let waiter = tokio::spawn(async move { tap.wait_newer(0, LONG).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.close();
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Shutdown);
    }

    #[tokio::test]
    async fn clear_does_not_wake_or_bump() {
        let bus = FrameBus::new();
        bus.publish(Bytes::from_static(b"a"));
        bus.clear();
        assert_eq!(bus.current_frame_id(), 1);
        let mut tap = bus.subscribe();
        assert_eq!(tap.wait_newer(1, SHORT).await, WaitOutcome::TimedOut);
        // A fresh publish after clear is delivered normally.
        bus.publish(Bytes::from_static(b"b"));
        match tap.wait_newer(1, LONG).await {
            WaitOutcome::Frame { frame_id, .. } => assert_eq!(frame_id, 2),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn many_concurrent_consumers() {
        let bus = FrameBus::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mut tap = bus.subscribe();
            handles.push(tokio::spawn(async move {
                let mut last = 0;
                let mut count = 0;
                loop {
                    match tap.wait_newer(last, LONG).await {
                        WaitOutcome::Frame { frame_id, .. } => {
                            assert!(frame_id > last);
                            last = frame_id;
                            count += 1;
                        }
                        WaitOutcome::Shutdown => return count,
                        WaitOutcome::TimedOut => panic!("timed out"),
                    }
                }
            }));
        }
        for i in 0..20u8 {
            bus.publish(Bytes::from(vec![i]));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        bus.close();
        for h in handles {
            let count = h.await.unwrap();
            assert!(count <= 20);
            assert!(count > 0);
        }
    }
}
