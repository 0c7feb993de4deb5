//! Raw output distribution: ring buffer, screen model, live observers.

mod emulator;

pub use emulator::{AlacrittyScreen, MemoryScreen, ScreenModel};

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// What a newly attached observer wants backfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscribeMode {
    /// Ring buffer history, or full scrollback when the ring is empty.
    Full,
    /// Current screen only.
    Screen,
}

/// Backfill handed to a new observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backfill {
    /// Raw ring-buffer contents.
    Replay(Vec<u8>),
    /// Emulator-serialized text (ring buffer was empty, or screen mode).
    Snapshot(String),
    /// Nothing to replay.
    None,
}

/// Capped drop-oldest buffer of recent raw output.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.buf.len() == self.capacity {
                self.buf.pop_front();
            }
            self.buf.push_back(b);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }
}

struct ObserverEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Fans every raw chunk out to the ring buffer, the screen model, and all
/// live observers, in that order. An observer whose channel is gone is
/// silently dropped.
pub struct OutputDistributor {
    ring: RingBuffer,
    screen: Box<dyn ScreenModel>,
    observers: Vec<ObserverEntry>,
    next_observer_id: u64,
}

impl OutputDistributor {
    pub fn new(ring_capacity: usize, screen: Box<dyn ScreenModel>) -> Self {
        Self {
            ring: RingBuffer::new(ring_capacity),
            screen,
            observers: Vec::new(),
            next_observer_id: 1,
        }
    }

    /// Distribute one raw output chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.ring.push(chunk);
        self.screen.feed(chunk);
        self.observers.retain(|observer| {
            let delivered = observer.tx.send(chunk.to_vec()).is_ok();
            if !delivered {
                debug!(observer = observer.id, "dropping dead observer");
            }
            delivered
        });
    }

    /// Attach a live observer; returns its id and the history backfill.
    pub fn subscribe(
        &mut self,
        mode: SubscribeMode,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> (u64, Backfill) {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.observers.push(ObserverEntry { id, tx });

        let backfill = match mode {
            SubscribeMode::Screen => {
                let snapshot = self.screen.serialize_screen();
                if snapshot.is_empty() {
                    Backfill::None
                } else {
                    Backfill::Snapshot(snapshot)
                }
            }
            SubscribeMode::Full => {
                if !self.ring.is_empty() {
                    Backfill::Replay(self.ring.contents())
                } else {
                    let snapshot = self.screen.serialize_scrollback();
                    if snapshot.is_empty() {
                        Backfill::None
                    } else {
                        Backfill::Snapshot(snapshot)
                    }
                }
            }
        };
        (id, backfill)
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.observers.retain(|observer| observer.id != id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Resize the underlying screen model.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.screen.resize(cols, rows);
    }

    /// Serialize the screen model on demand.
    pub fn snapshot(&self, mode: SubscribeMode) -> String {
        match mode {
            SubscribeMode::Screen => self.screen.serialize_screen(),
            SubscribeMode::Full => self.screen.serialize_scrollback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distributor() -> OutputDistributor {
        OutputDistributor::new(16, Box::new(MemoryScreen::new(24)))
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let mut ring = RingBuffer::new(4);
        ring.push(b"abcdef");
        assert_eq!(ring.contents(), b"cdef");
    }

    #[test]
    fn test_feed_reaches_live_observer() {
        let mut dist = distributor();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dist.subscribe(SubscribeMode::Full, tx);

        dist.feed(b"chunk");
        assert_eq!(rx.try_recv().unwrap(), b"chunk");
    }

    #[test]
    fn test_dead_observer_silently_unsubscribed() {
        let mut dist = distributor();
        let (tx, rx) = mpsc::unbounded_channel();
        dist.subscribe(SubscribeMode::Full, tx);
        assert_eq!(dist.observer_count(), 1);

        drop(rx);
        dist.feed(b"data");
        assert_eq!(dist.observer_count(), 0);
    }

    #[test]
    fn test_subscribe_replays_ring_buffer() {
        let mut dist = distributor();
        dist.feed(b"history");

        let (tx, _rx) = mpsc::unbounded_channel();
        let (_, backfill) = dist.subscribe(SubscribeMode::Full, tx);
        assert_eq!(backfill, Backfill::Replay(b"history".to_vec()));
    }

    #[test]
    fn test_subscribe_falls_back_to_snapshot() {
        // Ring buffer empty but the screen model has state: snapshot wins.
        let mut screen = MemoryScreen::new(24);
        screen.feed(b"restored screen\n");
        let mut dist = OutputDistributor::new(16, Box::new(screen));

        let (tx, _rx) = mpsc::unbounded_channel();
        let (_, backfill) = dist.subscribe(SubscribeMode::Full, tx);
        assert_eq!(backfill, Backfill::Snapshot("restored screen\n".to_string()));
    }

    #[test]
    fn test_subscribe_screen_mode_serializes_screen_only() {
        let mut dist = OutputDistributor::new(16, Box::new(MemoryScreen::new(1)));
        dist.feed(b"old line\nvisible line\n");

        let (tx, _rx) = mpsc::unbounded_channel();
        let (_, backfill) = dist.subscribe(SubscribeMode::Screen, tx);
        assert_eq!(backfill, Backfill::Snapshot("visible line\n".to_string()));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut dist = distributor();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, _) = dist.subscribe(SubscribeMode::Full, tx);

        dist.unsubscribe(id);
        dist.feed(b"after");
        assert!(rx.try_recv().is_err());
    }
}
