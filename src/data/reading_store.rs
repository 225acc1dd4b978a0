//! Ordered, thread-safe buffer of the readings of the run in progress.
//!
//! The run worker is the only writer. Readers (live views, persistence) either poll
//! with [`ReadingStore::since`] using the count they have already seen, or subscribe
//! to a broadcast of each new reading. Slow subscribers lag and skip readings rather
//! than block the writer; the store itself always holds the complete sequence.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::project::Reading;

/// Default broadcast capacity for live subscribers
const DEFAULT_TAP_CHANNEL_SIZE: usize = 256;

/// Append-only reading buffer shared between the run worker and its readers
#[derive(Clone)]
pub struct ReadingStore {
    readings: Arc<RwLock<Vec<Reading>>>,
    tap: broadcast::Sender<Reading>,
}

impl Default for ReadingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingStore {
    /// Empty store.
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(DEFAULT_TAP_CHANNEL_SIZE);
        Self {
            readings: Arc::new(RwLock::new(Vec::new())),
            tap,
        }
    }

    /// Append a reading and return the new count.
    pub fn push(&self, reading: Reading) -> usize {
        let count = {
            let mut readings = self.readings.write();
            readings.push(reading);
            readings.len()
        };
        // no subscribers is fine
        let _ = self.tap.send(reading);
        count
    }

    /// Number of readings taken
    pub fn len(&self) -> usize {
        self.readings.read().len()
    }

    /// True before the first reading
    pub fn is_empty(&self) -> bool {
        self.readings.read().is_empty()
    }

    /// Most recent reading
    pub fn last(&self) -> Option<Reading> {
        self.readings.read().last().copied()
    }

    /// Copy of every reading so far
    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.read().clone()
    }

    /// Readings after the first `seen`, for incremental polling.
    pub fn since(&self, seen: usize) -> Vec<Reading> {
        let readings = self.readings.read();
        readings.get(seen..).map(<[Reading]>::to_vec).unwrap_or_default()
    }

    /// Move every reading out, leaving the store empty.
    pub fn take(&self) -> Vec<Reading> {
        std::mem::take(&mut *self.readings.write())
    }

    /// Drop every reading.
    pub fn clear(&self) {
        self.readings.write().clear();
    }

    /// Receive each reading as it is appended.
    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.tap.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let store = ReadingStore::new();
        for i in 0..5 {
            assert_eq!(store.push(Reading::new(i as f64, i, i)), (i + 1) as usize);
        }
        let values: Vec<i64> = store.snapshot().iter().map(|r| r.pump1).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.last().map(|r| r.pump2), Some(4));
    }

    #[test]
    fn test_since_returns_tail() {
        let store = ReadingStore::new();
        for i in 0..4 {
            store.push(Reading::new(0.0, i, i));
        }
        assert_eq!(store.since(2).len(), 2);
        assert_eq!(store.since(2)[0].pump1, 2);
        assert!(store.since(4).is_empty());
        assert!(store.since(10).is_empty());
    }

    #[test]
    fn test_take_empties_store() {
        let store = ReadingStore::new();
        store.push(Reading::new(0.0, 1, 1));
        let clone = store.clone();
        assert_eq!(clone.take().len(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_new_readings() {
        let store = ReadingStore::new();
        let mut rx = store.subscribe();
        store.push(Reading::new(0.5, 100, 200));
        let reading = rx.recv().await.unwrap();
        assert_eq!(reading.average, 150);
    }

    #[test]
    fn test_concurrent_reader_sees_prefix() {
        let store = ReadingStore::new();
        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..1000 {
                writer.push(Reading::new(0.0, i, i));
            }
        });
        for _ in 0..100 {
            let snap = store.snapshot();
            assert!(snap.iter().enumerate().all(|(i, r)| r.pump1 == i as i64));
        }
        handle.join().unwrap();
        assert_eq!(store.len(), 1000);
    }
}
