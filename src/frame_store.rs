//! Sequential in-memory store of acquired frames.
//!
//! Frames and their timestamps are kept in two parallel vectors that always
//! have the same length. The store grows by a fixed extension chunk when it
//! is full and shrinks only on `reset` or on consuming reads.

use tracing::{debug, warn};

use crate::frame::{Frame, FrameTimestamp};

const MIB: f64 = 1024.0 * 1024.0;

/// Growable frame store with consuming reads.
#[derive(Debug)]
pub struct FrameStore {
    frames: Vec<Frame>,
    timestamps: Vec<FrameTimestamp>,
    capacity: usize,
    initial_capacity: usize,
    extension_chunk: usize,
    extensions: usize,
    payload_bytes: usize,
}

impl FrameStore {
    /// Store with room for `initial_capacity` frames, grown by `extension_chunk`.
    pub fn new(initial_capacity: usize, extension_chunk: usize) -> Self {
        Self {
            frames: Vec::with_capacity(initial_capacity),
            timestamps: Vec::with_capacity(initial_capacity),
            capacity: initial_capacity,
            initial_capacity,
            extension_chunk: extension_chunk.max(1),
            extensions: 0,
            payload_bytes: 0,
        }
    }

    /// Number of stored frames.
    pub fn count(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are waiting.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Slots available before the next extension.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunk extensions since construction or the last reset.
    pub fn extensions(&self) -> usize {
        self.extensions
    }

    /// Reallocate both sequences to hold `capacity` frames.
    ///
    /// Never drops stored frames: the capacity is at least `count()`.
    pub fn reserve(&mut self, capacity: usize) {
        if !self.frames.is_empty() {
            warn!(
                count = self.frames.len(),
                capacity, "Reserving frame store capacity while frames are stored"
            );
        }
        self.resize_to(capacity);
    }

    fn resize_to(&mut self, capacity: usize) {
        let capacity = capacity.max(self.frames.len());
        if capacity > self.frames.capacity() {
            self.frames.reserve_exact(capacity - self.frames.len());
            self.timestamps.reserve_exact(capacity - self.timestamps.len());
        } else {
            self.frames.shrink_to(capacity);
            self.timestamps.shrink_to(capacity);
        }
        self.capacity = capacity;
    }

    /// Append one frame, growing by an extension chunk when full.
    pub fn append(&mut self, frame: Frame, timestamp: FrameTimestamp) {
        if self.frames.len() == self.capacity {
            self.resize_to(self.capacity + self.extension_chunk);
            self.extensions += 1;
            debug!(
                capacity = self.capacity,
                extensions = self.extensions,
                "Frame store extended"
            );
        }
        self.payload_bytes += frame.byte_len();
        self.frames.push(frame);
        self.timestamps.push(timestamp);
    }

    /// Borrow one stored frame without removing it.
    pub fn peek(&self, index: usize) -> Option<(&Frame, &FrameTimestamp)> {
        Some((self.frames.get(index)?, self.timestamps.get(index)?))
    }

    /// Remove and return the requested frames.
    ///
    /// `None` takes everything. Otherwise entries come back in request order,
    /// duplicates once (first occurrence), out-of-range indices ignored. The
    /// frames left behind keep their relative order.
    pub fn get(&mut self, indices: Option<&[usize]>) -> (Vec<Frame>, Vec<FrameTimestamp>) {
        let Some(indices) = indices else {
            self.payload_bytes = 0;
            let frames = std::mem::replace(&mut self.frames, Vec::with_capacity(self.capacity));
            let timestamps =
                std::mem::replace(&mut self.timestamps, Vec::with_capacity(self.capacity));
            return (frames, timestamps);
        };

        let count = self.frames.len();
        let mut slots: Vec<Option<(Frame, FrameTimestamp)>> = self
            .frames
            .drain(..)
            .zip(self.timestamps.drain(..))
            .map(Some)
            .collect();

        let mut frames = Vec::new();
        let mut timestamps = Vec::new();
        for &index in indices {
            if index >= count {
                continue;
            }
            if let Some((frame, timestamp)) = slots[index].take() {
                self.payload_bytes -= frame.byte_len();
                frames.push(frame);
                timestamps.push(timestamp);
            }
        }

        for (frame, timestamp) in slots.into_iter().flatten() {
            self.frames.push(frame);
            self.timestamps.push(timestamp);
        }
        (frames, timestamps)
    }

    /// Drop every frame and return to the initial capacity.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.timestamps.clear();
        self.payload_bytes = 0;
        self.extensions = 0;
        self.resize_to(self.initial_capacity);
    }

    /// Memory held by stored frame payloads, in MiB.
    pub fn memory_mib(&self) -> f64 {
        self.payload_bytes as f64 / MIB
    }

    /// Bytes held by stored frame payloads.
    pub fn memory_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Warn and return `true` when stored payloads exceed `limit_mib`.
    ///
    /// A limit of zero disables the check.
    pub fn check_memory_limit(&self, limit_mib: u64) -> bool {
        if limit_mib == 0 {
            return false;
        }
        let used = self.memory_mib();
        if used > limit_mib as f64 {
            warn!(
                used_mib = used,
                limit_mib,
                count = self.count(),
                "Frame store above memory limit, read or flush data"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tracing_test::traced_test;

    fn frame(n: u64) -> Frame {
        Frame::from_u16(2, 2, n, &[n as u16; 4])
    }

    fn ts(n: u64) -> FrameTimestamp {
        Utc.timestamp_opt(1_700_000_000 + n as i64, 0).unwrap()
    }

    fn store_with(n: u64) -> FrameStore {
        let mut store = FrameStore::new(8, 4);
        for i in 0..n {
            store.append(frame(i), ts(i));
        }
        store
    }

    fn numbers(frames: &[Frame]) -> Vec<u64> {
        frames.iter().map(|f| f.image_number).collect()
    }

    #[test]
    fn growth_happens_exactly_once_at_capacity_plus_one() {
        let mut store = FrameStore::new(3, 5);
        for i in 0..3 {
            store.append(frame(i), ts(i));
        }
        assert_eq!(store.extensions(), 0);
        store.append(frame(3), ts(3));
        assert_eq!(store.extensions(), 1);
        assert_eq!(store.capacity(), 8);
        assert_eq!(store.count(), 4);
    }

    #[test]
    fn consuming_read_of_middle_frame() {
        let mut store = store_with(5);
        let (frames, stamps) = store.get(Some(&[2]));
        assert_eq!(numbers(&frames), vec![2]);
        assert_eq!(stamps, vec![ts(2)]);
        assert_eq!(store.count(), 4);

        let (rest, rest_ts) = store.get(None);
        assert_eq!(numbers(&rest), vec![0, 1, 3, 4]);
        assert_eq!(rest_ts.len(), 4);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn read_order_duplicates_and_out_of_range() {
        let mut store = store_with(5);
        let (frames, stamps) = store.get(Some(&[4, 1, 4, 9, 1]));
        assert_eq!(numbers(&frames), vec![4, 1]);
        assert_eq!(stamps, vec![ts(4), ts(1)]);
        assert_eq!(store.count(), 3);
        assert_eq!(store.peek(0).unwrap().0.image_number, 0);
        assert_eq!(store.peek(1).unwrap().0.image_number, 2);
        assert_eq!(store.peek(2).unwrap().0.image_number, 3);
    }

    #[test]
    fn parallel_lengths_hold_through_operations() {
        let mut store = store_with(6);
        store.get(Some(&[0, 5]));
        store.append(frame(10), ts(10));
        let (frames, stamps) = store.get(None);
        assert_eq!(frames.len(), stamps.len());
        assert_eq!(frames.len(), 5);
    }

    #[test]
    fn reset_clears_and_restores_capacity() {
        let mut store = store_with(12);
        assert!(store.extensions() > 0);
        store.reset();
        assert_eq!(store.count(), 0);
        assert_eq!(store.capacity(), 8);
        assert_eq!(store.extensions(), 0);
        assert_eq!(store.memory_bytes(), 0);
    }

    #[test]
    fn memory_tracks_payloads() {
        let mut store = store_with(4);
        assert_eq!(store.memory_bytes(), 4 * 8);
        store.get(Some(&[0]));
        assert_eq!(store.memory_bytes(), 3 * 8);
        assert!(!store.check_memory_limit(0));
        assert!(!store.check_memory_limit(1));
    }

    #[test]
    #[traced_test]
    fn reserve_with_frames_warns() {
        let mut store = store_with(2);
        store.reserve(100);
        assert_eq!(store.capacity(), 100);
        assert_eq!(store.count(), 2);
        assert!(logs_contain("Reserving frame store capacity"));
    }

    #[test]
    fn reserve_never_drops_frames() {
        let mut store = store_with(6);
        store.reserve(2);
        assert_eq!(store.capacity(), 6);
        assert_eq!(store.count(), 6);
    }
}
