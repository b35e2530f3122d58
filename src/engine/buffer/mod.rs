//! Decode buffer: the handoff between the decoder callback and the pipeline loop.
//!
//! Holds decoded 16-bit little-endian PCM that has not yet been fed to the
//! time scaler. The decoder callback appends at the tail, the pipeline loop
//! consumes from the head. Storage starts small and doubles on demand up to a
//! hard maximum; reaching that maximum is the signal the decoder callback uses
//! to throttle itself.

pub mod pool;

use crate::engine::lock;
use crate::error::{Error, Result};
use ringbuf::{
    traits::{Consumer, Observer, Producer},
    HeapRb,
};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Growable byte ring buffer of decoded audio.
///
/// Not internally synchronised: the engine keeps it behind a single mutex.
pub struct DecodeRingBuffer {
    storage: HeapRb<u8>,
    initial_capacity: usize,
    max_capacity: usize,
    /// Samples (16-bit units) consumed from the head since the last clear.
    total_advanced: u64,
}

impl DecodeRingBuffer {
    /// Creates an empty buffer. `initial_capacity` is clamped into `1..=max_capacity`.
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(1);
        let initial_capacity = initial_capacity.clamp(1, max_capacity);
        Self {
            storage: HeapRb::new(initial_capacity),
            initial_capacity,
            max_capacity,
            total_advanced: 0,
        }
    }

    /// Appends decoded bytes, growing storage if needed.
    ///
    /// An append that would take the buffer past its maximum is rejected
    /// whole; callers are expected to wait for room first (see
    /// [`has_room_for`](Self::has_room_for)).
    pub fn add_data(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let size = self.size_in_bytes();
        let needed = size + bytes.len();
        if needed > self.max_capacity {
            return Err(Error::DecodeBufferOverflow {
                requested: bytes.len(),
                size,
                max: self.max_capacity,
            });
        }
        if needed > self.capacity() {
            self.grow_to(needed);
        }
        let pushed = self.storage.push_slice(bytes);
        debug_assert_eq!(pushed, bytes.len());
        Ok(())
    }

    fn grow_to(&mut self, needed: usize) {
        let mut capacity = self.capacity();
        while capacity < needed {
            capacity = capacity.saturating_mul(2).min(self.max_capacity);
        }

        let mut grown = HeapRb::<u8>::new(capacity);
        let (head, tail) = self.storage.as_slices();
        grown.push_slice(head);
        grown.push_slice(tail);

        trace!(
            "Decode buffer grown {} -> {} bytes ({} buffered)",
            self.capacity(),
            capacity,
            grown.occupied_len()
        );
        self.storage = grown;
    }

    /// Returns the `index`-th unconsumed sample, or `None` past the end.
    pub fn get_at_index(&self, index: usize) -> Option<i16> {
        let offset = index.checked_mul(2)?;
        if offset + 2 > self.size_in_bytes() {
            return None;
        }
        let (head, tail) = self.storage.as_slices();
        let byte_at = |j: usize| {
            if j < head.len() {
                head[j]
            } else {
                tail[j - head.len()]
            }
        };
        Some(i16::from_le_bytes([byte_at(offset), byte_at(offset + 1)]))
    }

    /// Marks `count` samples as consumed and returns how many were.
    ///
    /// Clamped to the whole samples currently buffered.
    pub fn advance_head_pointer_shorts(&mut self, count: usize) -> usize {
        let count = count.min(self.sample_count());
        let skipped = self.storage.skip(count * 2);
        debug_assert_eq!(skipped, count * 2);
        self.total_advanced += count as u64;
        count
    }

    /// Drops all buffered bytes and resets the advanced counter.
    pub fn clear(&mut self) {
        self.storage.clear();
        self.total_advanced = 0;
    }

    /// Drops buffered bytes, keeping the advanced counter.
    pub fn discard_buffered(&mut self) -> usize {
        self.storage.clear()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.storage.occupied_len()
    }

    /// Whole 16-bit samples buffered.
    pub fn sample_count(&self) -> usize {
        self.size_in_bytes() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.size_in_bytes() == 0
    }

    /// True once the buffer holds its maximum.
    pub fn is_too_large(&self) -> bool {
        self.size_in_bytes() >= self.max_capacity
    }

    /// Whether `len` more bytes can be appended without exceeding the maximum.
    pub fn has_room_for(&self, len: usize) -> bool {
        self.size_in_bytes() + len <= self.max_capacity
    }

    pub fn total_advanced_count(&self) -> u64 {
        self.total_advanced
    }

    /// Current storage capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.capacity().get()
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }
}

/// The decode buffer as shared between the decoder callback and the pipeline.
///
/// One mutex guards the buffer. The condvar is signalled whenever the
/// pipeline drains it.
pub struct SharedDecodeBuffer {
    buffer: Mutex<DecodeRingBuffer>,
    drained: Condvar,
}

impl SharedDecodeBuffer {
    pub fn new(buffer: DecodeRingBuffer) -> Self {
        Self {
            buffer: Mutex::new(buffer),
            drained: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DecodeRingBuffer> {
        lock(&self.buffer)
    }

    /// Wakes a decoder callback waiting for room.
    pub fn notify_drained(&self) {
        self.drained.notify_all();
    }

    /// Blocks until `len` bytes fit, polling `abandon` every `poll` interval.
    ///
    /// Returns the guard with room available, or `None` if `abandon` fired.
    /// A `len` larger than the maximum can never fit and returns at once,
    /// leaving the append to report the overflow.
    pub fn wait_for_room(
        &self,
        len: usize,
        poll: Duration,
        abandon: impl Fn() -> bool,
    ) -> Option<MutexGuard<'_, DecodeRingBuffer>> {
        let mut guard = self.lock();
        if len > guard.max_capacity() {
            return Some(guard);
        }
        while !guard.has_room_for(len) {
            if abandon() {
                return None;
            }
            guard = self
                .drained
                .wait_timeout(guard, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(guard)
    }

    /// Blocks while the buffer is at its maximum, polling `abandon` every `poll`.
    pub fn wait_while_too_large(&self, poll: Duration, abandon: impl Fn() -> bool) {
        let mut guard = self.lock();
        while guard.is_too_large() && !abandon() {
            guard = self
                .drained
                .wait_timeout(guard, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
