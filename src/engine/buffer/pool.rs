//! Output buffer pool: the handoff between the pipeline loop and the output
//! device's completion callback.
//!
//! Every buffer is in exactly one place: held by the pipeline (just acquired),
//! on the free stack, or in the in-flight queue shared with the output.
//! The output reports completions in submission order, so the head of the
//! in-flight queue is always the buffer being retired.

use crate::engine::lock;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

/// Fixed-size block of interleaved 16-bit samples bound for the output.
#[derive(Debug)]
pub struct PlayBuffer {
    id: u64,
    samples: Box<[i16]>,
    channels: usize,
    frames: usize,
}

/// A submitted buffer, shared between the pool and the output until retired.
pub type SharedPlayBuffer = Arc<PlayBuffer>;

impl PlayBuffer {
    fn new(id: u64, capacity_frames: usize, channels: usize) -> Self {
        Self {
            id,
            samples: vec![0i16; capacity_frames * channels].into_boxed_slice(),
            channels,
            frames: 0,
        }
    }

    /// Stable identity for the lifetime of the pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Valid frames written by the last fill.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn capacity_frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// The valid interleaved samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples[..self.frames * self.channels]
    }

    /// Overwrites the buffer with `frames` frames taken from `source`.
    ///
    /// Float samples are in [-1.0, 1.0] and are clamped on conversion.
    pub fn write_from_f32(&mut self, source: &[f32], frames: usize) {
        let frames = frames.min(self.capacity_frames());
        let len = frames * self.channels;
        for (out, &sample) in self.samples[..len].iter_mut().zip(&source[..len]) {
            *out = (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
        self.frames = frames;
    }
}

struct PoolInner {
    free: Vec<PlayBuffer>,
    in_flight: VecDeque<SharedPlayBuffer>,
    next_id: u64,
    /// Buffers allocated and not yet discarded or released.
    live: usize,
}

/// Recycling pool of output buffers with a bounded in-flight queue.
pub struct PlayBufferPool {
    inner: Mutex<PoolInner>,
    frames_per_buffer: usize,
    channels: usize,
    max_in_flight: usize,
}

impl PlayBufferPool {
    pub fn new(frames_per_buffer: usize, channels: usize, max_in_flight: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                in_flight: VecDeque::new(),
                next_id: 0,
                live: 0,
            }),
            frames_per_buffer,
            channels,
            max_in_flight,
        }
    }

    /// Pops the most recently freed buffer, or allocates a new one.
    pub fn acquire(&self) -> PlayBuffer {
        let mut inner = lock(&self.inner);
        if let Some(buffer) = inner.free.pop() {
            return buffer;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live += 1;
        trace!("Allocating play buffer {}", id);
        PlayBuffer::new(id, self.frames_per_buffer, self.channels)
    }

    /// Returns an acquired buffer that was never submitted.
    pub fn recycle(&self, buffer: PlayBuffer) {
        lock(&self.inner).free.push(buffer);
    }

    /// Hands `buffer` to the output through `enqueue`.
    ///
    /// The buffer joins the in-flight queue before `enqueue` runs so that a
    /// completion firing during the handoff finds it. `enqueue` runs without
    /// the pool lock held. If it fails the buffer is taken back out of the
    /// queue and dropped, and the error is returned.
    pub fn submit<F>(&self, buffer: PlayBuffer, enqueue: F) -> Result<()>
    where
        F: FnOnce(SharedPlayBuffer) -> Result<()>,
    {
        let id = buffer.id();
        let shared = Arc::new(buffer);
        lock(&self.inner).in_flight.push_back(Arc::clone(&shared));

        let result = enqueue(shared);
        if result.is_err() {
            let mut inner = lock(&self.inner);
            if let Some(pos) = inner.in_flight.iter().rposition(|b| b.id() == id) {
                inner.in_flight.remove(pos);
            }
            inner.live -= 1;
            warn!("Output rejected play buffer {}; discarding it", id);
        }
        result
    }

    /// Retires the head of the in-flight queue. Called once per completion.
    ///
    /// A completion with nothing in flight (e.g. after teardown) is ignored.
    pub fn on_output_consumed(&self) {
        let mut inner = lock(&self.inner);
        let Some(shared) = inner.in_flight.pop_front() else {
            trace!("Spurious output completion ignored");
            return;
        };
        match Arc::try_unwrap(shared) {
            Ok(buffer) => inner.free.push(buffer),
            Err(shared) => {
                // The output still holds a handle; let it keep that one.
                warn!(
                    "Play buffer {} completed while still referenced by the output",
                    shared.id()
                );
                inner.live -= 1;
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner).in_flight.len()
    }

    pub fn free_count(&self) -> usize {
        lock(&self.inner).free.len()
    }

    /// Buffers currently allocated (free, in flight, or held by the pipeline).
    pub fn live_count(&self) -> usize {
        lock(&self.inner).live
    }

    pub fn has_reached_limit(&self) -> bool {
        self.in_flight_count() >= self.max_in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Drops every pooled buffer. Used at session teardown.
    pub fn release_all(&self) {
        let mut inner = lock(&self.inner);
        let released = inner.free.len() + inner.in_flight.len();
        inner.free.clear();
        inner.in_flight.clear();
        inner.live = inner.live.saturating_sub(released);
        trace!("Released {} play buffers", released);
    }

    #[cfg(test)]
    fn snapshot(&self) -> (Vec<u64>, Vec<u64>) {
        let inner = lock(&self.inner);
        (
            inner.free.iter().map(|b| b.id()).collect(),
            inner.in_flight.iter().map(|b| b.id()).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashSet;

    fn ok_enqueue(_: SharedPlayBuffer) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_acquire_allocates_fixed_size() {
        let pool = PlayBufferPool::new(1152, 2, 2);
        let buffer = pool.acquire();
        assert_eq!(buffer.capacity_frames(), 1152);
        assert_eq!(buffer.channels(), 2);
        assert_eq!(buffer.frames(), 0);
        assert!(buffer.samples().is_empty());
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_write_from_f32_converts_and_clamps() {
        let pool = PlayBufferPool::new(4, 2, 2);
        let mut buffer = pool.acquire();
        buffer.write_from_f32(&[0.0, 0.5, -0.5, 1.5, -2.0, 1.0], 3);
        assert_eq!(buffer.frames(), 3);
        assert_eq!(buffer.samples(), &[0, 16384, -16384, i16::MAX, i16::MIN, i16::MAX]);
    }

    #[test]
    fn test_completions_retire_in_submission_order() {
        let pool = PlayBufferPool::new(16, 2, 8);
        let b1 = pool.acquire();
        let b2 = pool.acquire();
        let b3 = pool.acquire();
        let ids = [b1.id(), b2.id(), b3.id()];

        pool.submit(b1, ok_enqueue).unwrap();
        pool.submit(b2, ok_enqueue).unwrap();
        pool.submit(b3, ok_enqueue).unwrap();
        assert_eq!(pool.in_flight_count(), 3);

        pool.on_output_consumed();
        assert_eq!(pool.snapshot(), (vec![ids[0]], vec![ids[1], ids[2]]));
        pool.on_output_consumed();
        pool.on_output_consumed();

        // B3 on top of B2 on top of B1
        let (free, in_flight) = pool.snapshot();
        assert_eq!(free, ids.to_vec());
        assert!(in_flight.is_empty());

        // LIFO reuse: the most recently retired buffer comes back first
        assert_eq!(pool.acquire().id(), ids[2]);
        assert_eq!(pool.acquire().id(), ids[1]);
        assert_eq!(pool.acquire().id(), ids[0]);
        assert_eq!(pool.live_count(), 3);
    }

    #[test]
    fn test_spurious_completion_is_noop() {
        let pool = PlayBufferPool::new(16, 1, 2);
        pool.on_output_consumed();
        assert_eq!(pool.in_flight_count(), 0);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_failed_submission_discards_buffer() {
        let pool = PlayBufferPool::new(16, 2, 2);
        let kept = pool.acquire();
        let rejected = pool.acquire();
        pool.submit(kept, ok_enqueue).unwrap();

        let result = pool.submit(rejected, |_| Err(Error::AudioOutput("queue full".into())));
        assert!(result.is_err());
        assert_eq!(pool.in_flight_count(), 1);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_completion_during_enqueue_finds_buffer() {
        let pool = Arc::new(PlayBufferPool::new(16, 2, 2));
        let buffer = pool.acquire();
        let id = buffer.id();

        let pool_for_output = Arc::clone(&pool);
        pool.submit(buffer, move |shared| {
            drop(shared);
            pool_for_output.on_output_consumed();
            Ok(())
        })
        .unwrap();

        assert_eq!(pool.in_flight_count(), 0);
        assert_eq!(pool.snapshot().0, vec![id]);
    }

    #[test]
    fn test_limit_tracks_in_flight() {
        let pool = PlayBufferPool::new(16, 2, 2);
        assert!(!pool.has_reached_limit());
        pool.submit(pool.acquire(), ok_enqueue).unwrap();
        assert!(!pool.has_reached_limit());
        pool.submit(pool.acquire(), ok_enqueue).unwrap();
        assert!(pool.has_reached_limit());
        pool.on_output_consumed();
        assert!(!pool.has_reached_limit());
    }

    #[test]
    fn test_free_and_in_flight_stay_disjoint() {
        let pool = PlayBufferPool::new(8, 2, 4);
        let mut held: Vec<PlayBuffer> = Vec::new();
        let mut discarded = 0;

        // Deterministic mix of acquire / submit / fail / complete / recycle
        for step in 0..200u32 {
            match step % 7 {
                0 | 3 => held.push(pool.acquire()),
                1 | 4 => {
                    if let Some(buffer) = held.pop() {
                        if step % 11 == 0 {
                            let _ = pool.submit(buffer, |_| Err(Error::AudioOutput("busy".into())));
                            discarded += 1;
                        } else {
                            pool.submit(buffer, ok_enqueue).unwrap();
                        }
                    }
                }
                2 | 5 => pool.on_output_consumed(),
                _ => {
                    if let Some(buffer) = held.pop() {
                        pool.recycle(buffer);
                    }
                }
            }

            let (free, in_flight) = pool.snapshot();
            let free: HashSet<u64> = free.into_iter().collect();
            let in_flight: HashSet<u64> = in_flight.into_iter().collect();
            let held_ids: HashSet<u64> = held.iter().map(|b| b.id()).collect();

            assert!(free.is_disjoint(&in_flight));
            assert!(free.is_disjoint(&held_ids));
            assert!(in_flight.is_disjoint(&held_ids));
            assert_eq!(free.len() + in_flight.len() + held_ids.len(), pool.live_count());
        }
        assert!(discarded > 0);
    }

    #[test]
    fn test_release_all_empties_pool() {
        let pool = PlayBufferPool::new(8, 2, 4);
        pool.submit(pool.acquire(), ok_enqueue).unwrap();
        let spare = pool.acquire();
        pool.recycle(spare);

        pool.release_all();
        assert_eq!(pool.in_flight_count(), 0);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.live_count(), 0);
    }
}
