//! Per-channel sample stores shared between the driver callback and the
//! consumer.
//!
//! The ring is written by exactly one thread (the callback) and read by
//! another (the consumer tick). Samples live in atomics so neither side ever
//! waits on a lock; the writer publishes a running sample total and a
//! generation number after each batch, and readers derive cursor and length
//! from that single total so the pair is always consistent.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct RingBuffer {
    samples: Box<[AtomicU32]>,
    /// Total samples ever stored. Cursor and length are derived from it.
    written: AtomicU64,
    generation: AtomicU64,
}

/// A copy of the ring contents in arrival order, oldest first.
#[derive(Clone, Debug, PartialEq)]
pub struct RingSnapshot {
    pub generation: u64,
    pub cursor: usize,
    pub len: usize,
    pub samples: Vec<f32>,
    /// The writer published more data while the copy was taken; the oldest
    /// part of `samples` may already belong to a newer batch.
    pub torn: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            written: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn total_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.total_written().min(self.capacity() as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.total_written() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Appends a batch, overwriting the oldest samples once full. Only the
    /// callback thread may call this.
    ///
    /// A batch larger than the capacity keeps only its newest `capacity`
    /// samples.
    pub fn push_batch<I>(&self, batch: I)
    where
        I: IntoIterator<Item = f32>,
        I::IntoIter: ExactSizeIterator,
    {
        let batch = batch.into_iter();
        let capacity = self.capacity();
        let skip = batch.len().saturating_sub(capacity);
        let written = self.written.load(Ordering::Relaxed);
        let mut stored = 0u64;
        for sample in batch.skip(skip) {
            let slot = ((written + stored) % capacity as u64) as usize;
            self.samples[slot].store(sample.to_bits(), Ordering::Relaxed);
            stored += 1;
        }
        if stored == 0 {
            return;
        }
        self.written.store(written + stored, Ordering::Release);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Copies the current contents without blocking the writer.
    ///
    /// Returns `None` when the writer lapped the whole buffer during the copy;
    /// the caller should drop this read and try again on its next tick.
    pub fn snapshot(&self) -> Option<RingSnapshot> {
        let generation = self.generation.load(Ordering::Acquire);
        let before = self.written.load(Ordering::Acquire);
        let capacity = self.capacity() as u64;
        let len = before.min(capacity);
        let start = before - len;

        let samples = (start..before)
            .map(|i| f32::from_bits(self.samples[(i % capacity) as usize].load(Ordering::Relaxed)))
            .collect();

        let after = self.written.load(Ordering::Acquire);
        if after - before >= capacity {
            return None;
        }
        Some(RingSnapshot {
            generation,
            cursor: (before % capacity) as usize,
            len: len as usize,
            samples,
            torn: after != before,
        })
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("written", &self.total_written())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Linear store for one rapid-block capture. Owned by the callback while the
/// capture is filling, then handed off whole.
#[derive(Debug, Clone)]
pub struct BlockBuffer {
    samples: Vec<f32>,
    filled: usize,
}

impl BlockBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
            filled: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Highest sample index written so far plus one.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Writes `batch` at `offset`; anything past the end is discarded.
    /// Returns the number of samples stored.
    pub fn write_at<I>(&mut self, offset: usize, batch: I) -> usize
    where
        I: IntoIterator<Item = f32>,
    {
        if offset >= self.samples.len() {
            return 0;
        }
        let mut stored = 0;
        for (slot, sample) in self.samples[offset..].iter_mut().zip(batch) {
            *slot = sample;
            stored += 1;
        }
        self.filled = self.filled.max(offset + stored);
        stored
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_capacity_samples_in_order() {
        let ring = RingBuffer::new(5);
        for chunk in (1..=12).collect::<Vec<i32>>().chunks(3) {
            ring.push_batch(chunk.iter().map(|&v| v as f32));
        }
        let snap = ring.snapshot().unwrap();
        assert_eq!(snap.samples, vec![8.0, 9.0, 10.0, 11.0, 12.0]);
        assert_eq!(snap.len, 5);
        assert_eq!(snap.cursor, 12 % 5);
        assert_eq!(snap.generation, 4);
        assert!(!snap.torn);
    }

    #[test]
    fn oversized_batch_keeps_its_tail() {
        let ring = RingBuffer::new(4);
        ring.push_batch([1.0, 2.0]);
        ring.push_batch((10..20).map(|v| v as f32));
        assert_eq!(
            ring.snapshot().unwrap().samples,
            vec![16.0, 17.0, 18.0, 19.0]
        );
    }

    #[test]
    fn partial_fill_reports_only_valid_data() {
        let ring = RingBuffer::new(8);
        assert!(ring.is_empty());
        ring.push_batch([0.5, -0.5, 0.25]);
        let snap = ring.snapshot().unwrap();
        assert_eq!(snap.len, 3);
        assert_eq!(snap.samples, vec![0.5, -0.5, 0.25]);
        assert!(!ring.is_full());
    }

    #[test]
    fn empty_batch_does_not_bump_generation() {
        let ring = RingBuffer::new(3);
        ring.push_batch(Vec::<f32>::new());
        assert_eq!(ring.generation(), 0);
    }

    #[test]
    fn concurrent_reader_never_reads_out_of_bounds() {
        use std::sync::Arc;
        use std::thread;

        let ring = Arc::new(RingBuffer::new(64));
        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..20_000u32 {
                    ring.push_batch([i as f32, i as f32 + 0.5]);
                }
            })
        };
        let mut reads = 0;
        while !writer.is_finished() {
            if let Some(snap) = ring.snapshot() {
                assert!(snap.samples.len() <= 64);
                assert_eq!(snap.samples.len(), snap.len);
                reads += 1;
            }
        }
        writer.join().unwrap();
        let last = ring.snapshot().unwrap();
        assert_eq!(last.len, 64);
        assert_eq!(*last.samples.last().unwrap(), 19_999.5);
        assert!(reads > 0 || ring.total_written() == 40_000);
    }

    #[test]
    fn block_write_at_offsets() {
        let mut block = BlockBuffer::new(6);
        assert_eq!(block.write_at(0, [1.0, 2.0, 3.0]), 3);
        assert_eq!(block.write_at(3, [4.0, 5.0, 6.0, 7.0]), 3);
        assert_eq!(block.write_at(9, [1.0]), 0);
        assert_eq!(block.filled(), 6);
        assert_eq!(block.into_samples(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }
}
