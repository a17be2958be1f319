//! Bin storage
//!
//! Every Hartley-domain buffer lives in a [`BinArena`]: one contiguous
//! allocation addressed by bin index. [`HistoryRing`] layers the circular
//! history of transformed input blocks on top of an arena, and
//! [`InputQueue`] keeps the rolling time-domain input blocks.

use graal_core::{try_alloc_zeroed, GraalResult, Sample};

/// Fixed number of equally sized bins in one allocation
#[derive(Debug, Clone)]
pub struct BinArena {
    data: Vec<Sample>,
    bin_len: usize,
    count: usize,
}

impl BinArena {
    /// Zeroed arena of `count` bins of `bin_len` samples
    pub fn new(count: usize, bin_len: usize) -> GraalResult<Self> {
        Ok(Self {
            data: try_alloc_zeroed(count * bin_len, "bin arena")?,
            bin_len,
            count,
        })
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn bin_len(&self) -> usize {
        self.bin_len
    }

    #[inline]
    pub fn bin(&self, index: usize) -> &[Sample] {
        let start = index * self.bin_len;
        &self.data[start..start + self.bin_len]
    }

    #[inline]
    pub fn bin_mut(&mut self, index: usize) -> &mut [Sample] {
        let start = index * self.bin_len;
        &mut self.data[start..start + self.bin_len]
    }

    /// Two distinct bins, the first mutable
    pub fn bin_pair_mut(&mut self, dst: usize, src: usize) -> (&mut [Sample], &[Sample]) {
        debug_assert_ne!(dst, src);
        let len = self.bin_len;
        if dst < src {
            let (lo, hi) = self.data.split_at_mut(src * len);
            (&mut lo[dst * len..(dst + 1) * len], &hi[..len])
        } else {
            let (lo, hi) = self.data.split_at_mut(dst * len);
            (&mut hi[..len], &lo[src * len..(src + 1) * len])
        }
    }

    /// Consecutive bins `first..first + n` as one slice
    #[inline]
    pub fn span(&self, first: usize, n: usize) -> &[Sample] {
        &self.data[first * self.bin_len..(first + n) * self.bin_len]
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }
}

/// Circular history of transformed input bins.
///
/// The write slot is a pure function of the run counter
/// (`run % capacity`); offset 0 is always the most recent bin.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    arena: BinArena,
    current: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize, bin_len: usize) -> GraalResult<Self> {
        Ok(Self {
            arena: BinArena::new(capacity.max(1), bin_len)?,
            current: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.count()
    }

    #[inline]
    pub fn bin_len(&self) -> usize {
        self.arena.bin_len()
    }

    #[inline]
    fn slot_for(&self, run: u64) -> usize {
        (run % self.capacity() as u64) as usize
    }

    /// Make slot `run % capacity` current and hand it out for writing.
    /// The oldest entry is overwritten.
    pub fn advance(&mut self, run: u64) -> &mut [Sample] {
        self.current = self.slot_for(run);
        self.arena.bin_mut(self.current)
    }

    /// Copy `bin` into the next slot
    pub fn push(&mut self, run: u64, bin: &[Sample]) {
        self.advance(run).copy_from_slice(bin);
    }

    /// Bin `offset` steps back from the most recent one
    #[inline]
    pub fn get(&self, offset: usize) -> &[Sample] {
        let cap = self.capacity();
        debug_assert!(offset < cap);
        let slot = (self.current + cap - offset % cap) % cap;
        self.arena.bin(slot)
    }

    /// Most recent bin
    #[inline]
    pub fn latest(&self) -> &[Sample] {
        self.arena.bin(self.current)
    }

    pub fn clear(&mut self) {
        self.arena.clear();
    }
}

/// Rolling queue of time-domain input blocks.
///
/// Holds two coarse periods (`2 * ratio` blocks) so both the current and
/// the previous coarse block are contiguous when stream 2 needs them.
#[derive(Debug, Clone)]
pub struct InputQueue {
    arena: BinArena,
    ratio: usize,
}

impl InputQueue {
    pub fn new(block_size: usize, ratio: usize) -> GraalResult<Self> {
        Ok(Self {
            arena: BinArena::new(2 * ratio, block_size)?,
            ratio,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arena.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, run: u64) -> usize {
        (run % self.len() as u64) as usize
    }

    /// Store the block for `run`
    pub fn write(&mut self, run: u64, block: &[Sample]) {
        let slot = self.slot(run);
        self.arena.bin_mut(slot).copy_from_slice(block);
    }

    /// Store a silent block for `run`
    pub fn write_silence(&mut self, run: u64) {
        let slot = self.slot(run);
        self.arena.bin_mut(slot).fill(0.0);
    }

    /// Block written for `run`
    #[inline]
    pub fn block(&self, run: u64) -> &[Sample] {
        self.arena.bin(self.slot(run))
    }

    /// Block written for `run - 1` (silence before the first block)
    #[inline]
    pub fn previous(&self, run: u64) -> &[Sample] {
        self.arena.bin(self.slot(run + self.len() as u64 - 1))
    }

    /// Coarse block containing `run` and the one before it, each
    /// `ratio * block_size` samples long.
    pub fn coarse_pair(&self, run: u64) -> (&[Sample], &[Sample]) {
        let coarse = run / self.ratio as u64;
        let current = (coarse % 2) as usize * self.ratio;
        let previous = self.ratio - current;
        (
            self.arena.span(current, self.ratio),
            self.arena.span(previous, self.ratio),
        )
    }

    pub fn clear(&mut self) {
        self.arena.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_bins_are_disjoint() {
        let mut arena = BinArena::new(3, 4).unwrap();
        arena.bin_mut(1).fill(1.0);
        assert_eq!(arena.bin(0), &[0.0; 4]);
        assert_eq!(arena.bin(1), &[1.0; 4]);
        assert_eq!(arena.bin(2), &[0.0; 4]);

        let (dst, src) = arena.bin_pair_mut(2, 1);
        dst.copy_from_slice(src);
        assert_eq!(arena.bin(2), &[1.0; 4]);

        let (dst, src) = arena.bin_pair_mut(0, 2);
        dst[0] = src[0] + 1.0;
        assert_eq!(arena.bin(0)[0], 2.0);
    }

    #[test]
    fn test_history_most_recent_is_offset_zero() {
        let mut ring = HistoryRing::new(4, 2).unwrap();
        for run in 0..6u64 {
            ring.push(run, &[run as Sample, 0.0]);
        }
        // Last written: 5, then 4, 3, 2
        assert_eq!(ring.get(0)[0], 5.0);
        assert_eq!(ring.get(1)[0], 4.0);
        assert_eq!(ring.get(2)[0], 3.0);
        assert_eq!(ring.get(3)[0], 2.0);
        assert_eq!(ring.latest()[0], 5.0);
    }

    #[test]
    fn test_history_slot_follows_run_counter() {
        let mut ring = HistoryRing::new(3, 1).unwrap();
        ring.advance(7)[0] = 1.0;
        // 7 % 3 == 1
        assert_eq!(ring.arena.bin(1)[0], 1.0);
        assert_eq!(ring.get(0)[0], 1.0);
    }

    #[test]
    fn test_input_queue_previous_block() {
        let mut queue = InputQueue::new(2, 1).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.previous(0), &[0.0, 0.0]);

        queue.write(0, &[1.0, 1.0]);
        queue.write(1, &[2.0, 2.0]);
        assert_eq!(queue.block(1), &[2.0, 2.0]);
        assert_eq!(queue.previous(1), &[1.0, 1.0]);

        queue.write(2, &[3.0, 3.0]);
        assert_eq!(queue.previous(2), &[2.0, 2.0]);
    }

    #[test]
    fn test_input_queue_coarse_pair() {
        // 2 samples per block, ratio 2 -> coarse block of 4
        let mut queue = InputQueue::new(2, 2).unwrap();
        for run in 0..4u64 {
            let v = run as Sample;
            queue.write(run, &[v, v]);
        }
        let (current, previous) = queue.coarse_pair(3);
        assert_eq!(current, &[2.0, 2.0, 3.0, 3.0]);
        assert_eq!(previous, &[0.0, 0.0, 1.0, 1.0]);

        for run in 4..6u64 {
            let v = run as Sample;
            queue.write(run, &[v, v]);
        }
        let (current, previous) = queue.coarse_pair(5);
        assert_eq!(current, &[4.0, 4.0, 5.0, 5.0]);
        assert_eq!(previous, &[2.0, 2.0, 3.0, 3.0]);
    }
}
