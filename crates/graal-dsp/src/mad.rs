//! Hartley-domain multiply-accumulate (MAD)
//!
//! A sweep multiplies every filter partition with the input history bin of
//! matching age and sums the products. Partition `p` always lands in
//! partial sum `p % accum_loops`; [`MadEngine::mad_tail`] folds the partials
//! together by pairwise halving. The summation order is fixed, so two runs
//! over the same history produce identical bits.
//!
//! `history_shift` maps a partition to its history bin: partition `p` reads
//! the bin `p - history_shift` steps back from the most recent one.

use std::ops::Range;

use graal_core::{add_into, GraalResult, Sample};

use crate::bins::{BinArena, HistoryRing};

/// `acc += X ⊛ Y` in the Hartley domain, natural order.
///
/// Same identity as the inverse routine of the kernel bank; the result is
/// scaled by `2N` like every other Hartley-domain product.
#[inline]
pub fn mad_accumulate(acc: &mut [Sample], x: &[Sample], y: &[Sample]) {
    let n = acc.len();
    let half = n / 2;
    debug_assert_eq!(x.len(), n);
    debug_assert_eq!(y.len(), n);

    acc[0] += x[0] * y[0] * 2.0;
    acc[half] += x[half] * y[half] * 2.0;

    for k in 1..half {
        let j = n - k;
        let y_sum = y[k] + y[j];
        let y_diff = y[k] - y[j];
        acc[k] += x[k] * y_sum + x[j] * y_diff;
        acc[j] += x[j] * y_sum - x[k] * y_diff;
    }
}

/// Accumulate one input bin against two filters at once
#[inline]
fn mad_accumulate_dual(
    acc_new: &mut [Sample],
    acc_old: &mut [Sample],
    x: &[Sample],
    y_new: &[Sample],
    y_old: &[Sample],
) {
    let n = x.len();
    let half = n / 2;

    acc_new[0] += x[0] * y_new[0] * 2.0;
    acc_new[half] += x[half] * y_new[half] * 2.0;
    acc_old[0] += x[0] * y_old[0] * 2.0;
    acc_old[half] += x[half] * y_old[half] * 2.0;

    for k in 1..half {
        let j = n - k;
        let (xk, xj) = (x[k], x[j]);

        let sum = y_new[k] + y_new[j];
        let diff = y_new[k] - y_new[j];
        acc_new[k] += xk * sum + xj * diff;
        acc_new[j] += xj * sum - xk * diff;

        let sum = y_old[k] + y_old[j];
        let diff = y_old[k] - y_old[j];
        acc_old[k] += xk * sum + xj * diff;
        acc_old[j] += xj * sum - xk * diff;
    }
}

/// Work split of a tail sweep over several scheduling cycles.
///
/// Each call to [`next_chunk`](Self::next_chunk) takes
/// `ceil(remaining / cycles_left)` partitions, so the sweep ends exactly on
/// the last cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DividedSweep {
    next: usize,
    remaining: usize,
    cycles_left: usize,
}

impl DividedSweep {
    pub fn start(parts: Range<usize>, cycles: usize) -> Self {
        Self {
            next: parts.start,
            remaining: parts.len(),
            cycles_left: cycles.max(1),
        }
    }

    /// Partitions to process on this cycle
    pub fn next_chunk(&mut self) -> Range<usize> {
        if self.remaining == 0 {
            return self.next..self.next;
        }
        let count = match self.cycles_left {
            0 | 1 => self.remaining,
            left => self.remaining.div_ceil(left),
        };
        self.cycles_left = self.cycles_left.saturating_sub(1);
        self.take(count)
    }

    /// Everything not processed yet
    pub fn finish(&mut self) -> Range<usize> {
        self.cycles_left = 0;
        self.take(self.remaining)
    }

    fn take(&mut self, count: usize) -> Range<usize> {
        let chunk = self.next..self.next + count;
        self.next += count;
        self.remaining -= count;
        chunk
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

/// Partial-sum accumulators for one stream of one channel
#[derive(Debug, Clone)]
pub struct MadEngine {
    partials: BinArena,
}

impl MadEngine {
    /// `accum_loops` must be a power of two
    pub fn new(accum_loops: usize, bin_len: usize) -> GraalResult<Self> {
        debug_assert!(accum_loops.is_power_of_two());
        Ok(Self {
            partials: BinArena::new(accum_loops, bin_len)?,
        })
    }

    #[inline]
    pub fn accum_loops(&self) -> usize {
        self.partials.count()
    }

    /// Zero all partial sums
    pub fn reset(&mut self) {
        self.partials.clear();
    }

    /// Accumulate the first `accum_loops` partitions starting at `first`.
    /// Returns the partition the rest of the sweep starts from.
    pub fn mad_head(
        &mut self,
        filters: &BinArena,
        history: &HistoryRing,
        first: usize,
        history_shift: usize,
    ) -> usize {
        let end = (first + self.accum_loops()).min(filters.count());
        self.mad_range(filters, history, first..end, history_shift);
        end.max(first)
    }

    /// Accumulate partitions in `parts`
    pub fn mad_range(
        &mut self,
        filters: &BinArena,
        history: &HistoryRing,
        parts: Range<usize>,
        history_shift: usize,
    ) {
        let mask = self.accum_loops() - 1;
        for p in parts {
            debug_assert!(p >= history_shift);
            mad_accumulate(
                self.partials.bin_mut(p & mask),
                history.get(p - history_shift),
                filters.bin(p),
            );
        }
    }

    /// One cycle of a divided sweep
    pub fn mad_divided(
        &mut self,
        sweep: &mut DividedSweep,
        filters: &BinArena,
        history: &HistoryRing,
        history_shift: usize,
    ) {
        let chunk = sweep.next_chunk();
        self.mad_range(filters, history, chunk, history_shift);
    }

    /// Fold the partial sums into `tail` (log2(accum_loops) passes).
    /// The partials are consumed; call [`reset`](Self::reset) before the
    /// next sweep.
    pub fn mad_tail(&mut self, tail: &mut [Sample]) {
        let mut width = self.accum_loops();
        while width > 1 {
            let half = width / 2;
            for i in 0..half {
                let (dst, src) = self.partials.bin_pair_mut(i, i + half);
                add_into(dst, src);
            }
            width = half;
        }
        tail.copy_from_slice(self.partials.bin(0));
    }

    /// [`mad_head`](Self::mad_head) against the new and the outgoing filter
    pub fn mad_head_xfade(
        &mut self,
        old: &mut MadEngine,
        filters: &BinArena,
        old_filters: &BinArena,
        history: &HistoryRing,
        first: usize,
        history_shift: usize,
    ) -> usize {
        let end = (first + self.accum_loops()).min(filters.count());
        self.mad_range_xfade(old, filters, old_filters, history, first..end, history_shift);
        end.max(first)
    }

    pub fn mad_range_xfade(
        &mut self,
        old: &mut MadEngine,
        filters: &BinArena,
        old_filters: &BinArena,
        history: &HistoryRing,
        parts: Range<usize>,
        history_shift: usize,
    ) {
        debug_assert_eq!(self.accum_loops(), old.accum_loops());
        let mask = self.accum_loops() - 1;
        for p in parts {
            let slot = p & mask;
            mad_accumulate_dual(
                self.partials.bin_mut(slot),
                old.partials.bin_mut(slot),
                history.get(p - history_shift),
                filters.bin(p),
                old_filters.bin(p),
            );
        }
    }

    pub fn mad_divided_xfade(
        &mut self,
        old: &mut MadEngine,
        sweep: &mut DividedSweep,
        filters: &BinArena,
        old_filters: &BinArena,
        history: &HistoryRing,
        history_shift: usize,
    ) {
        let chunk = sweep.next_chunk();
        self.mad_range_xfade(old, filters, old_filters, history, chunk, history_shift);
    }

    pub fn mad_tail_xfade(
        &mut self,
        old: &mut MadEngine,
        tail: &mut [Sample],
        old_tail: &mut [Sample],
    ) {
        self.mad_tail(tail);
        old.mad_tail(old_tail);
    }
}
