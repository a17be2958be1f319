//! Filter partitioning
//!
//! Splits an impulse response into block-sized chunks and primes each chunk
//! into a Hartley-domain bin (`chunk` followed by a zero block). A
//! [`FilterBank`] is immutable once built; new responses always produce a
//! new bank, so the one being convolved is never touched.

use graal_core::{ConvolutionMode, GraalError, GraalResult, Sample};

use crate::bins::BinArena;
use crate::fht::FhtPlan;

/// Partition geometry shared by every filter of one scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    /// Stream-1 block size
    pub block_size: usize,
    /// Stream-2 block size / stream-1 block size (1 in uniform mode)
    pub ratio: usize,
    /// Impulse response capacity
    pub kernel_length: usize,
    pub mode: ConvolutionMode,
}

impl PartitionLayout {
    pub fn new(
        block_size: usize,
        kernel_length: usize,
        mode: ConvolutionMode,
        ratio: usize,
    ) -> GraalResult<Self> {
        if kernel_length == 0 {
            return Err(GraalError::InvalidParam("kernel_length must be > 0".into()));
        }
        let ratio = match mode {
            ConvolutionMode::Uniform => 1,
            ConvolutionMode::NonUniform => ratio,
        };
        if ratio == 0 || !ratio.is_power_of_two() {
            return Err(GraalError::InvalidMultiplier(ratio));
        }
        Ok(Self {
            block_size,
            ratio,
            kernel_length,
            mode,
        })
    }

    /// Stream-2 block size
    #[inline]
    pub fn coarse_block_size(&self) -> usize {
        self.block_size * self.ratio
    }

    /// `ceil(kernel_length / block_size)`
    #[inline]
    pub fn fine_blocks(&self) -> usize {
        self.kernel_length.div_ceil(self.block_size)
    }

    /// Stream-1 partitions. In two-stream mode stream 1 only covers the first
    /// coarse block of the response; the coarse stream handles the rest.
    pub fn stream1_partitions(&self) -> usize {
        match self.mode {
            ConvolutionMode::Uniform => self.fine_blocks(),
            ConvolutionMode::NonUniform => self.fine_blocks().min(self.ratio),
        }
    }

    /// Stream-2 partitions, `ceil(kernel_length / coarse_block_size)`.
    /// Partition 0 overlaps stream 1 and stays zero.
    pub fn stream2_partitions(&self) -> usize {
        match self.mode {
            ConvolutionMode::Uniform => 0,
            ConvolutionMode::NonUniform => self.kernel_length.div_ceil(self.coarse_block_size()),
        }
    }

    /// Whether the coarse stream contributes anything
    #[inline]
    pub fn has_stream2(&self) -> bool {
        self.stream2_partitions() > 1
    }

    /// Blocks of silence needed to drain every nonzero history bin
    pub fn tail_blocks(&self) -> usize {
        self.fine_blocks() + 2 * self.ratio
    }
}

/// Split `ir` into `partitions` chunks of `plan.half()` samples and prime
/// each into its own bin. Chunks past the end of `ir` are all-zero.
pub fn partition_and_transform(
    plan: &FhtPlan,
    ir: &[Sample],
    partitions: usize,
) -> GraalResult<BinArena> {
    let half = plan.half();
    let mut arena = BinArena::new(partitions, plan.size())?;
    for p in 0..partitions {
        let start = (p * half).min(ir.len());
        let end = ((p + 1) * half).min(ir.len());
        let bin = arena.bin_mut(p);
        if start == end {
            bin.fill(0.0);
        } else {
            plan.direct_from_block(bin, &ir[start..end]);
        }
    }
    Ok(arena)
}

/// Hartley-domain partitions of one impulse response
#[derive(Debug)]
pub struct FilterBank {
    stream1: BinArena,
    stream2: Option<BinArena>,
    ir_length: usize,
}

impl FilterBank {
    /// Partition `ir` for `layout`. Responses longer than the layout's
    /// kernel length are truncated.
    pub fn prepare(
        layout: &PartitionLayout,
        fine: &FhtPlan,
        coarse: Option<&FhtPlan>,
        ir: &[Sample],
    ) -> GraalResult<Self> {
        if fine.half() != layout.block_size {
            return Err(GraalError::BufferMismatch(format!(
                "stream-1 plan size {} does not match block size {}",
                fine.size(),
                layout.block_size
            )));
        }

        let ir = if ir.len() > layout.kernel_length {
            log::warn!(
                "Impulse response of {} samples clamped to {}",
                ir.len(),
                layout.kernel_length
            );
            &ir[..layout.kernel_length]
        } else {
            ir
        };

        let stream1 = partition_and_transform(fine, ir, layout.stream1_partitions())?;

        let stream2 = if layout.has_stream2() {
            let coarse = coarse.ok_or_else(|| {
                GraalError::InvalidParam("two-stream layout needs a stream-2 plan".into())
            })?;
            if coarse.half() != layout.coarse_block_size() {
                return Err(GraalError::BufferMismatch(format!(
                    "stream-2 plan size {} does not match coarse block size {}",
                    coarse.size(),
                    layout.coarse_block_size()
                )));
            }
            let mut bins = partition_and_transform(coarse, ir, layout.stream2_partitions())?;
            bins.bin_mut(0).fill(0.0);
            Some(bins)
        } else {
            None
        };

        log::debug!(
            "Filter bank prepared: {} samples, {} + {} partitions",
            ir.len(),
            stream1.count(),
            stream2.as_ref().map_or(0, BinArena::count)
        );

        Ok(Self {
            stream1,
            stream2,
            ir_length: ir.len(),
        })
    }

    #[inline]
    pub fn stream1(&self) -> &BinArena {
        &self.stream1
    }

    #[inline]
    pub fn stream2(&self) -> Option<&BinArena> {
        self.stream2.as_ref()
    }

    /// Response length after clamping
    #[inline]
    pub fn ir_length(&self) -> usize {
        self.ir_length
    }
}
