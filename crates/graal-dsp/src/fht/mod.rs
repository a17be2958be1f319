//! Fast Hartley Transform kernel bank
//!
//! - Real-to-real Hartley transforms for N = 16..=4096
//! - Sin/cos and bit-reversal tables built once per size
//! - Fused "direct from two blocks" ingest and "inverse with multiply-add"
//!   routines used by the partitioned convolution pipeline
//!
//! The Hartley transform is its own inverse up to a factor of N, so the
//! same kernel serves both directions. Convolution results come out scaled
//! by `2N`; dividing is left to the caller ([`FhtPlan::scale`]).

mod kernels;
mod tables;

pub use kernels::{kernel_for, FhtKernel, SUPPORTED_SIZES};
pub use tables::{bit_reverse, bitreverse_table, sincos_table, SinCos};

use std::fmt;

use graal_core::{GraalError, GraalResult, Sample};

/// Tables and kernel for one transform size
pub struct FhtPlan {
    size: usize,
    sincos: Vec<SinCos>,
    bitrev: Vec<u32>,
    kernel: FhtKernel,
}

impl FhtPlan {
    /// Build tables and select the specialised kernel for `size`
    pub fn new(size: usize) -> GraalResult<Self> {
        let kernel = kernel_for(size).ok_or(GraalError::UnsupportedTransformSize(size))?;
        Ok(Self {
            size,
            sincos: sincos_table(size),
            bitrev: bitreverse_table(size),
            kernel,
        })
    }

    /// Transform length N
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Input block length N / 2
    #[inline]
    pub fn half(&self) -> usize {
        self.size / 2
    }

    /// Normalisation for convolution output (`1 / 2N`)
    #[inline]
    pub fn scale(&self) -> Sample {
        1.0 / (2 * self.size) as Sample
    }

    #[inline]
    pub fn sincos(&self) -> &[SinCos] {
        &self.sincos
    }

    #[inline]
    pub fn bitrev(&self) -> &[u32] {
        &self.bitrev
    }

    /// In-place transform of a bit-reversed buffer
    #[inline]
    pub fn transform(&self, buf: &mut [Sample]) {
        debug_assert_eq!(buf.len(), self.size);
        (self.kernel)(&self.sincos, buf);
    }

    /// Reorder `buf` between natural and bit-reversed order (self-inverse)
    pub fn bit_reverse_permute(&self, buf: &mut [Sample]) {
        debug_assert_eq!(buf.len(), self.size);
        for (i, &r) in self.bitrev.iter().enumerate() {
            let r = r as usize;
            if i < r {
                buf.swap(i, r);
            }
        }
    }

    /// Transform a natural-order buffer in place
    pub fn forward(&self, buf: &mut [Sample]) {
        self.bit_reverse_permute(buf);
        self.transform(buf);
    }

    /// Write `new_block` (first half) and `prev_block` (second half) straight
    /// into their bit-reversed slots of `out`, then transform.
    pub fn direct_from_two_blocks(
        &self,
        out: &mut [Sample],
        new_block: &[Sample],
        prev_block: &[Sample],
    ) {
        let half = self.half();
        debug_assert_eq!(out.len(), self.size);
        debug_assert_eq!(new_block.len(), half);
        debug_assert_eq!(prev_block.len(), half);

        let (rev_new, rev_prev) = self.bitrev.split_at(half);
        for (&r, &s) in rev_new.iter().zip(new_block) {
            out[r as usize] = s;
        }
        for (&r, &s) in rev_prev.iter().zip(prev_block) {
            out[r as usize] = s;
        }
        self.transform(out);
    }

    /// Same as [`direct_from_two_blocks`](Self::direct_from_two_blocks) with
    /// an all-zero previous block (filter partition priming).
    pub fn direct_from_block(&self, out: &mut [Sample], block: &[Sample]) {
        let half = self.half();
        debug_assert_eq!(out.len(), self.size);
        debug_assert!(block.len() <= half);

        out.fill(0.0);
        for (&r, &s) in self.bitrev.iter().zip(block) {
            out[r as usize] = s;
        }
        self.transform(out);
    }

    /// Hartley-domain product of `x` and `y`, plus an optional accumulated
    /// `tail` in the same domain, written in bit-reversed order and
    /// transformed back. `out` holds the circular convolution scaled by `2N`.
    pub fn inverse_mad_with_tail(
        &self,
        out: &mut [Sample],
        x: &[Sample],
        y: &[Sample],
        tail: Option<&[Sample]>,
    ) {
        let n = self.size;
        let half = n / 2;
        debug_assert_eq!(out.len(), n);
        debug_assert_eq!(x.len(), n);
        debug_assert_eq!(y.len(), n);

        let rev = &self.bitrev;
        let tail_at = |k: usize| tail.map_or(0.0, |t| t[k]);

        out[rev[0] as usize] = x[0] * y[0] * 2.0 + tail_at(0);
        out[rev[half] as usize] = x[half] * y[half] * 2.0 + tail_at(half);

        for k in 1..half {
            let j = n - k;
            let y_sum = y[k] + y[j];
            let y_diff = y[k] - y[j];
            let zk = x[k] * y_sum + x[j] * y_diff;
            let zj = x[j] * y_sum - x[k] * y_diff;
            out[rev[k] as usize] = zk + tail_at(k);
            out[rev[j] as usize] = zj + tail_at(j);
        }

        self.transform(out);
    }
}

impl fmt::Debug for FhtPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FhtPlan").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_vec(rng: &mut ChaCha8Rng, n: usize) -> Vec<Sample> {
        (0..n).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    /// O(N²) circular convolution in double precision
    fn circular_convolution(x: &[Sample], y: &[Sample]) -> Vec<f64> {
        let n = x.len();
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|m| x[m] as f64 * y[(i + n - m) % n] as f64)
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_unsupported_size() {
        assert_eq!(
            FhtPlan::new(8).unwrap_err(),
            GraalError::UnsupportedTransformSize(8)
        );
        assert!(FhtPlan::new(1000).is_err());
        assert!(FhtPlan::new(8192).is_err());
    }

    #[test]
    fn test_transform_twice_is_identity_up_to_scale() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for &n in &SUPPORTED_SIZES {
            let plan = FhtPlan::new(n).unwrap();
            let input = random_vec(&mut rng, n);

            let mut buf = input.clone();
            plan.forward(&mut buf);
            plan.forward(&mut buf);

            let peak = input.iter().fold(0.0 as Sample, |m, v| m.max(v.abs()));
            for (i, (&a, &b)) in input.iter().zip(&buf).enumerate() {
                let restored = b / n as Sample;
                assert!(
                    (restored - a).abs() <= 1e-5 * peak.max(1.0) * 4.0,
                    "N={n} i={i}: {restored} vs {a}"
                );
            }
        }
    }

    #[test]
    fn test_bit_reverse_permute_round_trip() {
        for &n in &SUPPORTED_SIZES {
            let plan = FhtPlan::new(n).unwrap();
            let original: Vec<Sample> = (0..n).map(|i| i as Sample).collect();
            let mut buf = original.clone();
            plan.bit_reverse_permute(&mut buf);
            assert_ne!(buf, original);
            plan.bit_reverse_permute(&mut buf);
            assert_eq!(buf, original);
        }
    }

    #[test]
    fn test_convolution_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for &n in &[16usize, 64, 256, 1024] {
            let plan = FhtPlan::new(n).unwrap();
            let x = random_vec(&mut rng, n);
            let y = random_vec(&mut rng, n);

            let mut hx = x.clone();
            let mut hy = y.clone();
            plan.forward(&mut hx);
            plan.forward(&mut hy);

            let mut out = vec![0.0; n];
            plan.inverse_mad_with_tail(&mut out, &hx, &hy, None);

            let expected = circular_convolution(&x, &y);
            let scale = plan.scale();
            for i in 0..n {
                let got = (out[i] * scale) as f64;
                assert!(
                    (got - expected[i]).abs() < 1e-4 * (n as f64 / 64.0).max(1.0),
                    "N={n} i={i}: {got} vs {}",
                    expected[i]
                );
            }
        }
    }

    #[test]
    fn test_inverse_adds_tail() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let n = 128;
        let plan = FhtPlan::new(n).unwrap();
        let mut hx = random_vec(&mut rng, n);
        let mut hy = random_vec(&mut rng, n);
        plan.forward(&mut hx);
        plan.forward(&mut hy);

        // Tail = same product -> result doubles
        let mut product = vec![0.0; n];
        crate::mad::mad_accumulate(&mut product, &hx, &hy);

        let mut single = vec![0.0; n];
        plan.inverse_mad_with_tail(&mut single, &hx, &hy, None);
        let mut doubled = vec![0.0; n];
        plan.inverse_mad_with_tail(&mut doubled, &hx, &hy, Some(&product));

        for i in 0..n {
            assert!((doubled[i] - 2.0 * single[i]).abs() < 1e-2, "i={i}");
        }
    }

    #[test]
    fn test_direct_from_two_blocks_matches_forward() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let n = 512;
        let plan = FhtPlan::new(n).unwrap();
        let new_block = random_vec(&mut rng, n / 2);
        let prev_block = random_vec(&mut rng, n / 2);

        let mut fused = vec![0.0; n];
        plan.direct_from_two_blocks(&mut fused, &new_block, &prev_block);

        let mut reference: Vec<Sample> = new_block.iter().chain(&prev_block).copied().collect();
        plan.forward(&mut reference);

        assert_eq!(fused, reference);
    }

    #[test]
    fn test_hartley_matches_fft() {
        use rustfft::{num_complex::Complex, FftPlanner};

        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let n = 2048;
        let plan = FhtPlan::new(n).unwrap();
        let input = random_vec(&mut rng, n);

        let mut spectrum: Vec<Complex<f64>> =
            input.iter().map(|&s| Complex::new(s as f64, 0.0)).collect();
        FftPlanner::new().plan_fft_forward(n).process(&mut spectrum);

        let mut hartley = input.clone();
        plan.forward(&mut hartley);

        // H[k] = Re(F[k]) - Im(F[k]) for F[k] = Σ x·e^{-i2πnk/N}
        for k in 0..n {
            let expected = spectrum[k].re - spectrum[k].im;
            assert!(
                (hartley[k] as f64 - expected).abs() < 5e-3,
                "k={k}: {} vs {expected}",
                hartley[k]
            );
        }
    }
}
