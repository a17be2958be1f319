//! Sin/cos and bit-reversal tables
//!
//! Built once per transform size and shared read-only by every channel.

use graal_core::Sample;

/// One twiddle entry for angle `k * 2π / N`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SinCos {
    pub sin: Sample,
    pub cos: Sample,
}

/// `N / 2` twiddles for `k = 0..N/2`, computed in double precision
pub fn sincos_table(n: usize) -> Vec<SinCos> {
    let step = std::f64::consts::TAU / n as f64;
    (0..n / 2)
        .map(|k| {
            let (sin, cos) = (step * k as f64).sin_cos();
            SinCos {
                sin: sin as Sample,
                cos: cos as Sample,
            }
        })
        .collect()
}

/// Reverse the lowest `bits` bits of `index`
#[inline]
pub fn bit_reverse(index: usize, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    index.reverse_bits() >> (usize::BITS - bits)
}

/// Natural -> bit-reversed index permutation of `0..n`
pub fn bitreverse_table(n: usize) -> Vec<u32> {
    let bits = n.trailing_zeros();
    (0..n).map(|i| bit_reverse(i, bits) as u32).collect()
}
