//! Size-specialised radix-2 FHT kernels
//!
//! Each supported size gets its own monomorphised kernel so the stage loops
//! are fully bounded at compile time. The kernel is looked up once when a
//! plan is built and called through a plain `fn` pointer afterwards.
//!
//! Input is expected in bit-reversed order; output is the natural-order
//! Hartley spectrum `H[k] = Σ x[n]·cas(2πnk/N)`.

use graal_core::Sample;

use super::tables::SinCos;

/// In-place transform over a bit-reversed buffer of the kernel's size
pub type FhtKernel = fn(&[SinCos], &mut [Sample]);

/// Transform sizes with a dedicated kernel
pub const SUPPORTED_SIZES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

static KERNELS: [(usize, FhtKernel); 9] = [
    (16, fht_kernel::<16> as FhtKernel),
    (32, fht_kernel::<32> as FhtKernel),
    (64, fht_kernel::<64> as FhtKernel),
    (128, fht_kernel::<128> as FhtKernel),
    (256, fht_kernel::<256> as FhtKernel),
    (512, fht_kernel::<512> as FhtKernel),
    (1024, fht_kernel::<1024> as FhtKernel),
    (2048, fht_kernel::<2048> as FhtKernel),
    (4096, fht_kernel::<4096> as FhtKernel),
];

/// Kernel for `n`, or `None` if the size is unsupported
pub fn kernel_for(n: usize) -> Option<FhtKernel> {
    KERNELS
        .iter()
        .find(|(size, _)| *size == n)
        .map(|&(_, kernel)| kernel)
}

fn fht_kernel<const N: usize>(twiddles: &[SinCos], buf: &mut [Sample]) {
    debug_assert!(buf.len() >= N);
    debug_assert!(twiddles.len() >= N / 2);
    let buf = &mut buf[..N];

    first_two_stages(buf);

    let mut half = 4;
    while half < N {
        butterfly_stage::<N>(twiddles, buf, half);
        half <<= 1;
    }
}

/// Stages with half-size 1 and 2 need no twiddles: fused radix-4 pass.
#[inline(always)]
fn first_two_stages(buf: &mut [Sample]) {
    for quad in buf.chunks_exact_mut(4) {
        let a0 = quad[0] + quad[1];
        let a1 = quad[0] - quad[1];
        let a2 = quad[2] + quad[3];
        let a3 = quad[2] - quad[3];
        quad[0] = a0 + a2;
        quad[2] = a0 - a2;
        quad[1] = a1 + a3;
        quad[3] = a1 - a3;
    }
}

/// Combine pairs of length-`half` sub-transforms into length `2 * half`.
///
/// `ang = 0` and `ang = π/2` are special-cased; the general angles are
/// processed as mirrored pairs `(k, half - k)` so the update stays in place.
#[inline(always)]
fn butterfly_stage<const N: usize>(twiddles: &[SinCos], buf: &mut [Sample], half: usize) {
    let span = half * 2;
    let quarter = half / 2;
    let stride = N / span;

    for block in buf.chunks_exact_mut(span) {
        let (even, odd) = block.split_at_mut(half);

        // ang = 0
        let (e, o) = (even[0], odd[0]);
        even[0] = e + o;
        odd[0] = e - o;

        // ang = π/2
        let (e, o) = (even[quarter], odd[quarter]);
        even[quarter] = e + o;
        odd[quarter] = e - o;

        for k in 1..quarter {
            let j = half - k;
            let SinCos { sin, cos } = twiddles[k * stride];

            let ok = odd[k];
            let oj = odd[j];
            let t1 = cos * ok + sin * oj;
            let t2 = sin * ok - cos * oj;

            let ek = even[k];
            let ej = even[j];
            even[k] = ek + t1;
            odd[k] = ek - t1;
            even[j] = ej + t2;
            odd[j] = ej - t2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tables::{bitreverse_table, sincos_table};
    use super::*;

    /// O(N²) Hartley transform in double precision
    fn dht_reference(x: &[f64]) -> Vec<f64> {
        let n = x.len();
        let step = std::f64::consts::TAU / n as f64;
        (0..n)
            .map(|k| {
                x.iter()
                    .enumerate()
                    .map(|(i, &v)| {
                        let a = step * ((i * k) % n) as f64;
                        v * (a.cos() + a.sin())
                    })
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_kernel_lookup() {
        for &n in &SUPPORTED_SIZES {
            assert!(kernel_for(n).is_some(), "missing kernel for {n}");
        }
        assert!(kernel_for(8).is_none());
        assert!(kernel_for(100).is_none());
        assert!(kernel_for(8192).is_none());
    }

    #[test]
    fn test_kernel_matches_reference_dht() {
        for &n in &[16usize, 32, 64, 256] {
            let input: Vec<f64> = (0..n).map(|i| ((i * 7 + 3) % 11) as f64 - 5.0).collect();
            let expected = dht_reference(&input);

            let twiddles = sincos_table(n);
            let bitrev = bitreverse_table(n);
            let mut buf = vec![0.0 as Sample; n];
            for (i, &v) in input.iter().enumerate() {
                buf[bitrev[i] as usize] = v as Sample;
            }
            kernel_for(n).unwrap()(&twiddles, &mut buf);

            let peak = expected.iter().fold(1.0_f64, |m, v| m.max(v.abs()));
            for k in 0..n {
                assert!(
                    (buf[k] as f64 - expected[k]).abs() < 1e-5 * peak * n as f64,
                    "N={n} k={k}: {} vs {}",
                    buf[k],
                    expected[k]
                );
            }
        }
    }

    #[test]
    fn test_impulse_transforms_to_constant() {
        let n = 64;
        let twiddles = sincos_table(n);
        let mut buf = vec![0.0 as Sample; n];
        // bit-reversed position of index 0 is 0
        buf[0] = 1.0;
        kernel_for(n).unwrap()(&twiddles, &mut buf);
        for &v in &buf {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }
}
