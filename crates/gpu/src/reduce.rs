// Copyright 2025-2026 Aurora Radar Group

//! Block-wide complex sum, the way the device does it: tree reduction
//! halving the row with a barrier per step until one warp remains, then
//! warp-synchronous shuffle-down for the last five steps.
//!
//! Hardware shuffle moves 32-bit lanes and a complex sample is 64 bits, so
//! the warp tail splits the value into its two float lanes, exchanges each,
//! and recombines. Out-of-range shuffle reads return the caller's own lane;
//! only lane 0's result is used.

use num_complex::Complex32;

pub const WARP_SIZE: usize = 32;

#[inline]
fn shfl_down(lanes: &[f32; WARP_SIZE], lane: usize, offset: usize) -> f32 {
    let src = lane + offset;
    if src < WARP_SIZE {
        lanes[src]
    } else {
        lanes[lane]
    }
}

/// Unrolled final-warp reduction over split float lanes. No barriers: the
/// warp executes in lockstep, which the snapshot-then-add models.
fn warp_reduce(mut re: [f32; WARP_SIZE], mut im: [f32; WARP_SIZE]) -> Complex32 {
    let mut offset = WARP_SIZE / 2;
    while offset > 0 {
        let re_prev = re;
        let im_prev = im;
        for lane in 0..WARP_SIZE {
            re[lane] = re_prev[lane] + shfl_down(&re_prev, lane, offset);
            im[lane] = im_prev[lane] + shfl_down(&im_prev, lane, offset);
        }
        offset /= 2;
    }
    Complex32::new(re[0], im[0])
}

/// Sum a power-of-two row of a shared tile in place, returning the total.
///
/// The row is clobbered below its midpoint, exactly as the shared-memory
/// tile is on the device.
pub fn block_reduce_row(row: &mut [Complex32]) -> Complex32 {
    debug_assert!(row.len().is_power_of_two());
    debug_assert!(row.len() >= 1);

    let mut n = row.len();
    while n > WARP_SIZE {
        n /= 2;
        for i in 0..n {
            let upper = row[i + n];
            row[i] += upper;
        }
        // __syncthreads() between halving steps.
    }

    // Hand the surviving width to warp registers; dead lanes carry zero.
    let mut re = [0.0f32; WARP_SIZE];
    let mut im = [0.0f32; WARP_SIZE];
    for lane in 0..n {
        re[lane] = row[lane].re;
        im[lane] = row[lane].im;
    }
    warp_reduce(re, im)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_sum(row: &[Complex32]) -> Complex32 {
        row.iter().sum()
    }

    fn test_row(n: usize) -> Vec<Complex32> {
        (0..n)
            .map(|i| {
                let x = (i as f32 * 0.37).sin();
                let y = (i as f32 * 0.73).cos();
                Complex32::new(x, y)
            })
            .collect()
    }

    #[test]
    fn test_matches_naive_for_all_widths() {
        for shift in 2..=10 {
            let n = 1usize << shift; // 4 .. 1024
            let row = test_row(n);
            let expected = naive_sum(&row);
            let mut scratch = row.clone();
            let got = block_reduce_row(&mut scratch);
            assert!(
                (got - expected).norm() < 1e-3,
                "width {}: {} vs {}",
                n,
                got,
                expected
            );
        }
    }

    #[test]
    fn test_sub_warp_widths() {
        for n in [4usize, 8, 16] {
            let row = test_row(n);
            let mut scratch = row.clone();
            let got = block_reduce_row(&mut scratch);
            assert!((got - naive_sum(&row)).norm() < 1e-4, "width {}", n);
        }
    }

    #[test]
    fn test_zero_row_sums_to_zero() {
        let mut row = vec![Complex32::new(0.0, 0.0); 256];
        assert_eq!(block_reduce_row(&mut row), Complex32::new(0.0, 0.0));
    }

    #[test]
    fn test_single_warp_exact() {
        let mut row = vec![Complex32::new(1.0, -1.0); 32];
        let got = block_reduce_row(&mut row);
        assert_eq!(got, Complex32::new(32.0, -32.0));
    }

    #[test]
    fn test_shfl_out_of_range_returns_own_lane() {
        let mut lanes = [0.0f32; WARP_SIZE];
        for (i, l) in lanes.iter_mut().enumerate() {
            *l = i as f32;
        }
        assert_eq!(shfl_down(&lanes, 31, 16), 31.0);
        assert_eq!(shfl_down(&lanes, 0, 16), 16.0);
    }
}
