//! Small signal/image filters used by the pattern and mask models.
//!
//! Boundary handling follows the "reflect" convention (`d c b a | a b c d |
//! d c b a`) unless noted otherwise.

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Maps an out-of-range index into `0..n` by mirror reflection.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    let period = 2 * n;
    let mut k = i.rem_euclid(period);
    if k >= n {
        k = period - 1 - k;
    }
    k as usize
}

/// Normalised Gaussian kernel truncated at 4 sigma.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma + 0.5) as usize;
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let d = i as f64 - radius as f64;
            (-0.5 * d * d / (sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// 1D Gaussian filter with standard deviation `sigma` in samples.
///
/// A non-positive `sigma` returns the input unchanged.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn gaussian_filter1d(y: &[f64], sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 || y.is_empty() {
        return y.to_vec();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let n = y.len();
    (0..n)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let j = i as isize + k as isize - radius;
                    w * y[reflect(j, n)]
                })
                .sum()
        })
        .collect()
}

/// 5-point Laplacian (`4·c − n − s − e − w`) with reflected borders.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn laplacian(img: ArrayView2<'_, f64>) -> Array2<f64> {
    let (h, w) = img.dim();
    let mut out = Array2::zeros((h, w));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(r, mut row)| {
            let up = reflect(r as isize - 1, h);
            let down = reflect(r as isize + 1, h);
            for c in 0..w {
                let left = reflect(c as isize - 1, w);
                let right = reflect(c as isize + 1, w);
                row[c] = 4.0 * img[[r, c]]
                    - img[[up, c]]
                    - img[[down, c]]
                    - img[[r, left]]
                    - img[[r, right]];
            }
        });
    out
}

/// Square median filter of odd side `size` with reflected borders.
///
/// NaN samples sort last and therefore only win when they dominate the window.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn median_filter(img: ArrayView2<'_, f64>, size: usize) -> Array2<f64> {
    let (h, w) = img.dim();
    let half = (size / 2) as isize;
    let mut out = Array2::zeros((h, w));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(r, mut row)| {
            let mut window = Vec::with_capacity(size * size);
            for c in 0..w {
                window.clear();
                for dr in -half..=half {
                    let rr = reflect(r as isize + dr, h);
                    for dc in -half..=half {
                        window.push(img[[rr, reflect(c as isize + dc, w)]]);
                    }
                }
                let mid = window.len() / 2;
                let (_, median, _) = window.select_nth_unstable_by(mid, f64::total_cmp);
                row[c] = *median;
            }
        });
    out
}

/// Replicates every pixel into an `n × n` block.
#[must_use]
pub fn upsample_nearest<T: Clone>(img: ArrayView2<'_, T>, n: usize) -> Array2<T> {
    let n = n.max(1);
    let (h, w) = img.dim();
    Array2::from_shape_fn((h * n, w * n), |(r, c)| img[[r / n, c / n]].clone())
}

/// Averages non-overlapping `n × n` blocks (trailing partial blocks are dropped).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn block_average(img: ArrayView2<'_, f64>, n: usize) -> Array2<f64> {
    let n = n.max(1);
    let (h, w) = img.dim();
    let area = (n * n) as f64;
    Array2::from_shape_fn((h / n, w / n), |(r, c)| {
        let mut sum = 0.0;
        for dr in 0..n {
            for dc in 0..n {
                sum += img[[r * n + dr, c * n + dc]];
            }
        }
        sum / area
    })
}

/// Keeps one sample per `n × n` block (top-left), the inverse of [`upsample_nearest`].
#[must_use]
pub fn downsample_nearest<T: Clone>(img: ArrayView2<'_, T>, n: usize) -> Array2<T> {
    let n = n.max(1);
    let (h, w) = img.dim();
    Array2::from_shape_fn((h / n, w / n), |(r, c)| img[[r * n, c * n]].clone())
}

const CROSS: [(isize, isize); 5] = [(0, 0), (-1, 0), (1, 0), (0, -1), (0, 1)];

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn neighbour(r: usize, c: usize, dr: isize, dc: isize, h: usize, w: usize) -> Option<(usize, usize)> {
    let rr = r as isize + dr;
    let cc = c as isize + dc;
    (rr >= 0 && cc >= 0 && (rr as usize) < h && (cc as usize) < w).then(|| (rr as usize, cc as usize))
}

/// Binary dilation with a 3×3 cross; pixels outside the array count as false.
#[must_use]
pub fn binary_dilation(mask: ArrayView2<'_, bool>) -> Array2<bool> {
    let (h, w) = mask.dim();
    Array2::from_shape_fn((h, w), |(r, c)| {
        CROSS.iter().any(|&(dr, dc)| {
            neighbour(r, c, dr, dc, h, w).is_some_and(|(rr, cc)| mask[[rr, cc]])
        })
    })
}

/// Binary erosion with a 3×3 cross; pixels outside the array count as false.
#[must_use]
pub fn binary_erosion(mask: ArrayView2<'_, bool>) -> Array2<bool> {
    let (h, w) = mask.dim();
    Array2::from_shape_fn((h, w), |(r, c)| {
        CROSS.iter().all(|&(dr, dc)| {
            neighbour(r, c, dr, dc, h, w).is_some_and(|(rr, cc)| mask[[rr, cc]])
        })
    })
}

/// Binary dilation with the full 3×3 square.
#[must_use]
pub fn binary_dilation_square(mask: ArrayView2<'_, bool>) -> Array2<bool> {
    let (h, w) = mask.dim();
    Array2::from_shape_fn((h, w), |(r, c)| {
        (-1..=1).any(|dr| {
            (-1..=1).any(|dc| neighbour(r, c, dr, dc, h, w).is_some_and(|p| mask[p]))
        })
    })
}
