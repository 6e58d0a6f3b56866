//! Automatic background estimation for 1D patterns.
//!
//! The estimate is a peak-stripping filter: the pattern is Gaussian
//! pre-smoothed, then repeatedly replaced by the pointwise minimum of itself
//! and a rolling local polynomial fit. Peaks narrower than the window are
//! eroded pass by pass while slowly varying background survives.

use log::debug;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::filters::gaussian_filter1d;
use crate::{Error, Result};

/// Estimates the background under `(x, y)`.
///
/// * `smooth_width` - fit window in x units; the pre-smoothing sigma is a
///   quarter of the window (in points).
/// * `iterations` - number of stripping passes.
/// * `poly_order` - order of the local polynomial.
///
/// # Errors
/// Returns `InvalidParameter` if `x` and `y` differ in length or
/// `smooth_width` is not positive.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn extract_background(
    x: &[f64],
    y: &[f64],
    smooth_width: f64,
    iterations: usize,
    poly_order: usize,
) -> Result<Vec<f64>> {
    if x.len() != y.len() {
        return Err(Error::InvalidParameter(format!(
            "background: {} x values vs {} y values",
            x.len(),
            y.len()
        )));
    }
    if !(smooth_width.is_finite() && smooth_width > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "background smooth width must be positive, got {smooth_width}"
        )));
    }
    let n = x.len();
    if n < 2 {
        return Ok(y.to_vec());
    }

    let step = (x[n - 1] - x[0]).abs() / (n - 1) as f64;
    let window = if step > 0.0 {
        ((smooth_width / step).round() as usize).clamp(1, n)
    } else {
        1
    };
    let half = window / 2;
    debug!(
        "auto background: {n} points, window {window} points, {iterations} passes, order {poly_order}"
    );

    let weights = local_fit_weights(x, half, poly_order);
    let mut bg = gaussian_filter1d(y, window as f64 / 4.0);
    for _ in 0..iterations {
        let fit: Vec<f64> = weights
            .par_iter()
            .map(|(start, w)| w.iter().zip(&bg[*start..]).map(|(wk, yk)| wk * yk).sum())
            .collect();
        for (b, f) in bg.iter_mut().zip(fit) {
            if f < *b {
                *b = f;
            }
        }
    }
    Ok(bg)
}

/// For every point, the linear weights that evaluate a least-squares
/// polynomial fit over the surrounding window at that point.
///
/// Returns `(window_start, weights)` per point.
fn local_fit_weights(x: &[f64], half: usize, poly_order: usize) -> Vec<(usize, Vec<f64>)> {
    let n = x.len();
    (0..n)
        .into_par_iter()
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(n);
            (start, point_weights(&x[start..end], x[i], poly_order))
        })
        .collect()
}

fn point_weights(xs: &[f64], centre: f64, poly_order: usize) -> Vec<f64> {
    let m = xs.len();
    let span = xs
        .iter()
        .map(|v| (v - centre).abs())
        .fold(0.0_f64, f64::max);
    let mut order = poly_order.min(m.saturating_sub(1));
    loop {
        if order == 0 || span <= 0.0 {
            return vec![1.0 / xs.len() as f64; m];
        }
        let cols = order + 1;
        // Centred and scaled abscissa keeps the normal matrix well conditioned.
        let design = DMatrix::from_fn(m, cols, |r, c| {
            let t = (xs[r] - centre) / span;
            (0..c).fold(1.0, |acc, _| acc * t)
        });
        let normal = design.transpose() * &design;
        let mut e0 = DVector::zeros(cols);
        e0[0] = 1.0;
        if let Some(v) = normal.lu().solve(&e0) {
            return (&design * v).iter().copied().collect();
        }
        order -= 1;
    }
}
