//! 1D and 2D interpolation on sorted grids.

use ndarray::{Array2, ArrayView2};

use crate::{Error, Result};

/// `n` evenly spaced samples over `[start, end]` (both ends included).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Index of the interval `[xp[i], xp[i + 1]]` containing `x`.
///
/// `xp` must be sorted ascending with at least two entries; values outside
/// the grid map to the first or last interval.
fn interval(xp: &[f64], x: f64) -> usize {
    let upper = xp.partition_point(|&v| v <= x);
    upper.saturating_sub(1).min(xp.len() - 2)
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`.
///
/// Values left of `xp[0]` take `fp[0]`, values right of the grid take the
/// last sample.
#[must_use]
pub fn interp_linear(x: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    x.iter().map(|&v| interp_linear_at(v, xp, fp)).collect()
}

/// Single-point form of [`interp_linear`].
#[must_use]
pub fn interp_linear_at(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    match xp.len() {
        0 => f64::NAN,
        1 => fp[0],
        n => {
            if x <= xp[0] {
                return fp[0];
            }
            if x >= xp[n - 1] {
                return fp[n - 1];
            }
            let i = interval(xp, x);
            let span = xp[i + 1] - xp[i];
            if span <= 0.0 {
                return fp[i];
            }
            let t = (x - xp[i]) / span;
            fp[i] + t * (fp[i + 1] - fp[i])
        }
    }
}

/// Natural cubic spline through a set of strictly increasing knots.
#[derive(Debug, Clone)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the knots.
    m: Vec<f64>,
}

impl CubicSpline {
    /// Builds a spline with zero curvature at both ends.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for mismatched lengths, fewer than two
    /// knots, or knots that are not strictly increasing.
    pub fn natural(x: &[f64], y: &[f64]) -> Result<Self> {
        if x.len() != y.len() {
            return Err(Error::InvalidParameter(format!(
                "spline knots: {} x values vs {} y values",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(Error::InvalidParameter(
                "spline needs at least two knots".into(),
            ));
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::InvalidParameter(
                "spline knots must be strictly increasing".into(),
            ));
        }

        let n = x.len();
        let mut m = vec![0.0; n];
        if n > 2 {
            // Thomas algorithm on the interior second derivatives.
            let inner = n - 2;
            let mut diag = vec![0.0; inner];
            let mut upper = vec![0.0; inner];
            let mut rhs = vec![0.0; inner];
            for k in 0..inner {
                let i = k + 1;
                let h0 = x[i] - x[i - 1];
                let h1 = x[i + 1] - x[i];
                diag[k] = 2.0 * (h0 + h1);
                upper[k] = h1;
                rhs[k] = 6.0 * ((y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0);
            }
            for k in 1..inner {
                let lower = x[k + 1] - x[k];
                let w = lower / diag[k - 1];
                diag[k] -= w * upper[k - 1];
                rhs[k] -= w * rhs[k - 1];
            }
            m[inner] = rhs[inner - 1] / diag[inner - 1];
            for k in (0..inner - 1).rev() {
                m[k + 1] = (rhs[k] - upper[k] * m[k + 2]) / diag[k];
            }
        }

        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            m,
        })
    }

    /// Evaluates the spline; outside the knot range the end cubic is extended.
    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        let i = interval(&self.x, x);
        let h = self.x[i + 1] - self.x[i];
        let a = (self.x[i + 1] - x) / h;
        let b = (x - self.x[i]) / h;
        a * self.y[i]
            + b * self.y[i + 1]
            + ((a * a * a - a) * self.m[i] + (b * b * b - b) * self.m[i + 1]) * h * h / 6.0
    }

    /// Evaluates the spline at every point of `x`.
    #[must_use]
    pub fn eval_many(&self, x: &[f64]) -> Vec<f64> {
        x.iter().map(|&v| self.eval(v)).collect()
    }
}

/// Bilinear resampling of `values[row = y, col = x]` onto a new grid.
///
/// Grid axes must be ascending. Points outside the source grid take
/// `fill`. Returns an array shaped `(y_new.len(), x_new.len())`.
///
/// # Errors
/// Returns `DimensionMismatch` when `values` does not match the axes.
pub fn interp2d_linear(
    x: &[f64],
    y: &[f64],
    values: ArrayView2<'_, f64>,
    x_new: &[f64],
    y_new: &[f64],
    fill: f64,
) -> Result<Array2<f64>> {
    if values.dim() != (y.len(), x.len()) {
        return Err(Error::DimensionMismatch {
            what: "interpolation grid",
            expected: (y.len(), x.len()),
            actual: values.dim(),
        });
    }
    let mut out = Array2::from_elem((y_new.len(), x_new.len()), fill);
    if x.len() < 2 || y.len() < 2 {
        return Ok(out);
    }
    let (x_lo, x_hi) = (x[0], x[x.len() - 1]);
    let (y_lo, y_hi) = (y[0], y[y.len() - 1]);

    // Column lookups are shared by every output row.
    let columns: Vec<Option<(usize, f64)>> = x_new
        .iter()
        .map(|&xv| {
            (xv >= x_lo && xv <= x_hi).then(|| {
                let j = interval(x, xv);
                (j, (xv - x[j]) / (x[j + 1] - x[j]))
            })
        })
        .collect();

    for (r, &yv) in y_new.iter().enumerate() {
        if yv < y_lo || yv > y_hi {
            continue;
        }
        let i = interval(y, yv);
        let ty = (yv - y[i]) / (y[i + 1] - y[i]);
        for (c, column) in columns.iter().enumerate() {
            let Some((j, tx)) = *column else { continue };
            let v00 = values[[i, j]];
            let v01 = values[[i, j + 1]];
            let v10 = values[[i + 1, j]];
            let v11 = values[[i + 1, j + 1]];
            out[[r, c]] = (1.0 - ty) * ((1.0 - tx) * v00 + tx * v01)
                + ty * ((1.0 - tx) * v10 + tx * v11);
        }
    }
    Ok(out)
}
