//! Merging patterns and cakes of several configurations.

use log::debug;
use ndarray::Array2;
use rayon::prelude::*;
use xrdpix_calib::Cake;
use xrdpix_core::interp::{interp2d_linear, interp_linear, linspace};
use xrdpix_core::Pattern;

use crate::Result;

/// Name given to a merged pattern.
pub const COMBINED_PATTERN_NAME: &str = "Combined Pattern";

/// Default edge length of the combined cake grid.
pub const DEFAULT_COMBINED_CAKE_POINTS: usize = 2048;

fn sorted_by_x(x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    pairs.into_iter().unzip()
}

/// Stitches `(x, y)` onto the running `(acc_x, acc_y)`.
///
/// Points of the accumulator left of `x` stay, points inside the range of
/// `x` are averaged with the interpolated new pattern and new points right
/// of the accumulator are appended.
fn stitch(acc_x: &[f64], acc_y: &[f64], x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let (Some(&lo), Some(&hi)) = (x.first(), x.last()) else {
        return (acc_x.to_vec(), acc_y.to_vec());
    };
    let acc_max = acc_x.last().copied().unwrap_or(f64::NEG_INFINITY);

    let mut out_x = Vec::with_capacity(acc_x.len() + x.len());
    let mut out_y = Vec::with_capacity(acc_x.len() + x.len());
    for (&ax, &ay) in acc_x.iter().zip(acc_y) {
        if ax < lo {
            out_x.push(ax);
            out_y.push(ay);
        }
    }
    let overlap: Vec<usize> = (0..acc_x.len())
        .filter(|&i| acc_x[i] >= lo && acc_x[i] <= hi)
        .collect();
    let overlap_x: Vec<f64> = overlap.iter().map(|&i| acc_x[i]).collect();
    let interpolated = interp_linear(&overlap_x, x, y);
    for (&i, new_y) in overlap.iter().zip(interpolated) {
        out_x.push(acc_x[i]);
        out_y.push((acc_y[i] + new_y) / 2.0);
    }
    for (&nx, &ny) in x.iter().zip(y) {
        if nx > acc_max {
            out_x.push(nx);
            out_y.push(ny);
        }
    }
    (out_x, out_y)
}

/// Merge patterns ordered by their lowest x.
///
/// Empty patterns are ignored; with no data the result is an empty pattern.
///
/// # Errors
/// Returns the pattern constructor's error.
pub fn combine_patterns<'a>(patterns: impl IntoIterator<Item = &'a Pattern>) -> Result<Pattern> {
    let mut inputs: Vec<(Vec<f64>, Vec<f64>)> = patterns
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (x, y) = p.data();
            sorted_by_x(x, y)
        })
        .collect();
    inputs.sort_by(|a, b| a.0[0].total_cmp(&b.0[0]));

    let mut inputs = inputs.into_iter();
    let Some((mut acc_x, mut acc_y)) = inputs.next() else {
        let mut empty = Pattern::empty();
        empty.set_name(COMBINED_PATTERN_NAME);
        return Ok(empty);
    };
    for (x, y) in inputs {
        (acc_x, acc_y) = stitch(&acc_x, &acc_y, &x, &y);
    }
    debug!("combined pattern has {} points", acc_x.len());
    Ok(Pattern::new(acc_x, acc_y, COMBINED_PATTERN_NAME)?)
}

fn bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Sum of the cakes resampled onto a common `points × points` grid
/// spanning every input. Regions a cake does not cover contribute 0.
///
/// # Errors
/// Returns an interpolation error for a cake whose axes do not match its
/// intensity shape.
pub fn combine_cakes<'a>(cakes: impl IntoIterator<Item = &'a Cake>, points: usize) -> Result<Cake> {
    let cakes: Vec<&Cake> = cakes.into_iter().filter(|c| !c.is_empty()).collect();
    if cakes.is_empty() || points == 0 {
        return Ok(Cake::default());
    }
    let (tth_min, tth_max, azi_min, azi_max) = cakes.iter().fold(
        (
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::INFINITY,
            f64::NEG_INFINITY,
        ),
        |(t0, t1, a0, a1), cake| {
            let (tl, th) = bounds(&cake.tth);
            let (al, ah) = bounds(&cake.azimuth);
            (t0.min(tl), t1.max(th), a0.min(al), a1.max(ah))
        },
    );
    let tth = linspace(tth_min, tth_max, points);
    let azimuth = linspace(azi_min, azi_max, points);

    let resampled = cakes
        .par_iter()
        .map(|cake| {
            interp2d_linear(
                &cake.tth,
                &cake.azimuth,
                cake.intensity.view(),
                &tth,
                &azimuth,
                0.0,
            )
        })
        .collect::<xrdpix_core::Result<Vec<Array2<f64>>>>()?;
    let mut intensity = Array2::zeros((points, points));
    for part in &resampled {
        intensity += part;
    }
    debug!("combined {} cakes on a {points}x{points} grid", cakes.len());
    Ok(Cake {
        intensity,
        tth,
        azimuth,
    })
}
