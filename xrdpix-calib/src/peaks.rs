//! Ring peak search and the circle-fit starting geometry.

use nalgebra::{Matrix3, Vector3};
use ndarray::ArrayView2;

use crate::geometry::GeometryArrays;
use crate::refinement::PickedPoint;
use crate::{Error, PoniParameters, Result};

/// Parameters of a search along one calibrant ring.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakSearchOptions {
    /// Half width of the band around the ring, 2θ degrees.
    pub delta_tth: f64,
    /// Peaks must exceed this multiple of the mean band intensity.
    pub intensity_min_factor: f64,
    /// Peaks at or above this value are rejected (saturation).
    pub intensity_max: f64,
    /// Half size of the square neighbourhood a peak must dominate.
    pub neighbourhood: usize,
}

impl Default for PeakSearchOptions {
    fn default() -> Self {
        Self {
            delta_tth: 0.1,
            intensity_min_factor: 3.0,
            intensity_max: f64::INFINITY,
            neighbourhood: 2,
        }
    }
}

impl PeakSearchOptions {
    /// Set the band half width (degrees).
    #[must_use]
    pub fn with_delta_tth(mut self, delta: f64) -> Self {
        self.delta_tth = delta;
        self
    }

    /// Set the minimum intensity factor.
    #[must_use]
    pub fn with_intensity_min_factor(mut self, factor: f64) -> Self {
        self.intensity_min_factor = factor;
        self
    }

    /// Set the saturation limit.
    #[must_use]
    pub fn with_intensity_max(mut self, max: f64) -> Self {
        self.intensity_max = max;
        self
    }
}

/// Finds local maxima within `±delta_tth` of `ring_tth` (radians).
///
/// Returned points are in the pixel coordinates of `image`, ordered by
/// decreasing intensity.
///
/// # Errors
/// Returns `DimensionMismatch` if image or mask do not match the geometry.
#[allow(clippy::cast_precision_loss)]
pub fn search_peaks_on_ring(
    arrays: &GeometryArrays,
    image: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
    ring: usize,
    ring_tth: f64,
    options: &PeakSearchOptions,
) -> Result<Vec<PickedPoint>> {
    let shape = arrays.shape();
    if image.dim() != shape {
        return Err(Error::DimensionMismatch {
            what: "image",
            expected: shape,
            actual: image.dim(),
        });
    }
    if let Some(m) = mask {
        if m.dim() != shape {
            return Err(Error::DimensionMismatch {
                what: "mask",
                expected: shape,
                actual: m.dim(),
            });
        }
    }

    let delta = options.delta_tth.to_radians();
    let tth = arrays.tth();
    let in_band = |r: usize, c: usize| {
        (tth[[r, c]] - ring_tth).abs() <= delta
            && !mask.is_some_and(|m| m[[r, c]])
            && image[[r, c]].is_finite()
    };

    let mut band = Vec::new();
    for ((r, c), v) in image.indexed_iter() {
        if in_band(r, c) {
            band.push((r, c, *v));
        }
    }
    if band.is_empty() {
        return Ok(Vec::new());
    }
    let mean = band.iter().map(|b| b.2).sum::<f64>() / band.len() as f64;
    let threshold = options.intensity_min_factor * mean;

    let (rows, cols) = shape;
    let n = options.neighbourhood;
    let mut peaks: Vec<(f64, PickedPoint)> = band
        .iter()
        .filter(|&&(_, _, v)| v > threshold && v < options.intensity_max)
        .filter(|&&(r, c, v)| {
            (r.saturating_sub(n)..(r + n + 1).min(rows)).all(|rr| {
                (c.saturating_sub(n)..(c + n + 1).min(cols)).all(|cc| {
                    let w = image[[rr, cc]];
                    // ties resolve to the first pixel in row-major order
                    (rr, cc) == (r, c)
                        || !in_band(rr, cc)
                        || w < v
                        || (w == v && (rr, cc) > (r, c))
                })
            })
        })
        .map(|&(r, c, v)| (v, PickedPoint::new(c as f64, r as f64, ring)))
        .collect();
    peaks.sort_by(|a, b| b.0.total_cmp(&a.0));
    log::debug!(
        "ring {ring}: {} band pixels, mean {mean:.3}, {} peaks",
        band.len(),
        peaks.len()
    );
    Ok(peaks.into_iter().map(|(_, p)| p).collect())
}

/// Algebraic (Kåsa) circle fit; returns `(cx, cy, radius)`.
#[must_use]
pub fn fit_circle(points: &[(f64, f64)]) -> Option<(f64, f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    // minimise Σ (x² + y² + D x + E y + F)²
    let mut ata = Matrix3::<f64>::zeros();
    let mut atb = Vector3::<f64>::zeros();
    for &(x, y) in points {
        let row = Vector3::new(x, y, 1.0);
        ata += row * row.transpose();
        atb += row * (-(x * x + y * y));
    }
    let sol = ata.lu().solve(&atb)?;
    let (cx, cy) = (-sol[0] / 2.0, -sol[1] / 2.0);
    let r2 = cx * cx + cy * cy - sol[2];
    (r2 > 0.0 && r2.is_finite()).then(|| (cx, cy, r2.sqrt()))
}

/// Untilted starting geometry from points on a ring of known 2θ (radians).
///
/// The fitted centre becomes the PONI and the fitted radius sets the
/// distance. Pixel sizes, wavelength and detector name are taken from
/// `template`.
#[must_use]
pub fn guess_geometry(
    points: &[PickedPoint],
    ring_tth: f64,
    template: &PoniParameters,
) -> Option<PoniParameters> {
    let xy: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
    let (cx, cy, r) = fit_circle(&xy)?;
    if !(ring_tth > 0.0 && ring_tth < std::f64::consts::FRAC_PI_2) {
        return None;
    }
    let pixel = (template.pixel1 * template.pixel2).sqrt();
    let distance = r * pixel / ring_tth.tan();
    Some(
        template
            .clone()
            .with_distance(distance)
            .with_poni((cy + 0.5) * template.pixel1, (cx + 0.5) * template.pixel2)
            .with_rotations(0.0, 0.0, 0.0),
    )
}
