//! Azimuthal integration of detector images into 1D patterns and 2D cakes.
//!
//! Pixels are binned by their centre coordinate (no pixel splitting). Each
//! bin holds the weighted mean `Σ I·w / Σ w` of its pixels, where `w` is the
//! relative solid angle (or 1 when solid-angle correction is off).

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use xrdpix_core::interp::interp_linear_at;
use xrdpix_core::IntegrationUnit;

use crate::geometry::GeometryArrays;
use crate::{Error, Result};

/// Default number of azimuthal bins of a cake.
pub const DEFAULT_AZIMUTH_POINTS: usize = 2048;

/// Options of a 1D integration.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationOptions {
    /// Radial unit of the output axis.
    pub unit: IntegrationUnit,
    /// Bin count; `None` picks the detector diagonal.
    pub num_points: Option<usize>,
    /// Azimuthal wedge in degrees; pixels outside are ignored.
    pub azimuth_range: Option<(f64, f64)>,
    /// Weight pixels by their relative solid angle.
    pub correct_solid_angle: bool,
    /// Polarization factor in `[-1, 1]`; `None` disables the correction.
    pub polarization_factor: Option<f64>,
}

impl Default for IntegrationOptions {
    fn default() -> Self {
        Self {
            unit: IntegrationUnit::TwoTheta,
            num_points: None,
            azimuth_range: None,
            correct_solid_angle: true,
            polarization_factor: None,
        }
    }
}

impl IntegrationOptions {
    /// Set the radial unit.
    #[must_use]
    pub fn with_unit(mut self, unit: IntegrationUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Set a fixed bin count.
    #[must_use]
    pub fn with_num_points(mut self, num_points: Option<usize>) -> Self {
        self.num_points = num_points;
        self
    }

    /// Restrict to an azimuthal wedge (degrees).
    #[must_use]
    pub fn with_azimuth_range(mut self, range: Option<(f64, f64)>) -> Self {
        self.azimuth_range = range;
        self
    }

    /// Toggle solid-angle weighting.
    #[must_use]
    pub fn with_correct_solid_angle(mut self, enabled: bool) -> Self {
        self.correct_solid_angle = enabled;
        self
    }

    /// Set the polarization factor.
    #[must_use]
    pub fn with_polarization_factor(mut self, factor: Option<f64>) -> Self {
        self.polarization_factor = factor;
        self
    }
}

/// Options of a 2D (cake) integration. The radial axis is always 2θ in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct CakeOptions {
    /// Radial bin count; `None` picks the detector diagonal.
    pub radial_points: Option<usize>,
    /// Azimuthal bin count.
    pub azimuth_points: usize,
    /// Azimuthal extent in degrees, `(-180, 180)` when unset.
    pub azimuth_range: Option<(f64, f64)>,
    pub correct_solid_angle: bool,
    pub polarization_factor: Option<f64>,
}

impl Default for CakeOptions {
    fn default() -> Self {
        Self {
            radial_points: None,
            azimuth_points: DEFAULT_AZIMUTH_POINTS,
            azimuth_range: None,
            correct_solid_angle: true,
            polarization_factor: None,
        }
    }
}

impl CakeOptions {
    /// Set the radial bin count.
    #[must_use]
    pub fn with_radial_points(mut self, points: Option<usize>) -> Self {
        self.radial_points = points;
        self
    }

    /// Set the azimuthal bin count.
    #[must_use]
    pub fn with_azimuth_points(mut self, points: usize) -> Self {
        self.azimuth_points = points;
        self
    }

    /// Set the azimuthal extent (degrees).
    #[must_use]
    pub fn with_azimuth_range(mut self, range: Option<(f64, f64)>) -> Self {
        self.azimuth_range = range;
        self
    }

    /// Toggle solid-angle weighting.
    #[must_use]
    pub fn with_correct_solid_angle(mut self, enabled: bool) -> Self {
        self.correct_solid_angle = enabled;
        self
    }

    /// Set the polarization factor.
    #[must_use]
    pub fn with_polarization_factor(mut self, factor: Option<f64>) -> Self {
        self.polarization_factor = factor;
        self
    }
}

/// Result of a 1D integration. Empty bins hold NaN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Integrated1d {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub unit: IntegrationUnit,
}

impl Integrated1d {
    /// Number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Returns true if no bins were produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Number of bins without contributing pixels.
    #[must_use]
    pub fn empty_bins(&self) -> usize {
        self.y.iter().filter(|v| v.is_nan()).count()
    }

    /// `(x, y)` with the empty bins removed.
    #[must_use]
    pub fn trimmed(&self) -> (Vec<f64>, Vec<f64>) {
        self.x
            .iter()
            .zip(&self.y)
            .filter(|(_, y)| !y.is_nan())
            .map(|(x, y)| (*x, *y))
            .unzip()
    }

    /// `(x, y)` with all bins kept. Empty bins are interpolated linearly
    /// from the non-empty ones; at the ends the nearest value is held.
    #[must_use]
    pub fn filled(&self) -> (Vec<f64>, Vec<f64>) {
        let (xp, fp) = self.trimmed();
        if xp.is_empty() {
            return (self.x.clone(), vec![0.0; self.x.len()]);
        }
        let y = self
            .x
            .iter()
            .zip(&self.y)
            .map(|(&x, &y)| if y.is_nan() { interp_linear_at(x, &xp, &fp) } else { y })
            .collect();
        (self.x.clone(), y)
    }
}

/// Result of a 2D integration: `intensity[azimuth, radial]`. Empty bins hold 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cake {
    pub intensity: Array2<f64>,
    /// Radial bin centres, 2θ degrees.
    pub tth: Vec<f64>,
    /// Azimuthal bin centres, degrees.
    pub azimuth: Vec<f64>,
}

impl Cake {
    /// Returns true if the cake has no bins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intensity.is_empty()
    }
}

/// Bin count used when none is given: the detector diagonal in base pixels.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn auto_num_points(shape: (usize, usize), supersampling: usize) -> usize {
    let (h, w) = (shape.0 as f64, shape.1 as f64);
    let n = (h * h + w * w).sqrt() / supersampling.max(1) as f64;
    (n as usize).max(1)
}

/// Polarization factor `½(1 + cos²2θ − f·cos2χ·sin²2θ)`.
#[must_use]
pub fn polarization(tth: f64, chi: f64, factor: f64) -> f64 {
    let c = tth.cos();
    let s = tth.sin();
    0.5 * (1.0 + c * c - factor * (2.0 * chi).cos() * s * s)
}

/// One contributing pixel.
#[derive(Clone, Copy)]
struct Sample {
    radial: f64,
    azimuth: f64,
    value: f64,
    weight: f64,
}

struct SampleRequest<'geo, 'img, 'mask> {
    arrays: &'geo GeometryArrays,
    image: ArrayView2<'img, f64>,
    mask: Option<ArrayView2<'mask, bool>>,
    azimuth_range: Option<(f64, f64)>,
    correct_solid_angle: bool,
    polarization_factor: Option<f64>,
}

fn check_shapes(
    arrays: &GeometryArrays,
    image: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
) -> Result<()> {
    if image.dim() != arrays.shape() {
        return Err(Error::DimensionMismatch {
            what: "image",
            expected: arrays.shape(),
            actual: image.dim(),
        });
    }
    if let Some(mask) = mask {
        if mask.dim() != arrays.shape() {
            return Err(Error::DimensionMismatch {
                what: "mask",
                expected: arrays.shape(),
                actual: mask.dim(),
            });
        }
    }
    Ok(())
}

fn collect_samples<F>(req: &SampleRequest<'_, '_, '_>, radial: F) -> Vec<Sample>
where
    F: Fn(f64) -> f64 + Sync,
{
    let (rows, cols) = req.arrays.shape();
    let tth = req.arrays.tth();
    let chi = req.arrays.chi();
    let cosa = req.arrays.cos_incidence();
    (0..rows)
        .into_par_iter()
        .flat_map_iter(|r| {
            let radial = &radial;
            (0..cols).filter_map(move |c| {
                if req.mask.is_some_and(|m| m[[r, c]]) {
                    return None;
                }
                let mut value = req.image[[r, c]];
                if !value.is_finite() {
                    return None;
                }
                let (t, x) = (tth[[r, c]], chi[[r, c]]);
                let azimuth = x.to_degrees();
                if let Some((lo, hi)) = req.azimuth_range {
                    if azimuth < lo || azimuth > hi {
                        return None;
                    }
                }
                let rad = radial(t);
                if !rad.is_finite() {
                    return None;
                }
                if let Some(f) = req.polarization_factor {
                    value /= polarization(t, x, f);
                }
                let weight = if req.correct_solid_angle {
                    let a = cosa[[r, c]];
                    a * a * a
                } else {
                    1.0
                };
                Some(Sample {
                    radial: rad,
                    azimuth,
                    value,
                    weight,
                })
            })
        })
        .collect()
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn bin_index(value: f64, lo: f64, width: f64, n: usize) -> usize {
    let b = ((value - lo) / width).floor();
    if b <= 0.0 {
        0
    } else {
        (b as usize).min(n - 1)
    }
}

fn radial_extent(samples: &[Sample]) -> (f64, f64) {
    samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s.radial), hi.max(s.radial))
        })
}

#[allow(clippy::cast_precision_loss)]
fn bin_centres(lo: f64, width: f64, n: usize) -> Vec<f64> {
    (0..n).map(|k| lo + (k as f64 + 0.5) * width).collect()
}

#[allow(clippy::cast_precision_loss)]
fn bin_width(lo: f64, hi: f64, n: usize) -> f64 {
    if hi > lo {
        (hi - lo) / n as f64
    } else {
        1.0
    }
}

/// Integrates `image` into a 1D pattern.
///
/// `wavelength` (metres) is only used for Q and d axes.
///
/// # Errors
/// Returns `DimensionMismatch` if image or mask do not match the geometry,
/// and `InvalidParameter` for a Q/d integration without a usable wavelength.
pub fn integrate_1d(
    arrays: &GeometryArrays,
    wavelength: f64,
    image: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
    supersampling: usize,
    options: &IntegrationOptions,
) -> Result<Integrated1d> {
    check_shapes(arrays, image, mask)?;
    let unit = options.unit;
    if unit != IntegrationUnit::TwoTheta && !(wavelength.is_finite() && wavelength > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "{unit} integration needs a positive wavelength, got {wavelength}"
        )));
    }
    let req = SampleRequest {
        arrays,
        image,
        mask,
        azimuth_range: options.azimuth_range,
        correct_solid_angle: options.correct_solid_angle,
        polarization_factor: options.polarization_factor,
    };
    let samples = collect_samples(&req, |tth| unit.value_from_tth(tth.to_degrees(), wavelength));
    if samples.is_empty() {
        log::debug!("1D integration: no unmasked pixels");
        return Ok(Integrated1d {
            unit,
            ..Integrated1d::default()
        });
    }

    let n = options
        .num_points
        .unwrap_or_else(|| auto_num_points(image.dim(), supersampling))
        .max(1);
    let (lo, hi) = radial_extent(&samples);
    let width = bin_width(lo, hi, n);

    let mut sum = vec![0.0; n];
    let mut norm = vec![0.0; n];
    for s in &samples {
        let b = bin_index(s.radial, lo, width, n);
        sum[b] += s.value * s.weight;
        norm[b] += s.weight;
    }
    let y: Vec<f64> = sum
        .iter()
        .zip(&norm)
        .map(|(&s, &w)| if w > 0.0 { s / w } else { f64::NAN })
        .collect();
    log::debug!(
        "1D integration: {} pixels into {n} bins ({} empty)",
        samples.len(),
        y.iter().filter(|v| v.is_nan()).count()
    );
    Ok(Integrated1d {
        x: bin_centres(lo, width, n),
        y,
        unit,
    })
}

/// Integrates `image` into an azimuth × 2θ cake.
///
/// # Errors
/// Returns `DimensionMismatch` if image or mask do not match the geometry,
/// and `InvalidParameter` for an empty azimuth range or zero azimuth bins.
pub fn integrate_2d(
    arrays: &GeometryArrays,
    image: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
    supersampling: usize,
    options: &CakeOptions,
) -> Result<Cake> {
    check_shapes(arrays, image, mask)?;
    let (alo, ahi) = options.azimuth_range.unwrap_or((-180.0, 180.0));
    if ahi <= alo || options.azimuth_points == 0 {
        return Err(Error::InvalidParameter(format!(
            "cake needs a non-empty azimuth range and bins, got ({alo}, {ahi}) x {}",
            options.azimuth_points
        )));
    }
    let req = SampleRequest {
        arrays,
        image,
        mask,
        azimuth_range: Some((alo, ahi)),
        correct_solid_angle: options.correct_solid_angle,
        polarization_factor: options.polarization_factor,
    };
    let samples = collect_samples(&req, f64::to_degrees);
    if samples.is_empty() {
        log::debug!("2D integration: no unmasked pixels");
        return Ok(Cake::default());
    }

    let n_rad = options
        .radial_points
        .unwrap_or_else(|| auto_num_points(image.dim(), supersampling))
        .max(1);
    let n_azi = options.azimuth_points;
    let (lo, hi) = radial_extent(&samples);
    let rad_width = bin_width(lo, hi, n_rad);
    let azi_width = bin_width(alo, ahi, n_azi);

    // flat index: azimuth * n_rad + radial
    let mut sum = vec![0.0; n_azi * n_rad];
    let mut norm = vec![0.0; n_azi * n_rad];
    for s in &samples {
        let r = bin_index(s.radial, lo, rad_width, n_rad);
        let a = bin_index(s.azimuth, alo, azi_width, n_azi);
        let idx = a * n_rad + r;
        sum[idx] += s.value * s.weight;
        norm[idx] += s.weight;
    }
    let values: Vec<f64> = sum
        .iter()
        .zip(&norm)
        .map(|(&s, &w)| if w > 0.0 { s / w } else { 0.0 })
        .collect();
    let intensity = Array2::from_shape_vec((n_azi, n_rad), values)
        .map_err(|e| Error::InvalidParameter(e.to_string()))?;
    log::debug!("2D integration: {} pixels into {n_azi}x{n_rad} bins", samples.len());
    Ok(Cake {
        intensity,
        tth: bin_centres(lo, rad_width, n_rad),
        azimuth: bin_centres(alo, azi_width, n_azi),
    })
}
