//! Least-squares refinement of PONI parameters from picked ring points.
//!
//! Residuals are `2θ(x_i, y_i) − 2θ_ring(i)` in radians. The problem is
//! solved with a damped Gauss-Newton (Levenberg-Marquardt) iteration on a
//! central-difference Jacobian; the best parameters seen are always kept.

use log::debug;
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::geometry::pixel_angles;
use crate::{Calibrant, Error, PoniParameters, Result};

/// A picked point on a calibrant ring, in base image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PickedPoint {
    /// Column coordinate.
    pub x: f64,
    /// Row coordinate.
    pub y: f64,
    /// Calibrant ring index.
    pub ring: usize,
}

impl PickedPoint {
    #[must_use]
    pub fn new(x: f64, y: f64, ring: usize) -> Self {
        Self { x, y, ring }
    }
}

/// Which parameters are free during refinement.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct RefinementOptions {
    pub fit_distance: bool,
    pub fit_wavelength: bool,
    pub fit_poni: bool,
    /// Refine `rot1` and `rot2`.
    pub fit_tilt: bool,
    /// Refine `rot3`; it only moves the azimuth, so it is fixed by default.
    pub fit_rot3: bool,
    pub max_iterations: usize,
    /// Relative step size below which the fit counts as converged.
    pub tolerance: f64,
}

impl Default for RefinementOptions {
    fn default() -> Self {
        Self {
            fit_distance: true,
            fit_wavelength: false,
            fit_poni: true,
            fit_tilt: true,
            fit_rot3: false,
            max_iterations: 200,
            tolerance: 1e-10,
        }
    }
}

impl RefinementOptions {
    /// Toggle refinement of the distance.
    #[must_use]
    pub fn with_fit_distance(mut self, enabled: bool) -> Self {
        self.fit_distance = enabled;
        self
    }

    /// Toggle refinement of the wavelength.
    #[must_use]
    pub fn with_fit_wavelength(mut self, enabled: bool) -> Self {
        self.fit_wavelength = enabled;
        self
    }

    /// Toggle refinement of the tilt rotations.
    #[must_use]
    pub fn with_fit_tilt(mut self, enabled: bool) -> Self {
        self.fit_tilt = enabled;
        self
    }

    /// Set the iteration limit.
    #[must_use]
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }
}

/// Outcome of a refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementReport {
    /// Best parameters found.
    pub params: PoniParameters,
    /// Root-mean-square 2θ residual in degrees.
    pub rms_deg: f64,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Clone, Copy)]
enum Free {
    Distance,
    Poni1,
    Poni2,
    Rot1,
    Rot2,
    Rot3,
    Wavelength,
}

impl Free {
    fn get(self, p: &PoniParameters) -> f64 {
        match self {
            Free::Distance => p.distance,
            Free::Poni1 => p.poni1,
            Free::Poni2 => p.poni2,
            Free::Rot1 => p.rot1,
            Free::Rot2 => p.rot2,
            Free::Rot3 => p.rot3,
            Free::Wavelength => p.wavelength,
        }
    }

    fn set(self, p: &mut PoniParameters, v: f64) {
        match self {
            Free::Distance => p.distance = v,
            Free::Poni1 => p.poni1 = v,
            Free::Poni2 => p.poni2 = v,
            Free::Rot1 => p.rot1 = v,
            Free::Rot2 => p.rot2 = v,
            Free::Rot3 => p.rot3 = v,
            Free::Wavelength => p.wavelength = v,
        }
    }

    /// Typical magnitude used for finite-difference steps and tolerances.
    fn scale(self) -> f64 {
        match self {
            Free::Distance => 1e-2,
            Free::Poni1 | Free::Poni2 => 1e-3,
            Free::Rot1 | Free::Rot2 | Free::Rot3 => 1e-2,
            Free::Wavelength => 1e-11,
        }
    }
}

fn free_parameters(options: &RefinementOptions) -> Vec<Free> {
    let mut free = Vec::new();
    if options.fit_distance {
        free.push(Free::Distance);
    }
    if options.fit_poni {
        free.extend([Free::Poni1, Free::Poni2]);
    }
    if options.fit_tilt {
        free.extend([Free::Rot1, Free::Rot2]);
    }
    if options.fit_rot3 {
        free.push(Free::Rot3);
    }
    if options.fit_wavelength {
        free.push(Free::Wavelength);
    }
    free
}

fn residuals(params: &PoniParameters, points: &[PickedPoint], d_spacings: &[f64]) -> DVector<f64> {
    DVector::from_iterator(
        points.len(),
        points.iter().map(|p| {
            let (tth, _) = pixel_angles(params, p.y, p.x);
            let s = (params.wavelength * 1e10 / (2.0 * d_spacings[p.ring])).clamp(-1.0, 1.0);
            tth - 2.0 * s.asin()
        }),
    )
}

fn cost(r: &DVector<f64>) -> f64 {
    0.5 * r.norm_squared()
}

fn jacobian(
    params: &PoniParameters,
    free: &[Free],
    points: &[PickedPoint],
    d_spacings: &[f64],
) -> DMatrix<f64> {
    let mut j = DMatrix::zeros(points.len(), free.len());
    for (col, f) in free.iter().enumerate() {
        let v = f.get(params);
        let h = 1e-6 * v.abs().max(f.scale());
        let mut plus = params.clone();
        let mut minus = params.clone();
        f.set(&mut plus, v + h);
        f.set(&mut minus, v - h);
        let diff = (residuals(&plus, points, d_spacings) - residuals(&minus, points, d_spacings))
            / (2.0 * h);
        j.set_column(col, &diff);
    }
    j
}

#[allow(clippy::cast_precision_loss)]
fn rms_deg(r: &DVector<f64>) -> f64 {
    if r.is_empty() {
        return 0.0;
    }
    (r.norm_squared() / r.len() as f64).sqrt().to_degrees()
}

/// Refines `initial` against `points` on the rings of `calibrant`.
///
/// A report is returned even when the iteration limit is hit; its
/// `converged` flag is false in that case and `params` holds the best
/// parameters seen.
///
/// # Errors
/// Returns `InvalidParameter` if there are fewer points than free
/// parameters or a point names a ring the calibrant does not have, and
/// `NotCalibrated` if the starting geometry is unusable.
pub fn refine(
    initial: &PoniParameters,
    points: &[PickedPoint],
    calibrant: &Calibrant,
    options: &RefinementOptions,
) -> Result<RefinementReport> {
    initial.validate().map_err(|_| Error::NotCalibrated)?;
    let free = free_parameters(options);
    if points.len() < free.len().max(1) {
        return Err(Error::InvalidParameter(format!(
            "{} points cannot constrain {} parameters",
            points.len(),
            free.len()
        )));
    }
    let d = calibrant.d_spacings();
    if let Some(p) = points.iter().find(|p| p.ring >= d.len()) {
        return Err(Error::InvalidParameter(format!(
            "point ({}, {}) refers to ring {} of a {}-ring calibrant",
            p.x,
            p.y,
            p.ring,
            d.len()
        )));
    }

    let mut params = initial.clone();
    let mut r = residuals(&params, points, d);
    let mut current = cost(&r);
    let mut mu = 1e-3;
    let mut converged = free.is_empty();
    let mut iterations = 0;

    while !converged && iterations < options.max_iterations {
        iterations += 1;
        let j = jacobian(&params, &free, points, d);
        let g = j.transpose() * &r;
        let h = j.transpose() * &j;

        let mut accepted = false;
        while mu < 1e12 {
            let mut a = h.clone();
            for k in 0..free.len() {
                a[(k, k)] += mu * h[(k, k)].max(1e-30);
            }
            let Some(step) = a.lu().solve(&(-&g)) else {
                mu *= 10.0;
                continue;
            };
            let mut trial = params.clone();
            for (k, f) in free.iter().enumerate() {
                f.set(&mut trial, f.get(&params) + step[k]);
            }
            if trial.validate().is_err() {
                mu *= 10.0;
                continue;
            }
            let trial_r = residuals(&trial, points, d);
            let trial_cost = cost(&trial_r);
            if trial_cost.is_finite() && trial_cost < current {
                let small_step = free.iter().enumerate().all(|(k, f)| {
                    step[k].abs() <= options.tolerance * (f.get(&params).abs() + f.scale())
                });
                let small_gain = current - trial_cost <= 1e-15 * current;
                params = trial;
                r = trial_r;
                current = trial_cost;
                mu = (mu / 3.0).max(1e-12);
                accepted = true;
                converged = small_step || small_gain || current < 1e-30;
                break;
            }
            mu *= 4.0;
        }
        if !accepted {
            // no downhill step left: stationary point
            converged = true;
        }
    }

    let rms = rms_deg(&r);
    debug!("refinement: {iterations} iterations, rms {rms:.3e} deg, converged {converged}");
    Ok(RefinementReport {
        params,
        rms_deg: rms,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn truth() -> PoniParameters {
        PoniParameters::default()
            .with_distance(0.2)
            .with_poni(0.1, 0.1)
            .with_rotations(0.01, -0.005, 0.0)
            .with_pixel_size(1e-4, 1e-4)
            .with_wavelength(3.1e-11)
    }

    fn calibrant() -> Calibrant {
        Calibrant::new("test", vec![2.0, 1.5, 1.2, 1.0]).unwrap()
    }

    /// Walk outwards from the PONI along `phi` until the ring is crossed.
    fn point_on_ring(params: &PoniParameters, tth: f64, phi: f64, ring: usize) -> PickedPoint {
        let (row0, col0) = (params.poni1 / params.pixel1 - 0.5, params.poni2 / params.pixel2 - 0.5);
        let at = |r: f64| {
            let (row, col) = (row0 + r * phi.sin(), col0 + r * phi.cos());
            (pixel_angles(params, row, col).0, row, col)
        };
        let (mut lo, mut hi) = (0.0, 5000.0);
        for _ in 0..200 {
            let mid = 0.5 * (lo + hi);
            if at(mid).0 < tth {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let (_, row, col) = at(0.5 * (lo + hi));
        PickedPoint::new(col, row, ring)
    }

    fn synthetic_points(params: &PoniParameters) -> Vec<PickedPoint> {
        let cal = calibrant();
        let mut points = Vec::new();
        for ring in 0..cal.len() {
            let tth = cal.ring_tth(ring, params.wavelength).unwrap();
            for k in 0..8 {
                let phi = f64::from(k) * std::f64::consts::FRAC_PI_4 + 0.1;
                points.push(point_on_ring(params, tth, phi, ring));
            }
        }
        points
    }

    #[test]
    fn test_recovers_geometry_from_perturbed_start() {
        let truth = truth();
        let points = synthetic_points(&truth);
        let start = truth
            .clone()
            .with_distance(0.21)
            .with_poni(0.1008, 0.0994)
            .with_rotations(0.0, 0.0, 0.0);
        let report = refine(&start, &points, &calibrant(), &RefinementOptions::default()).unwrap();
        assert!(report.converged);
        assert!(report.rms_deg < 1e-6, "rms {}", report.rms_deg);
        assert_relative_eq!(report.params.distance, truth.distance, epsilon = 1e-6);
        assert_relative_eq!(report.params.poni1, truth.poni1, epsilon = 1e-6);
        assert_relative_eq!(report.params.poni2, truth.poni2, epsilon = 1e-6);
        assert_relative_eq!(report.params.rot1, truth.rot1, epsilon = 1e-5);
        assert_relative_eq!(report.params.rot2, truth.rot2, epsilon = 1e-5);
    }

    #[test]
    fn test_fixed_distance_is_untouched() {
        let truth = truth();
        let points = synthetic_points(&truth);
        let start = truth.clone().with_poni(0.1003, 0.0998);
        let options = RefinementOptions::default().with_fit_distance(false);
        let report = refine(&start, &points, &calibrant(), &options).unwrap();
        assert_eq!(report.params.distance, start.distance);
        assert_relative_eq!(report.params.poni1, truth.poni1, epsilon = 1e-6);
    }

    #[test]
    fn test_iteration_limit_keeps_best() {
        let truth = truth();
        let points = synthetic_points(&truth);
        let start = truth.clone().with_distance(0.25).with_rotations(0.0, 0.0, 0.0);
        let before = rms_deg(&residuals(&start, &points, calibrant().d_spacings()));
        let options = RefinementOptions::default().with_max_iterations(1);
        let report = refine(&start, &points, &calibrant(), &options).unwrap();
        assert_eq!(report.iterations, 1);
        assert!(report.rms_deg < before);
    }

    #[test]
    fn test_rejects_unknown_ring_and_too_few_points() {
        let truth = truth();
        let too_few = vec![PickedPoint::new(1.0, 2.0, 0)];
        assert!(refine(&truth, &too_few, &calibrant(), &RefinementOptions::default()).is_err());
        let mut points = synthetic_points(&truth);
        points[0].ring = 9;
        assert!(refine(&truth, &points, &calibrant(), &RefinementOptions::default()).is_err());
    }
}
