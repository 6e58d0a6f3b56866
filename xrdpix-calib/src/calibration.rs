//! The calibration model: PONI geometry, calibrant, picked points and the
//! two integration geometries.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ndarray::ArrayView2;
use xrdpix_core::{Correction, Signal};

use crate::corrections::{detector_absorption, polarization_map};
use crate::geometry::Geometry;
use crate::integrator::{self, CakeOptions, Cake, Integrated1d, IntegrationOptions};
use crate::peaks::{self, PeakSearchOptions};
use crate::refinement::{self, PickedPoint, RefinementOptions, RefinementReport};
use crate::{Calibrant, Error, PoniParameters, Result};

/// Detector calibration and integrator.
///
/// The stored parameters describe the base detector grid. The pattern and
/// cake geometries use the same parameters with pixel pitches divided by
/// the supersampling factor, so the detector footprint is unchanged.
#[derive(Debug)]
pub struct Calibration {
    params: Option<PoniParameters>,
    pattern_geometry: Geometry,
    cake_geometry: Geometry,
    supersampling: usize,
    calibrant: Option<Calibrant>,
    points: Vec<PickedPoint>,
    filename: Option<PathBuf>,
    changed: Signal<()>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Calibration {
    fn clone(&self) -> Self {
        Self {
            params: self.params.clone(),
            pattern_geometry: self.pattern_geometry.clone(),
            cake_geometry: self.cake_geometry.clone(),
            supersampling: self.supersampling,
            calibrant: self.calibrant.clone(),
            points: self.points.clone(),
            filename: self.filename.clone(),
            changed: Signal::new(),
        }
    }
}

impl Calibration {
    /// Create an uncalibrated model.
    #[must_use]
    pub fn new() -> Self {
        Self {
            params: None,
            pattern_geometry: Geometry::default(),
            cake_geometry: Geometry::default(),
            supersampling: 1,
            calibrant: None,
            points: Vec::new(),
            filename: None,
            changed: Signal::new(),
        }
    }

    /// Emitted after the geometry changes.
    #[must_use]
    pub fn changed(&self) -> &Signal<()> {
        &self.changed
    }

    /// Returns true once PONI parameters are set.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.params.is_some()
    }

    /// Base-grid PONI parameters.
    #[must_use]
    pub fn params(&self) -> Option<&PoniParameters> {
        self.params.as_ref()
    }

    /// Wavelength in metres, if calibrated.
    #[must_use]
    pub fn wavelength(&self) -> Option<f64> {
        self.params.as_ref().map(|p| p.wavelength)
    }

    /// Set PONI parameters and rebuild both geometries.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the parameters fail validation; the
    /// previous calibration is kept.
    pub fn set_params(&mut self, params: PoniParameters) -> Result<()> {
        params.validate()?;
        self.apply_params(params);
        self.changed.emit(&());
        Ok(())
    }

    fn apply_params(&mut self, params: PoniParameters) {
        let effective = params.supersampled(self.supersampling);
        self.pattern_geometry.set_params(effective.clone());
        self.cake_geometry.set_params(effective);
        self.params = Some(params);
    }

    /// Drop the calibration.
    pub fn reset(&mut self) {
        self.params = None;
        self.pattern_geometry = Geometry::default();
        self.cake_geometry = Geometry::default();
        self.filename = None;
        self.changed.emit(&());
    }

    /// Load a PONI file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed; the previous
    /// calibration is kept.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let params = PoniParameters::read(path.as_ref())?;
        self.apply_params(params);
        self.filename = Some(path.as_ref().to_path_buf());
        self.changed.emit(&());
        Ok(())
    }

    /// Save the base-grid parameters as a PONI file.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without parameters, or an I/O error.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let params = self.params.as_ref().ok_or(Error::NotCalibrated)?;
        let comment = match &self.calibrant {
            Some(c) => format!("Calibration done with {}", c.name()),
            None => String::from("Calibration"),
        };
        params.write(path.as_ref(), &comment)?;
        self.filename = Some(path.as_ref().to_path_buf());
        Ok(())
    }

    /// File the calibration was last loaded from or saved to.
    #[must_use]
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Current supersampling factor.
    #[must_use]
    pub fn supersampling(&self) -> usize {
        self.supersampling
    }

    /// Rescale both geometries' pixel pitches by `1/n`.
    pub fn set_supersampling(&mut self, n: usize) {
        let n = n.max(1);
        if n == self.supersampling {
            return;
        }
        self.supersampling = n;
        if let Some(params) = self.params.clone() {
            self.apply_params(params);
        }
        debug!("calibration supersampling set to {n}");
        self.changed.emit(&());
    }

    /// Geometry used for 1D integration.
    #[must_use]
    pub fn pattern_geometry(&self) -> &Geometry {
        &self.pattern_geometry
    }

    /// Geometry used for 2D integration.
    #[must_use]
    pub fn cake_geometry(&self) -> &Geometry {
        &self.cake_geometry
    }

    /// 2θ in degrees at a base-grid pixel position (x = column, y = row).
    ///
    /// # Errors
    /// Returns `NotCalibrated` without parameters.
    pub fn tth_at(&self, x: f64, y: f64) -> Result<f64> {
        let params = self.params.as_ref().ok_or(Error::NotCalibrated)?;
        Ok(crate::geometry::pixel_angles(params, y, x).0.to_degrees())
    }

    /// Azimuth in degrees at a base-grid pixel position (x = column, y = row).
    ///
    /// # Errors
    /// Returns `NotCalibrated` without parameters.
    pub fn azimuth_at(&self, x: f64, y: f64) -> Result<f64> {
        let params = self.params.as_ref().ok_or(Error::NotCalibrated)?;
        Ok(crate::geometry::pixel_angles(params, y, x).1.to_degrees())
    }

    /// 1D integration of an image at the current supersampling.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without parameters, or an integrator error.
    pub fn integrate_1d(
        &mut self,
        image: ArrayView2<'_, f64>,
        mask: Option<ArrayView2<'_, bool>>,
        options: &IntegrationOptions,
    ) -> Result<Integrated1d> {
        let wavelength = self.wavelength().ok_or(Error::NotCalibrated)?;
        let supersampling = self.supersampling;
        let arrays = self.pattern_geometry.arrays(image.dim())?;
        integrator::integrate_1d(arrays, wavelength, image, mask, supersampling, options)
    }

    /// 2D integration of an image at the current supersampling.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without parameters, or an integrator error.
    pub fn integrate_2d(
        &mut self,
        image: ArrayView2<'_, f64>,
        mask: Option<ArrayView2<'_, bool>>,
        options: &CakeOptions,
    ) -> Result<Cake> {
        if !self.is_calibrated() {
            return Err(Error::NotCalibrated);
        }
        let supersampling = self.supersampling;
        let arrays = self.cake_geometry.arrays(image.dim())?;
        integrator::integrate_2d(arrays, image, mask, supersampling, options)
    }

    /// Detector absorption correction for an image of `shape`.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without parameters or `InvalidParameter` for
    /// non-positive lengths.
    pub fn detector_absorption_correction(
        &mut self,
        shape: (usize, usize),
        thickness: f64,
        absorption_length: f64,
    ) -> Result<Correction> {
        if !self.is_calibrated() {
            return Err(Error::NotCalibrated);
        }
        detector_absorption(
            self.pattern_geometry.arrays(shape)?,
            thickness,
            absorption_length,
        )
    }

    /// Polarization correction for an image of `shape`.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without parameters.
    pub fn polarization_correction(
        &mut self,
        shape: (usize, usize),
        factor: f64,
    ) -> Result<Correction> {
        if !self.is_calibrated() {
            return Err(Error::NotCalibrated);
        }
        Ok(polarization_map(self.pattern_geometry.arrays(shape)?, factor))
    }

    /// Current calibrant.
    #[must_use]
    pub fn calibrant(&self) -> Option<&Calibrant> {
        self.calibrant.as_ref()
    }

    /// Set the calibrant used for peak search and refinement.
    pub fn set_calibrant(&mut self, calibrant: Calibrant) {
        info!("calibrant set to '{}'", calibrant.name());
        self.calibrant = Some(calibrant);
    }

    /// Picked points in base-grid pixels.
    #[must_use]
    pub fn points(&self) -> &[PickedPoint] {
        &self.points
    }

    /// Add a picked point.
    pub fn add_point(&mut self, point: PickedPoint) {
        self.points.push(point);
    }

    /// Remove every picked point.
    pub fn clear_points(&mut self) {
        self.points.clear();
    }

    /// Remove the points of one ring.
    pub fn remove_ring_points(&mut self, ring: usize) {
        self.points.retain(|p| p.ring != ring);
    }

    fn ring_tth(&self, ring: usize) -> Result<f64> {
        let calibrant = self
            .calibrant
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("no calibrant set".into()))?;
        let wavelength = self.wavelength().ok_or(Error::NotCalibrated)?;
        calibrant.ring_tth(ring, wavelength).ok_or_else(|| {
            Error::InvalidParameter(format!("ring {ring} is not reachable by the calibrant"))
        })
    }

    /// Search one calibrant ring for peaks and add them as picked points.
    /// Returns the number of points added.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without a starting geometry, or
    /// `InvalidParameter` without a calibrant or for an unknown ring.
    #[allow(clippy::cast_precision_loss)]
    pub fn search_peaks_on_ring(
        &mut self,
        ring: usize,
        image: ArrayView2<'_, f64>,
        mask: Option<ArrayView2<'_, bool>>,
        options: &PeakSearchOptions,
    ) -> Result<usize> {
        let tth = self.ring_tth(ring)?;
        let n = self.supersampling as f64;
        let arrays = self.pattern_geometry.arrays(image.dim())?;
        let found = peaks::search_peaks_on_ring(arrays, image, mask, ring, tth, options)?;
        let count = found.len();
        // back to base-grid pixel coordinates
        self.points.extend(found.into_iter().map(|p| {
            PickedPoint::new((p.x + 0.5) / n - 0.5, (p.y + 0.5) / n - 0.5, p.ring)
        }));
        Ok(count)
    }

    /// Search several rings in order, checking `is_cancelled` before each.
    /// Points found before a cancellation are kept. Rings the calibrant
    /// cannot reach stop the search.
    ///
    /// # Errors
    /// Propagates the first error of [`Calibration::search_peaks_on_ring`]
    /// other than an unreachable ring.
    pub fn search_peaks(
        &mut self,
        rings: impl IntoIterator<Item = usize>,
        image: ArrayView2<'_, f64>,
        mask: Option<ArrayView2<'_, bool>>,
        options: &PeakSearchOptions,
        is_cancelled: impl Fn() -> bool,
    ) -> Result<usize> {
        let mut total = 0;
        for ring in rings {
            if is_cancelled() {
                info!("peak search cancelled before ring {ring}");
                break;
            }
            match self.search_peaks_on_ring(ring, image, mask, options) {
                Ok(n) => total += n,
                Err(Error::InvalidParameter(msg)) if self.calibrant.is_some() => {
                    debug!("stopping peak search: {msg}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Untilted starting geometry from the ring-0 points; pixel sizes and
    /// wavelength come from `template`. The result is applied.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if there is no calibrant, fewer than three
    /// ring-0 points, or a degenerate fit.
    pub fn guess_geometry(&mut self, template: &PoniParameters) -> Result<()> {
        let calibrant = self
            .calibrant
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("no calibrant set".into()))?;
        let tth = calibrant.ring_tth(0, template.wavelength).ok_or_else(|| {
            Error::InvalidParameter("first ring unreachable at this wavelength".into())
        })?;
        let ring0: Vec<PickedPoint> = self.points.iter().copied().filter(|p| p.ring == 0).collect();
        let guess = peaks::guess_geometry(&ring0, tth, template).ok_or_else(|| {
            Error::InvalidParameter(format!("no circle through {} ring-0 points", ring0.len()))
        })?;
        self.set_params(guess)
    }

    /// Refine the geometry against the picked points.
    ///
    /// The best parameters found are applied even when the iteration limit
    /// is reached; that case is reported as `ConvergenceFail`.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without a starting geometry, `InvalidParameter`
    /// without a calibrant or with too few points, and `ConvergenceFail` as
    /// described above.
    pub fn refine(&mut self, options: &RefinementOptions) -> Result<RefinementReport> {
        let start = self.params.clone().ok_or(Error::NotCalibrated)?;
        let calibrant = self
            .calibrant
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("no calibrant set".into()))?;
        let report = refinement::refine(&start, &self.points, calibrant, options)?;
        self.apply_params(report.params.clone());
        self.changed.emit(&());
        if report.converged {
            info!(
                "refinement converged after {} iterations, rms {:.2e} deg",
                report.iterations, report.rms_deg
            );
            Ok(report)
        } else {
            warn!("refinement stopped after {} iterations", report.iterations);
            Err(Error::ConvergenceFail(format!(
                "no convergence after {} iterations (rms {:.3e} deg)",
                report.iterations, report.rms_deg
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::tempdir;

    fn params() -> PoniParameters {
        PoniParameters::default()
            .with_distance(0.1)
            .with_poni(0.005, 0.005)
            .with_pixel_size(1e-4, 1e-4)
    }

    #[test]
    fn test_uncalibrated_integration_fails() {
        let mut calibration = Calibration::new();
        let image = Array2::zeros((10, 10));
        let err = calibration
            .integrate_1d(image.view(), None, &IntegrationOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotCalibrated));
        assert!(calibration
            .integrate_2d(image.view(), None, &CakeOptions::default())
            .is_err());
    }

    #[test]
    fn test_supersampling_scales_both_geometries() {
        let mut calibration = Calibration::new();
        calibration.set_params(params()).unwrap();
        calibration.set_supersampling(2);
        assert_relative_eq!(calibration.pattern_geometry().params().pixel1, 5e-5);
        assert_relative_eq!(calibration.cake_geometry().params().pixel2, 5e-5);
        assert_relative_eq!(calibration.params().unwrap().pixel1, 1e-4);

        // the same physical point has the same angle on both grids
        let base = crate::geometry::pixel_angles(calibration.params().unwrap(), 10.0, 30.0).0;
        let fine = calibration.pattern_geometry().tth_at(20.5, 60.5);
        assert_relative_eq!(base, fine, epsilon = 1e-12);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.poni");
        let mut calibration = Calibration::new();
        assert!(matches!(calibration.save(&path), Err(Error::NotCalibrated)));
        calibration.set_params(params()).unwrap();
        calibration.save(&path).unwrap();

        let mut loaded = Calibration::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _sub = loaded.changed().subscribe(move |_| h.set(h.get() + 1));
        loaded.load(&path).unwrap();
        assert_eq!(loaded.params(), Some(&params()));
        assert_eq!(loaded.filename(), Some(path.as_path()));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_failed_load_keeps_previous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.poni");
        std::fs::write(&path, "Distance: nope\n").unwrap();
        let mut calibration = Calibration::new();
        calibration.set_params(params()).unwrap();
        assert!(calibration.load(&path).is_err());
        assert_eq!(calibration.params(), Some(&params()));
    }

    #[test]
    fn test_search_is_cancellable() {
        let mut calibration = Calibration::new();
        calibration.set_params(params()).unwrap();
        calibration.set_calibrant(Calibrant::new("c", vec![3.0, 2.0, 1.0]).unwrap());
        let image = Array2::from_elem((100, 100), 1.0);
        let calls = Cell::new(0);
        let found = calibration
            .search_peaks(
                0..3,
                image.view(),
                None,
                &PeakSearchOptions::default(),
                || {
                    calls.set(calls.get() + 1);
                    calls.get() > 1
                },
            )
            .unwrap();
        assert_eq!(found, 0);
        assert_eq!(calls.get(), 2);
    }
}
