//! Per-pixel correction maps for the image correction stack.

use ndarray::{Array2, ArrayView2, Zip};
use xrdpix_core::{Correction, CorrectionMode};

use crate::geometry::GeometryArrays;
use crate::integrator::polarization;
use crate::{Error, Result};

/// Registry name of the detector absorption correction.
pub const DETECTOR_ABSORPTION: &str = "detector_absorption";
/// Registry name of the transfer-function correction.
pub const TRANSFER: &str = "transfer";
/// Registry name of the polarization correction.
pub const POLARIZATION: &str = "polarization";

/// Oblique-incidence absorption of a sensor layer, relative to normal
/// incidence. Applied in divide mode.
///
/// For a sensor of `thickness` and attenuation length `absorption_length`
/// (both metres) the absorbed fraction at incidence angle `α` is
/// `1 − exp(−t / (μ cos α))`.
///
/// # Errors
/// Returns `InvalidParameter` for non-positive lengths.
pub fn detector_absorption(
    arrays: &GeometryArrays,
    thickness: f64,
    absorption_length: f64,
) -> Result<Correction> {
    if !(thickness > 0.0 && absorption_length > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "thickness {thickness} and absorption length {absorption_length} must be positive"
        )));
    }
    let normal = 1.0 - (-thickness / absorption_length).exp();
    let data = arrays
        .cos_incidence()
        .mapv(|c| (1.0 - (-thickness / (absorption_length * c)).exp()) / normal);
    Ok(Correction::new(data, CorrectionMode::Divide))
}

/// Transfer function `T = original / response`, applied in multiply mode so
/// that a response image is mapped back onto the original one. Pixels with a
/// zero or non-finite ratio get `T = 1`.
///
/// # Errors
/// Returns `DimensionMismatch` if the two images differ in shape.
pub fn transfer_function(
    original: ArrayView2<'_, f64>,
    response: ArrayView2<'_, f64>,
) -> Result<Correction> {
    if original.dim() != response.dim() {
        return Err(Error::DimensionMismatch {
            what: "transfer response",
            expected: original.dim(),
            actual: response.dim(),
        });
    }
    let mut data = Array2::zeros(original.dim());
    Zip::from(&mut data)
        .and(original)
        .and(response)
        .for_each(|t, &o, &r| {
            let ratio = o / r;
            *t = if ratio.is_finite() && r != 0.0 { ratio } else { 1.0 };
        });
    Ok(Correction::new(data, CorrectionMode::Multiply))
}

/// Polarization map for `factor`, applied in divide mode.
#[must_use]
pub fn polarization_map(arrays: &GeometryArrays, factor: f64) -> Correction {
    let mut data = Array2::zeros(arrays.shape());
    Zip::from(&mut data)
        .and(arrays.tth())
        .and(arrays.chi())
        .for_each(|p, &t, &c| *p = polarization(t, c, factor));
    Correction::new(data, CorrectionMode::Divide)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PoniParameters;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn arrays() -> GeometryArrays {
        let params = PoniParameters::default()
            .with_distance(0.05)
            .with_poni(0.0025, 0.0025)
            .with_pixel_size(1e-4, 1e-4);
        GeometryArrays::compute(&params, (50, 50)).unwrap()
    }

    #[test]
    fn test_absorption_grows_off_axis() {
        let arrays = arrays();
        let c = detector_absorption(&arrays, 450e-6, 300e-6).unwrap();
        assert_eq!(c.mode, CorrectionMode::Divide);
        // closest pixel to the PONI is nearly normal incidence
        assert_relative_eq!(c.data[[24, 24]], 1.0, epsilon = 1e-4);
        assert!(c.data[[0, 0]] > c.data[[24, 24]]);
        assert!(detector_absorption(&arrays, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_transfer_ratio_and_guards() {
        let original = array![[2.0, 4.0], [0.0, 9.0]];
        let response = array![[1.0, 8.0], [3.0, 0.0]];
        let t = transfer_function(original.view(), response.view()).unwrap();
        assert_eq!(t.mode, CorrectionMode::Multiply);
        assert_eq!(t.data, array![[2.0, 0.5], [0.0, 1.0]]);
        let other = Array2::<f64>::zeros((3, 2));
        assert!(transfer_function(original.view(), other.view()).is_err());
    }

    #[test]
    fn test_polarization_map_at_poni_is_one() {
        let arrays = arrays();
        let p = polarization_map(&arrays, 0.95);
        assert_relative_eq!(p.data[[24, 24]], 1.0, epsilon = 1e-4);
        assert!(p.data.iter().all(|&v| v > 0.0 && v <= 1.0 + 1e-12));
    }
}
