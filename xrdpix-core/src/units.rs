//! Radial units and conversions between 2θ, Q and d.
//!
//! Wavelengths are given in metres (as stored in PONI files); Q is in Å⁻¹
//! and d in Å.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Radial unit of an integrated pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IntegrationUnit {
    /// Scattering angle in degrees.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "2th_deg"))]
    TwoTheta,
    /// Momentum transfer in Å⁻¹.
    #[cfg_attr(feature = "serde", serde(rename = "q_A^-1"))]
    Q,
    /// Lattice spacing in Å.
    #[cfg_attr(feature = "serde", serde(rename = "d_A"))]
    D,
}

impl IntegrationUnit {
    /// All units, in display order.
    pub const ALL: [IntegrationUnit; 3] =
        [IntegrationUnit::TwoTheta, IntegrationUnit::Q, IntegrationUnit::D];

    /// Canonical short name, used in files and session attributes.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            IntegrationUnit::TwoTheta => "2th_deg",
            IntegrationUnit::Q => "q_A^-1",
            IntegrationUnit::D => "d_A",
        }
    }

    /// Axis label for plots and exported headers.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            IntegrationUnit::TwoTheta => "2θ (°)",
            IntegrationUnit::Q => "Q (Å⁻¹)",
            IntegrationUnit::D => "d (Å)",
        }
    }

    /// Converts a 2θ value in degrees into this unit.
    #[must_use]
    pub fn value_from_tth(self, tth_deg: f64, wavelength_m: f64) -> f64 {
        match self {
            IntegrationUnit::TwoTheta => tth_deg,
            IntegrationUnit::Q => tth_to_q(tth_deg, wavelength_m),
            IntegrationUnit::D => tth_to_d(tth_deg, wavelength_m),
        }
    }

    /// Converts a value in this unit into 2θ degrees.
    #[must_use]
    pub fn value_to_tth(self, value: f64, wavelength_m: f64) -> f64 {
        match self {
            IntegrationUnit::TwoTheta => value,
            IntegrationUnit::Q => q_to_tth(value, wavelength_m),
            IntegrationUnit::D => d_to_tth(value, wavelength_m),
        }
    }
}

impl fmt::Display for IntegrationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IntegrationUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "2th_deg" | "2theta" | "tth" | "2θ" => Ok(IntegrationUnit::TwoTheta),
            "q_A^-1" | "q" | "Q" => Ok(IntegrationUnit::Q),
            "d_A" | "d" => Ok(IntegrationUnit::D),
            other => Err(Error::Format(format!("unknown integration unit '{other}'"))),
        }
    }
}

fn angstrom(wavelength_m: f64) -> f64 {
    wavelength_m * 1e10
}

/// 2θ (degrees) to Q (Å⁻¹).
#[must_use]
pub fn tth_to_q(tth_deg: f64, wavelength_m: f64) -> f64 {
    4.0 * PI * (tth_deg.to_radians() / 2.0).sin() / angstrom(wavelength_m)
}

/// Q (Å⁻¹) to 2θ (degrees).
#[must_use]
pub fn q_to_tth(q: f64, wavelength_m: f64) -> f64 {
    (2.0 * (q * angstrom(wavelength_m) / (4.0 * PI)).asin()).to_degrees()
}

/// 2θ (degrees) to d (Å).
#[must_use]
pub fn tth_to_d(tth_deg: f64, wavelength_m: f64) -> f64 {
    angstrom(wavelength_m) / (2.0 * (tth_deg.to_radians() / 2.0).sin())
}

/// d (Å) to 2θ (degrees).
#[must_use]
pub fn d_to_tth(d: f64, wavelength_m: f64) -> f64 {
    (2.0 * (angstrom(wavelength_m) / (2.0 * d)).asin()).to_degrees()
}

/// Converts `value` from one unit to another.
///
/// # Errors
/// Returns `InvalidParameter` if the wavelength is not a positive finite
/// number, or if the converted value is not finite (e.g. a Q beyond the
/// reachable range for this wavelength).
pub fn convert(
    value: f64,
    from: IntegrationUnit,
    to: IntegrationUnit,
    wavelength_m: f64,
) -> Result<f64> {
    if from == to {
        return Ok(value);
    }
    if !(wavelength_m.is_finite() && wavelength_m > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "cannot convert {from} to {to} with wavelength {wavelength_m}"
        )));
    }
    let converted = to.value_from_tth(from.value_to_tth(value, wavelength_m), wavelength_m);
    if converted.is_finite() {
        Ok(converted)
    } else {
        Err(Error::InvalidParameter(format!(
            "{value} {from} has no finite value in {to}"
        )))
    }
}

/// Converts an interval, returning it with `lo <= hi` (d runs opposite to 2θ and Q).
///
/// # Errors
/// Same conditions as [`convert`].
pub fn convert_range(
    range: (f64, f64),
    from: IntegrationUnit,
    to: IntegrationUnit,
    wavelength_m: f64,
) -> Result<(f64, f64)> {
    let a = convert(range.0, from, to, wavelength_m)?;
    let b = convert(range.1, from, to, wavelength_m)?;
    Ok((a.min(b), a.max(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const LAMBDA: f64 = 3.1e-11;

    #[test]
    fn test_tth_q_roundtrip() {
        let q = tth_to_q(10.0, LAMBDA);
        assert_relative_eq!(q, 4.0 * PI * 5f64.to_radians().sin() / 0.31, epsilon = 1e-12);
        assert_relative_eq!(q_to_tth(q, LAMBDA), 10.0, epsilon = 1e-10);
    }

    #[test]
    fn test_tth_d_roundtrip() {
        let d = tth_to_d(10.0, LAMBDA);
        assert_relative_eq!(d, 0.31 / (2.0 * 5f64.to_radians().sin()), epsilon = 1e-12);
        assert_relative_eq!(d_to_tth(d, LAMBDA), 10.0, epsilon = 1e-10);
    }

    #[test]
    fn test_convert_rejects_zero_wavelength() {
        let err = convert(10.0, IntegrationUnit::TwoTheta, IntegrationUnit::Q, 0.0).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidParameter);
        // identity never needs a wavelength
        assert_relative_eq!(
            convert(3.0, IntegrationUnit::Q, IntegrationUnit::Q, 0.0).unwrap(),
            3.0
        );
    }

    #[test]
    fn test_convert_range_orders_d() {
        let (lo, hi) =
            convert_range((5.0, 20.0), IntegrationUnit::TwoTheta, IntegrationUnit::D, LAMBDA)
                .unwrap();
        assert!(lo < hi);
        assert_relative_eq!(lo, tth_to_d(20.0, LAMBDA), epsilon = 1e-12);
    }

    #[test]
    fn test_parse_names() {
        for unit in IntegrationUnit::ALL {
            assert_eq!(unit.name().parse::<IntegrationUnit>().unwrap(), unit);
        }
        assert!("furlong".parse::<IntegrationUnit>().is_err());
    }
}
