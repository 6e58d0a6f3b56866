//! PONI detector geometry parameters and their text file format.
//!
//! A PONI file is a list of `Key: value` lines. Both the plain layout
//! (`PixelSize1`/`PixelSize2`) and the versioned layout that stores pixel
//! sizes in a `Detector_config` JSON object are accepted on read; writes
//! always use the plain layout.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use log::{debug, info};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Detector geometry in the point-of-normal-incidence convention.
///
/// All lengths are in metres and all angles in radians. Axis 1 runs along
/// image rows (y), axis 2 along image columns (x).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoniParameters {
    /// Detector name.
    pub detector: String,
    /// Sample to detector distance along the detector normal.
    pub distance: f64,
    /// Point of normal incidence along axis 1.
    pub poni1: f64,
    /// Point of normal incidence along axis 2.
    pub poni2: f64,
    pub rot1: f64,
    pub rot2: f64,
    pub rot3: f64,
    /// Pixel pitch along axis 1.
    pub pixel1: f64,
    /// Pixel pitch along axis 2.
    pub pixel2: f64,
    /// X-ray wavelength.
    pub wavelength: f64,
}

impl Default for PoniParameters {
    fn default() -> Self {
        Self {
            detector: "Detector".to_string(),
            distance: 0.2,
            poni1: 0.0,
            poni2: 0.0,
            rot1: 0.0,
            rot2: 0.0,
            rot3: 0.0,
            pixel1: 1e-4,
            pixel2: 1e-4,
            wavelength: 3.1e-11,
        }
    }
}

impl PoniParameters {
    /// Set the detector distance.
    #[must_use]
    pub fn with_distance(mut self, distance: f64) -> Self {
        self.distance = distance;
        self
    }

    /// Set the point of normal incidence.
    #[must_use]
    pub fn with_poni(mut self, poni1: f64, poni2: f64) -> Self {
        self.poni1 = poni1;
        self.poni2 = poni2;
        self
    }

    /// Set the three detector rotations.
    #[must_use]
    pub fn with_rotations(mut self, rot1: f64, rot2: f64, rot3: f64) -> Self {
        self.rot1 = rot1;
        self.rot2 = rot2;
        self.rot3 = rot3;
        self
    }

    /// Set the pixel pitches.
    #[must_use]
    pub fn with_pixel_size(mut self, pixel1: f64, pixel2: f64) -> Self {
        self.pixel1 = pixel1;
        self.pixel2 = pixel2;
        self
    }

    /// Set the wavelength.
    #[must_use]
    pub fn with_wavelength(mut self, wavelength: f64) -> Self {
        self.wavelength = wavelength;
        self
    }

    /// Copy with pixel pitches divided by the supersampling factor.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn supersampled(&self, n: usize) -> Self {
        let n = n.max(1) as f64;
        Self {
            pixel1: self.pixel1 / n,
            pixel2: self.pixel2 / n,
            ..self.clone()
        }
    }

    /// Checks that distance, pixel pitches and wavelength are usable.
    ///
    /// # Errors
    /// Returns `InvalidParameter` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("distance", self.distance),
            ("pixel1", self.pixel1),
            ("pixel2", self.pixel2),
            ("wavelength", self.wavelength),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::InvalidParameter(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("poni1", self.poni1),
            ("poni2", self.poni2),
            ("rot1", self.rot1),
            ("rot2", self.rot2),
            ("rot3", self.rot3),
        ] {
            if !value.is_finite() {
                return Err(Error::InvalidParameter(format!("{name} is not finite")));
            }
        }
        Ok(())
    }

    /// Parse the contents of a PONI file.
    ///
    /// # Errors
    /// Returns `InvalidFormat` for unparsable numbers or missing keys, and
    /// `DetectorConfig` if a `Detector_config` entry is not valid JSON.
    pub fn parse(text: &str) -> Result<Self> {
        let mut detector = None;
        let mut distance = None;
        let mut poni1 = None;
        let mut poni2 = None;
        let mut rot = [0.0; 3];
        let mut pixel1 = None;
        let mut pixel2 = None;
        let mut wavelength = None;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(Error::InvalidFormat(format!(
                    "line {}: expected 'key: value'",
                    lineno + 1
                )));
            };
            let value = value.trim();
            let number = || -> Result<f64> {
                value.parse::<f64>().map_err(|_| {
                    Error::InvalidFormat(format!("line {}: bad value for {key}: '{value}'", lineno + 1))
                })
            };
            match key.trim() {
                "Detector" => detector = Some(value.to_string()),
                "Detector_config" => {
                    let config: serde_json::Value = serde_json::from_str(value)?;
                    if let Some(p) = config.get("pixel1").and_then(serde_json::Value::as_f64) {
                        pixel1 = Some(p);
                    }
                    if let Some(p) = config.get("pixel2").and_then(serde_json::Value::as_f64) {
                        pixel2 = Some(p);
                    }
                }
                "PixelSize1" | "Pixel1" => pixel1 = Some(number()?),
                "PixelSize2" | "Pixel2" => pixel2 = Some(number()?),
                "Distance" => distance = Some(number()?),
                "Poni1" => poni1 = Some(number()?),
                "Poni2" => poni2 = Some(number()?),
                "Rot1" => rot[0] = number()?,
                "Rot2" => rot[1] = number()?,
                "Rot3" => rot[2] = number()?,
                "Wavelength" => wavelength = Some(number()?),
                other => debug!("ignoring PONI key '{other}'"),
            }
        }

        let require = |v: Option<f64>, name: &str| {
            v.ok_or_else(|| Error::InvalidFormat(format!("missing PONI key {name}")))
        };
        let params = Self {
            detector: detector
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| "Detector".to_string()),
            distance: require(distance, "Distance")?,
            poni1: require(poni1, "Poni1")?,
            poni2: require(poni2, "Poni2")?,
            rot1: rot[0],
            rot2: rot[1],
            rot3: rot[2],
            pixel1: require(pixel1, "PixelSize1")?,
            pixel2: require(pixel2, "PixelSize2")?,
            wavelength: require(wavelength, "Wavelength")?,
        };
        params
            .validate()
            .map_err(|e| Error::InvalidFormat(e.to_string()))?;
        Ok(params)
    }

    /// Render as PONI text with an optional free-text comment header.
    #[must_use]
    pub fn to_poni_string(&self, comment: &str) -> String {
        let mut out = String::from("# Nota: C-Order, 1 refers to the Y axis, 2 to the X axis\n");
        for line in comment.lines() {
            let _ = writeln!(out, "# {line}");
        }
        let _ = writeln!(out, "Detector: {}", self.detector);
        let _ = writeln!(out, "PixelSize1: {}", self.pixel1);
        let _ = writeln!(out, "PixelSize2: {}", self.pixel2);
        let _ = writeln!(out, "Distance: {}", self.distance);
        let _ = writeln!(out, "Poni1: {}", self.poni1);
        let _ = writeln!(out, "Poni2: {}", self.poni2);
        let _ = writeln!(out, "Rot1: {}", self.rot1);
        let _ = writeln!(out, "Rot2: {}", self.rot2);
        let _ = writeln!(out, "Rot3: {}", self.rot3);
        let _ = writeln!(out, "Wavelength: {}", self.wavelength);
        out
    }

    /// Read a PONI file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let params = Self::parse(&text)?;
        info!("loaded calibration from {}", path.as_ref().display());
        Ok(params)
    }

    /// Write a PONI file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write<P: AsRef<Path>>(&self, path: P, comment: &str) -> Result<()> {
        fs::write(path.as_ref(), self.to_poni_string(comment))?;
        info!("saved calibration to {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PoniParameters {
        PoniParameters::default()
            .with_distance(0.1985)
            .with_poni(0.0512, 0.0498)
            .with_rotations(0.01, -0.002, 0.0)
            .with_pixel_size(7.9e-5, 7.9e-5)
            .with_wavelength(3.344e-11)
    }

    #[test]
    fn test_text_round_trip_is_exact() {
        let params = sample();
        let text = params.to_poni_string("Calibration done with CeO2\nsecond line");
        let parsed = PoniParameters::parse(&text).unwrap();
        assert_eq!(parsed, params);
        let keys = text.lines().filter(|l| !l.starts_with('#')).count();
        assert_eq!(keys, 10);
    }

    #[test]
    fn test_versioned_layout_with_detector_config() {
        let text = "# Nota\nponi_version: 2\nDetector: Pilatus1M\n\
                    Detector_config: {\"pixel1\": 0.000172, \"pixel2\": 0.000172, \"max_shape\": [1043, 981]}\n\
                    Distance: 0.3\nPoni1: 0.08\nPoni2: 0.09\nRot1: 0\nRot2: 0\nRot3: 0\n\
                    Wavelength: 1e-10\n";
        let params = PoniParameters::parse(text).unwrap();
        assert_eq!(params.detector, "Pilatus1M");
        assert!((params.pixel1 - 1.72e-4).abs() < 1e-12);
        assert!((params.distance - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_missing_and_malformed_keys() {
        let missing = "Distance: 0.1\nPoni1: 0\nPoni2: 0\nPixel1: 1e-4\nPixel2: 1e-4\n";
        assert!(matches!(
            PoniParameters::parse(missing),
            Err(Error::InvalidFormat(_))
        ));
        let bad = "Distance: abc\n";
        assert!(matches!(PoniParameters::parse(bad), Err(Error::InvalidFormat(_))));
        let bad_json = "Detector_config: {pixel1\n";
        assert!(matches!(
            PoniParameters::parse(bad_json),
            Err(Error::DetectorConfig(_))
        ));
    }

    #[test]
    fn test_supersampled_scales_pixels_only() {
        let params = sample();
        let s = params.supersampled(2);
        assert!((s.pixel1 - params.pixel1 / 2.0).abs() < 1e-18);
        assert!((s.pixel2 - params.pixel2 / 2.0).abs() < 1e-18);
        assert_eq!(s.poni1, params.poni1);
        assert_eq!(s.distance, params.distance);
    }

    #[test]
    fn test_validate_rejects_zero_wavelength() {
        assert!(PoniParameters::default().with_wavelength(0.0).validate().is_err());
        assert!(PoniParameters::default().validate().is_ok());
    }
}
