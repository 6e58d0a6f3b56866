//! Integration settings of a configuration.
//!
//! [`IntegrationSettings`] is the complete option record of a
//! [`Configuration`](crate::Configuration); it reads and writes as JSON.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xrdpix_calib::integrator::DEFAULT_AZIMUTH_POINTS;
use xrdpix_calib::{CakeOptions, IntegrationOptions};
use xrdpix_core::IntegrationUnit;
use xrdpix_io::PatternFormat;

use crate::{Error, Result};

/// Options controlling integration, display hints and auto-save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    /// Radial unit of the integrated pattern.
    pub integration_unit: IntegrationUnit,
    /// Fixed number of pattern bins; `None` uses the detector diagonal.
    pub integration_num_points: Option<usize>,
    /// Number of azimuthal cake bins.
    pub cake_azimuth_points: usize,
    /// Azimuthal extent of the cake in degrees.
    pub cake_azimuth_range: Option<(f64, f64)>,
    /// Integrate the pattern whenever the image changes.
    pub auto_integrate_pattern: bool,
    /// Integrate the cake whenever the image changes.
    pub auto_integrate_cake: bool,
    /// Exclude masked pixels.
    pub use_mask: bool,
    /// Display hint only.
    pub transparent_mask: bool,
    /// Write pattern files after each integration.
    pub auto_save_integrated_pattern: bool,
    /// Formats written by auto-save.
    pub integrated_patterns_file_formats: BTreeSet<PatternFormat>,
    /// Weight pixels by their solid angle.
    pub correct_solid_angle: bool,
    /// Polarization factor; `None` disables the correction.
    pub polarization_factor: Option<f64>,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            integration_unit: IntegrationUnit::TwoTheta,
            integration_num_points: None,
            cake_azimuth_points: DEFAULT_AZIMUTH_POINTS,
            cake_azimuth_range: None,
            auto_integrate_pattern: true,
            auto_integrate_cake: false,
            use_mask: false,
            transparent_mask: false,
            auto_save_integrated_pattern: false,
            integrated_patterns_file_formats: BTreeSet::from([PatternFormat::Xy]),
            correct_solid_angle: true,
            polarization_factor: None,
        }
    }
}

impl IntegrationSettings {
    /// Creates settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a JSON file. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// values are rejected by [`IntegrationSettings::validate`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let settings: Self = serde_json::from_reader(reader)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a JSON string.
    ///
    /// # Errors
    /// Returns an error for malformed JSON or rejected values.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for zero bin counts, an empty azimuth range
    /// or a polarization factor outside `[-1, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.integration_num_points == Some(0) {
            return Err(Error::InvalidParameter(
                "integration_num_points must be positive".into(),
            ));
        }
        if self.cake_azimuth_points == 0 {
            return Err(Error::InvalidParameter(
                "cake_azimuth_points must be positive".into(),
            ));
        }
        if let Some((lo, hi)) = self.cake_azimuth_range {
            if lo.partial_cmp(&hi) != Some(std::cmp::Ordering::Less) {
                return Err(Error::InvalidParameter(format!(
                    "cake_azimuth_range ({lo}, {hi}) is empty"
                )));
            }
        }
        if let Some(f) = self.polarization_factor {
            if !(-1.0..=1.0).contains(&f) {
                return Err(Error::InvalidParameter(format!(
                    "polarization_factor {f} outside [-1, 1]"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn with_integration_unit(mut self, unit: IntegrationUnit) -> Self {
        self.integration_unit = unit;
        self
    }

    #[must_use]
    pub fn with_integration_num_points(mut self, points: Option<usize>) -> Self {
        self.integration_num_points = points;
        self
    }

    #[must_use]
    pub fn with_cake_azimuth_points(mut self, points: usize) -> Self {
        self.cake_azimuth_points = points;
        self
    }

    #[must_use]
    pub fn with_cake_azimuth_range(mut self, range: Option<(f64, f64)>) -> Self {
        self.cake_azimuth_range = range;
        self
    }

    #[must_use]
    pub fn with_auto_integrate_pattern(mut self, enabled: bool) -> Self {
        self.auto_integrate_pattern = enabled;
        self
    }

    #[must_use]
    pub fn with_auto_integrate_cake(mut self, enabled: bool) -> Self {
        self.auto_integrate_cake = enabled;
        self
    }

    #[must_use]
    pub fn with_use_mask(mut self, enabled: bool) -> Self {
        self.use_mask = enabled;
        self
    }

    #[must_use]
    pub fn with_auto_save_integrated_pattern(mut self, enabled: bool) -> Self {
        self.auto_save_integrated_pattern = enabled;
        self
    }

    #[must_use]
    pub fn with_integrated_patterns_file_formats(
        mut self,
        formats: impl IntoIterator<Item = PatternFormat>,
    ) -> Self {
        self.integrated_patterns_file_formats = formats.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_correct_solid_angle(mut self, enabled: bool) -> Self {
        self.correct_solid_angle = enabled;
        self
    }

    #[must_use]
    pub fn with_polarization_factor(mut self, factor: Option<f64>) -> Self {
        self.polarization_factor = factor;
        self
    }

    /// Integrator options for the 1D pattern.
    #[must_use]
    pub fn pattern_options(&self) -> IntegrationOptions {
        IntegrationOptions::default()
            .with_unit(self.integration_unit)
            .with_num_points(self.integration_num_points)
            .with_correct_solid_angle(self.correct_solid_angle)
            .with_polarization_factor(self.polarization_factor)
    }

    /// Integrator options for the cake.
    #[must_use]
    pub fn cake_options(&self) -> CakeOptions {
        CakeOptions::default()
            .with_radial_points(self.integration_num_points)
            .with_azimuth_points(self.cake_azimuth_points)
            .with_azimuth_range(self.cake_azimuth_range)
            .with_correct_solid_angle(self.correct_solid_angle)
            .with_polarization_factor(self.polarization_factor)
    }

    /// True if switching from `self` to `other` changes the integrated pattern.
    pub(crate) fn pattern_differs(&self, other: &Self) -> bool {
        self.integration_num_points != other.integration_num_points
            || self.use_mask != other.use_mask
            || self.correct_solid_angle != other.correct_solid_angle
            || self.polarization_factor != other.polarization_factor
    }

    /// True if switching from `self` to `other` changes the cake.
    pub(crate) fn cake_differs(&self, other: &Self) -> bool {
        self.pattern_differs(other)
            || self.cake_azimuth_points != other.cake_azimuth_points
            || self.cake_azimuth_range != other.cake_azimuth_range
    }
}

/// Folders used by file dialogs and auto-save. `None` means unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingDirectories {
    pub image: Option<PathBuf>,
    pub calibration: Option<PathBuf>,
    pub mask: Option<PathBuf>,
    /// Destination of auto-saved patterns.
    pub pattern: Option<PathBuf>,
    pub overlay: Option<PathBuf>,
    pub phase: Option<PathBuf>,
}

impl WorkingDirectories {
    /// Keys used in session files, in storage order.
    pub const KEYS: [&'static str; 6] = ["image", "calibration", "mask", "pattern", "overlay", "phase"];

    /// Folder stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Path> {
        match key {
            "image" => self.image.as_deref(),
            "calibration" => self.calibration.as_deref(),
            "mask" => self.mask.as_deref(),
            "pattern" => self.pattern.as_deref(),
            "overlay" => self.overlay.as_deref(),
            "phase" => self.phase.as_deref(),
            _ => None,
        }
    }

    /// Store a folder under `key`; an empty path clears it.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for an unknown key.
    pub fn set(&mut self, key: &str, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let value = if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        };
        let slot = match key {
            "image" => &mut self.image,
            "calibration" => &mut self.calibration,
            "mask" => &mut self.mask,
            "pattern" => &mut self.pattern,
            "overlay" => &mut self.overlay,
            "phase" => &mut self.phase,
            other => {
                return Err(Error::InvalidParameter(format!(
                    "unknown working directory '{other}'"
                )))
            }
        };
        *slot = value;
        Ok(())
    }
}
