//! Calibrant standards: lists of known d-spacings.

use std::fs;
use std::path::Path;

use log::info;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A calibrant with d-spacings (Å) sorted from largest to smallest, so that
/// ring indices follow increasing 2θ.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Calibrant {
    name: String,
    d_spacings: Vec<f64>,
}

impl Calibrant {
    /// Create a calibrant from d-spacings in Å.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the list is empty or holds a
    /// non-positive value.
    pub fn new(name: impl Into<String>, mut d_spacings: Vec<f64>) -> Result<Self> {
        if d_spacings.is_empty() {
            return Err(Error::InvalidParameter("calibrant has no reflections".into()));
        }
        if let Some(bad) = d_spacings.iter().find(|d| !(d.is_finite() && **d > 0.0)) {
            return Err(Error::InvalidParameter(format!("invalid d-spacing {bad}")));
        }
        d_spacings.sort_by(|a, b| b.total_cmp(a));
        d_spacings.dedup();
        Ok(Self {
            name: name.into(),
            d_spacings,
        })
    }

    /// Parse calibrant text: the first column of every non-comment line is a
    /// d-spacing in Å.
    ///
    /// # Errors
    /// Returns `InvalidFormat` on an unparsable line.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self> {
        let mut d = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some(first) = line.split_whitespace().next() else {
                continue;
            };
            let value = first.parse::<f64>().map_err(|_| {
                Error::InvalidFormat(format!("calibrant line {}: '{first}'", lineno + 1))
            })?;
            d.push(value);
        }
        Self::new(name, d)
    }

    /// Load a calibrant file; the name is the file stem.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let calibrant = Self::parse(name, &text)?;
        info!(
            "loaded calibrant '{}' with {} reflections",
            calibrant.name,
            calibrant.d_spacings.len()
        );
        Ok(calibrant)
    }

    /// Calibrant name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// d-spacings in Å, largest first.
    #[must_use]
    pub fn d_spacings(&self) -> &[f64] {
        &self.d_spacings
    }

    /// Number of rings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.d_spacings.len()
    }

    /// Always false for a constructed calibrant.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.d_spacings.is_empty()
    }

    /// 2θ (radians) of ring `index`, or `None` if the ring is out of range or
    /// unreachable at this wavelength (metres).
    #[must_use]
    pub fn ring_tth(&self, index: usize, wavelength: f64) -> Option<f64> {
        let d = *self.d_spacings.get(index)?;
        let s = wavelength * 1e10 / (2.0 * d);
        (s > 0.0 && s <= 1.0).then(|| 2.0 * s.asin())
    }

    /// 2θ in degrees of every ring reachable at this wavelength (metres).
    #[must_use]
    pub fn two_theta(&self, wavelength: f64) -> Vec<f64> {
        (0..self.d_spacings.len())
            .map_while(|i| self.ring_tth(i, wavelength).map(f64::to_degrees))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sorted_and_two_theta() {
        let c = Calibrant::new("x", vec![1.0, 3.0, 2.0]).unwrap();
        assert_eq!(c.d_spacings(), &[3.0, 2.0, 1.0]);
        let tth = c.two_theta(1e-10);
        assert_eq!(tth.len(), 3);
        assert_relative_eq!(tth[0], 2.0 * (1.0f64 / 6.0).asin().to_degrees(), epsilon = 1e-12);
        assert!(tth.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_unreachable_rings_dropped() {
        let c = Calibrant::new("x", vec![3.0, 0.4]).unwrap();
        // λ = 1 Å cannot reach d < 0.5 Å
        assert_eq!(c.two_theta(1e-10).len(), 1);
        assert!(c.ring_tth(1, 1e-10).is_none());
        assert!(c.ring_tth(5, 1e-10).is_none());
    }

    #[test]
    fn test_load_file_with_comments() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# CeO2").unwrap();
        writeln!(file, "3.1243 # (111) 100").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "2.7057 (200) 30").unwrap();
        let c = Calibrant::load(file.path()).unwrap();
        assert_eq!(c.len(), 2);
        assert_relative_eq!(c.d_spacings()[1], 2.7057);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Calibrant::new("x", vec![]).is_err());
        assert!(Calibrant::new("x", vec![1.0, -2.0]).is_err());
        assert!(matches!(
            Calibrant::parse("x", "abc\n"),
            Err(Error::InvalidFormat(_))
        ));
    }
}
