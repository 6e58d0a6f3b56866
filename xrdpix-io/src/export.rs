//! Integrated pattern exporters: `.xy`, `.dat`, `.chi` and GSAS `.fxye`.

use std::fmt::{self, Write as _};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::info;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use xrdpix_core::pattern::xy_text;
use xrdpix_core::IntegrationUnit;

use crate::{Error, Result};

/// Export format of an integrated pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatternFormat {
    Xy,
    Chi,
    Dat,
    Fxye,
}

impl PatternFormat {
    /// All formats.
    pub const ALL: [PatternFormat; 4] = [
        PatternFormat::Xy,
        PatternFormat::Chi,
        PatternFormat::Dat,
        PatternFormat::Fxye,
    ];

    /// File extension including the dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            PatternFormat::Xy => ".xy",
            PatternFormat::Chi => ".chi",
            PatternFormat::Dat => ".dat",
            PatternFormat::Fxye => ".fxye",
        }
    }

    /// Format implied by a path's extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        format!(".{ext}").parse().ok()
    }
}

impl fmt::Display for PatternFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for PatternFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.trim_start_matches('.') {
            "xy" => Ok(PatternFormat::Xy),
            "chi" => Ok(PatternFormat::Chi),
            "dat" => Ok(PatternFormat::Dat),
            "fxye" => Ok(PatternFormat::Fxye),
            other => Err(Error::InvalidFormat(format!("unknown pattern format '{other}'"))),
        }
    }
}

#[cfg(feature = "serde")]
impl Serialize for PatternFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.extension())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for PatternFormat {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Context written into exported headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportHeader {
    /// Source image file name.
    pub source: String,
    /// Radial unit of `x`.
    pub unit: IntegrationUnit,
    /// Wavelength in metres.
    pub wavelength: Option<f64>,
    /// Calibration description, one `Key: value` per line.
    pub calibration: String,
}

impl ExportHeader {
    fn commented(&self) -> String {
        let mut out = String::new();
        if !self.source.is_empty() {
            let _ = writeln!(out, "File: {}", self.source);
        }
        for line in self.calibration.lines().filter(|l| !l.trim().is_empty()) {
            let _ = writeln!(out, "{}", line.trim_start_matches('#').trim());
        }
        let _ = write!(out, "{}\tIntensity", self.unit.name());
        out
    }
}

/// Render a pattern in the given format.
///
/// # Errors
/// Returns `InvalidFormat` if `x` and `y` differ in length, or for a `.fxye`
/// export of a d-spacing pattern or of fewer than two points.
pub fn pattern_text(
    format: PatternFormat,
    x: &[f64],
    y: &[f64],
    header: &ExportHeader,
) -> Result<String> {
    if x.len() != y.len() {
        return Err(Error::InvalidFormat(format!(
            "x has {} points but y has {}",
            x.len(),
            y.len()
        )));
    }
    match format {
        PatternFormat::Xy | PatternFormat::Dat => Ok(xy_text(x, y, Some(&header.commented()))),
        PatternFormat::Chi => Ok(chi_text(x, y, header)),
        PatternFormat::Fxye => fxye_text(x, y, header),
    }
}

fn chi_text(x: &[f64], y: &[f64], header: &ExportHeader) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", header.source);
    let _ = writeln!(out, "{}", header.unit.label());
    match header.wavelength {
        Some(w) => {
            let _ = writeln!(out, "wavelength= {w:e}");
        }
        None => {
            let _ = writeln!(out, "wavelength=");
        }
    }
    out.push('\n');
    for (a, b) in x.iter().zip(y) {
        let _ = writeln!(out, "{a:.10e}  {b:.10e}");
    }
    out
}

#[allow(clippy::cast_precision_loss)]
fn fxye_text(x: &[f64], y: &[f64], header: &ExportHeader) -> Result<String> {
    let (kind, scale) = match header.unit {
        IntegrationUnit::TwoTheta => ("CONS", 100.0),
        IntegrationUnit::Q => ("CONQ", 1.0),
        IntegrationUnit::D => {
            return Err(Error::InvalidFormat(
                "fxye export needs a 2θ or Q axis".to_string(),
            ))
        }
    };
    if x.len() < 2 {
        return Err(Error::InvalidFormat("fxye export needs two or more points".into()));
    }
    let n = x.len();
    let step = (x[n - 1] - x[0]) / (n - 1) as f64;
    let lambda_angstrom = header.wavelength.unwrap_or(0.0) * 1e10;

    let mut out = String::new();
    let title = if header.source.is_empty() {
        "xrdpix pattern"
    } else {
        header.source.as_str()
    };
    let _ = writeln!(out, "{title}");
    for line in header.calibration.lines().filter(|l| !l.trim().is_empty()) {
        let _ = writeln!(out, "# {}", line.trim_start_matches('#').trim());
    }
    let _ = writeln!(
        out,
        "BANK 1 {n} {n} {kind} {:.6} {:.6} {lambda_angstrom:.6} 0.0 FXYE",
        x[0] * scale,
        step * scale
    );
    for (a, b) in x.iter().zip(y) {
        let _ = writeln!(out, "{:.6} {:.6} {:.6}", a * scale, b, b.abs().sqrt());
    }
    Ok(out)
}

/// Write a pattern file; the format follows the extension of `path`.
///
/// # Errors
/// Returns `InvalidFormat` for an unknown extension, or an I/O error.
pub fn write_pattern<P: AsRef<Path>>(
    path: P,
    x: &[f64],
    y: &[f64],
    header: &ExportHeader,
) -> Result<()> {
    let path = path.as_ref();
    let format = PatternFormat::from_path(path).ok_or_else(|| {
        Error::InvalidFormat(format!("no pattern format for {}", path.display()))
    })?;
    fs::write(path, pattern_text(format, x, y, header)?)?;
    info!("saved pattern {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header() -> ExportHeader {
        ExportHeader {
            source: "frame_001.tif".into(),
            unit: IntegrationUnit::TwoTheta,
            wavelength: Some(3.1e-11),
            calibration: "Distance: 0.2\nPoni1: 0.1\n".into(),
        }
    }

    #[test]
    fn test_chi_has_four_header_lines() {
        let text = pattern_text(PatternFormat::Chi, &[1.0, 2.0], &[3.0, 4.0], &header()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "frame_001.tif");
        assert_eq!(lines[1], IntegrationUnit::TwoTheta.label());
        assert!(lines[2].starts_with("wavelength="));
        assert_eq!(lines[3], "");
        assert_eq!(lines.len(), 6);
        let cols: Vec<f64> = lines[4]
            .split_whitespace()
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(cols, vec![1.0, 3.0]);
    }

    #[test]
    fn test_xy_is_commented() {
        let text = pattern_text(PatternFormat::Xy, &[1.0, 2.0], &[3.0, 4.0], &header()).unwrap();
        let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(data.len(), 2);
        assert!(text.contains("# Distance: 0.2"));
    }

    #[test]
    fn test_fxye_bank_line() {
        let x = [10.0, 10.02, 10.04];
        let y = [4.0, 9.0, 16.0];
        let text = pattern_text(PatternFormat::Fxye, &x, &y, &header()).unwrap();
        let bank = text.lines().find(|l| l.starts_with("BANK")).unwrap();
        let fields: Vec<&str> = bank.split_whitespace().collect();
        assert_eq!(&fields[..5], &["BANK", "1", "3", "3", "CONS"]);
        assert!((fields[5].parse::<f64>().unwrap() - 1000.0).abs() < 1e-6);
        assert!((fields[6].parse::<f64>().unwrap() - 2.0).abs() < 1e-6);
        assert!((fields[7].parse::<f64>().unwrap() - 0.31).abs() < 1e-6);
        let last: Vec<f64> = text
            .lines()
            .last()
            .unwrap()
            .split_whitespace()
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(last, vec![1004.0, 16.0, 4.0]);

        let d = ExportHeader {
            unit: IntegrationUnit::D,
            ..header()
        };
        assert!(pattern_text(PatternFormat::Fxye, &x, &y, &d).is_err());
    }

    #[test]
    fn test_write_by_extension() {
        let dir = tempdir().unwrap();
        for format in PatternFormat::ALL {
            let path = dir.path().join(format!("p{}", format.extension()));
            write_pattern(&path, &[1.0, 2.0], &[5.0, 6.0], &header()).unwrap();
            assert!(path.exists());
        }
        let bad = dir.path().join("p.txt");
        assert!(write_pattern(&bad, &[1.0], &[1.0], &header()).is_err());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(".XY".parse::<PatternFormat>().unwrap(), PatternFormat::Xy);
        assert_eq!("fxye".parse::<PatternFormat>().unwrap(), PatternFormat::Fxye);
        assert!("png".parse::<PatternFormat>().is_err());
    }
}
