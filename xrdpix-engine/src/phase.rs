//! Crystallographic phases with a pressure/temperature equation of state.
//!
//! Phases are read from JCPDS files. Two layouts are understood:
//!
//! * version 4, a `KEY: value` file with one `DIHKL:` line per reflection;
//! * the legacy numeric layout (versions 1 to 3): version, comment,
//!   `symmetry k0 k0p`, the cell parameters, then `d I h k l` rows.
//!
//! The unit-cell volume follows a third-order Birch–Murnaghan equation of
//! state with linear thermal expansion; d-spacings scale isotropically with
//! `(V/V0)^(1/3)`.

use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};
use xrdpix_core::IntegrationUnit;

use crate::{Error, Result};

/// Reference temperature of the ambient cell, kelvin.
pub const REFERENCE_TEMPERATURE: f64 = 298.0;

const MIN_COMPRESSION: f64 = 0.2;
const MAX_EXPANSION: f64 = 2.0;

/// Crystal system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Symmetry {
    #[default]
    Cubic,
    Hexagonal,
    Tetragonal,
    Orthorhombic,
    Monoclinic,
    Triclinic,
    Rhombohedral,
}

impl Symmetry {
    fn from_legacy_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Symmetry::Cubic),
            2 => Some(Symmetry::Hexagonal),
            3 => Some(Symmetry::Tetragonal),
            4 => Some(Symmetry::Orthorhombic),
            5 => Some(Symmetry::Monoclinic),
            6 => Some(Symmetry::Triclinic),
            7 => Some(Symmetry::Rhombohedral),
            _ => None,
        }
    }

    /// Keyword used in version 4 files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Symmetry::Cubic => "CUBIC",
            Symmetry::Hexagonal => "HEXAGONAL",
            Symmetry::Tetragonal => "TETRAGONAL",
            Symmetry::Orthorhombic => "ORTHORHOMBIC",
            Symmetry::Monoclinic => "MONOCLINIC",
            Symmetry::Triclinic => "TRICLINIC",
            Symmetry::Rhombohedral => "RHOMBOHEDRAL",
        }
    }
}

impl fmt::Display for Symmetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Symmetry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CUBIC" => Ok(Symmetry::Cubic),
            "HEXAGONAL" => Ok(Symmetry::Hexagonal),
            "TETRAGONAL" => Ok(Symmetry::Tetragonal),
            "ORTHORHOMBIC" => Ok(Symmetry::Orthorhombic),
            "MONOCLINIC" => Ok(Symmetry::Monoclinic),
            "TRICLINIC" => Ok(Symmetry::Triclinic),
            "RHOMBOHEDRAL" | "TRIGONAL" => Ok(Symmetry::Rhombohedral),
            other => Err(Error::InvalidFormat(format!("unknown symmetry '{other}'"))),
        }
    }
}

/// Ambient unit cell, Å and degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitCell {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl UnitCell {
    /// Cubic cell of edge `a`.
    #[must_use]
    pub fn cubic(a: f64) -> Self {
        Self {
            a,
            b: a,
            c: a,
            alpha: 90.0,
            beta: 90.0,
            gamma: 90.0,
        }
    }

    /// Complete the cell from the parameters a file gives for `symmetry`.
    fn complete(symmetry: Symmetry, mut cell: UnitCell) -> Self {
        match symmetry {
            Symmetry::Cubic => UnitCell::cubic(cell.a),
            Symmetry::Tetragonal => {
                cell.b = cell.a;
                cell.alpha = 90.0;
                cell.beta = 90.0;
                cell.gamma = 90.0;
                cell
            }
            Symmetry::Hexagonal => {
                cell.b = cell.a;
                cell.alpha = 90.0;
                cell.beta = 90.0;
                cell.gamma = 120.0;
                cell
            }
            Symmetry::Orthorhombic => {
                cell.alpha = 90.0;
                cell.beta = 90.0;
                cell.gamma = 90.0;
                cell
            }
            Symmetry::Monoclinic => {
                cell.alpha = 90.0;
                cell.gamma = 90.0;
                cell
            }
            Symmetry::Rhombohedral => {
                cell.b = cell.a;
                cell.c = cell.a;
                cell.beta = cell.alpha;
                cell.gamma = cell.alpha;
                cell
            }
            Symmetry::Triclinic => cell,
        }
    }

    /// Cell volume in Å³.
    #[must_use]
    pub fn volume(&self) -> f64 {
        let (ca, cb, cg) = (
            self.alpha.to_radians().cos(),
            self.beta.to_radians().cos(),
            self.gamma.to_radians().cos(),
        );
        self.a
            * self.b
            * self.c
            * (1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg).sqrt()
    }
}

/// Equation of state parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EosParameters {
    /// Bulk modulus, GPa. Zero disables compression.
    pub k0: f64,
    /// Pressure derivative of the bulk modulus.
    pub k0p: f64,
    /// Temperature derivative of `k0`, GPa/K.
    pub dk0dt: f64,
    /// Temperature derivative of `k0p`, 1/K.
    pub dk0pdt: f64,
    /// Volumetric thermal expansion at the reference temperature, 1/K.
    pub alpha_t0: f64,
    /// Temperature derivative of the expansion coefficient, 1/K².
    pub d_alpha_dt: f64,
}

/// One reflection of a phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reflection {
    /// Ambient d-spacing, Å.
    pub d0: f64,
    /// Relative intensity.
    pub intensity: f64,
    pub h: i32,
    pub k: i32,
    pub l: i32,
}

impl Reflection {
    #[must_use]
    pub fn new(d0: f64, intensity: f64, hkl: (i32, i32, i32)) -> Self {
        Self {
            d0,
            intensity,
            h: hkl.0,
            k: hkl.1,
            l: hkl.2,
        }
    }
}

/// Position of a reflection in a pattern unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectionPosition {
    pub position: f64,
    pub intensity: f64,
    pub hkl: (i32, i32, i32),
}

/// Third-order Birch–Murnaghan pressure at compression `x = V/V0`.
#[must_use]
pub fn birch_murnaghan(x: f64, k0: f64, k0p: f64) -> f64 {
    let f = x.powf(-2.0 / 3.0);
    1.5 * k0 * (f.powf(3.5) - f.powf(2.5)) * (1.0 + 0.75 * (k0p - 4.0) * (f - 1.0))
}

/// `V/V0` at `pressure`, by bisection on the monotonic branch of the EoS.
fn compression(pressure: f64, k0: f64, k0p: f64) -> Result<f64> {
    if pressure == 0.0 || k0 <= 0.0 {
        return Ok(1.0);
    }
    let f = |x: f64| birch_murnaghan(x, k0, k0p) - pressure;
    let (mut lo, mut hi) = if pressure > 0.0 {
        (MIN_COMPRESSION, 1.0)
    } else {
        (1.0, MAX_EXPANSION)
    };
    if f(lo).signum() == f(hi).signum() {
        return Err(Error::InvalidParameter(format!(
            "pressure {pressure} GPa outside the equation of state range"
        )));
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if f(mid).signum() == f(lo).signum() {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-14 {
            break;
        }
    }
    Ok(0.5 * (lo + hi))
}

/// A crystallographic phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    name: String,
    filename: Option<PathBuf>,
    comments: Vec<String>,
    symmetry: Symmetry,
    cell: UnitCell,
    v0: f64,
    eos: EosParameters,
    reflections: Vec<Reflection>,
    pressure: f64,
    temperature: f64,
}

impl Phase {
    /// A phase at ambient conditions.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a non-positive cell volume.
    pub fn new(
        name: impl Into<String>,
        symmetry: Symmetry,
        cell: UnitCell,
        eos: EosParameters,
        reflections: Vec<Reflection>,
    ) -> Result<Self> {
        let cell = UnitCell::complete(symmetry, cell);
        let v0 = cell.volume();
        if !(v0.is_finite() && v0 > 0.0) {
            return Err(Error::InvalidParameter(format!("unit cell volume {v0}")));
        }
        Ok(Self {
            name: name.into(),
            filename: None,
            comments: Vec::new(),
            symmetry,
            cell,
            v0,
            eos,
            reflections,
            pressure: 0.0,
            temperature: REFERENCE_TEMPERATURE,
        })
    }

    /// Read a JCPDS file; the phase is named after the file stem.
    ///
    /// # Errors
    /// Returns an I/O error or `InvalidFormat` for malformed content.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut phase = Self::parse_jcpds(&name, &fs::read_to_string(path)?)?;
        phase.filename = Some(path.to_path_buf());
        info!(
            "loaded phase '{}' ({} reflections)",
            phase.name,
            phase.reflections.len()
        );
        Ok(phase)
    }

    /// Parse JCPDS text of either layout.
    ///
    /// # Errors
    /// Returns `InvalidFormat` for malformed content.
    pub fn parse_jcpds(name: &str, text: &str) -> Result<Self> {
        let first = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| Error::InvalidFormat("empty JCPDS file".into()))?;
        if first.trim_start().to_ascii_uppercase().starts_with("VERSION") {
            parse_v4(name, text)
        } else {
            parse_legacy(name, text)
        }
    }

    /// Serialize as a version 4 JCPDS file.
    #[must_use]
    pub fn to_jcpds_string(&self) -> String {
        let mut out = String::from("VERSION: 4\n");
        for comment in &self.comments {
            let _ = writeln!(out, "COMMENT: {comment}");
        }
        let c = &self.cell;
        let e = &self.eos;
        for (key, value) in [
            ("K0", e.k0),
            ("K0P", e.k0p),
            ("DK0DT", e.dk0dt),
            ("DK0PDT", e.dk0pdt),
        ] {
            let _ = writeln!(out, "{key}: {value}");
        }
        let _ = writeln!(out, "SYMMETRY: {}", self.symmetry);
        for (key, value) in [
            ("A", c.a),
            ("B", c.b),
            ("C", c.c),
            ("ALPHA", c.alpha),
            ("BETA", c.beta),
            ("GAMMA", c.gamma),
            ("VOLUME", self.v0),
            ("ALPHAT", e.alpha_t0),
            ("DALPHADT", e.d_alpha_dt),
        ] {
            let _ = writeln!(out, "{key}: {value}");
        }
        for r in &self.reflections {
            let _ = writeln!(
                out,
                "DIHKL: {} {} {} {} {}",
                r.d0, r.intensity, r.h, r.k, r.l
            );
        }
        out
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[must_use]
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub(crate) fn set_filename(&mut self, filename: Option<PathBuf>) {
        self.filename = filename;
    }

    #[must_use]
    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn set_comments(&mut self, comments: Vec<String>) {
        self.comments = comments;
    }

    #[must_use]
    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    #[must_use]
    pub fn cell(&self) -> &UnitCell {
        &self.cell
    }

    /// Ambient volume at the reference temperature, Å³.
    #[must_use]
    pub fn v0(&self) -> f64 {
        self.v0
    }

    #[must_use]
    pub fn eos(&self) -> &EosParameters {
        &self.eos
    }

    #[must_use]
    pub fn reflections(&self) -> &[Reflection] {
        &self.reflections
    }

    /// Pressure in GPa.
    #[must_use]
    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    /// Temperature in K.
    #[must_use]
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Set the pressure (GPa).
    ///
    /// # Errors
    /// Returns `InvalidParameter` when the equation of state has no volume
    /// for this pressure; the phase is unchanged.
    pub fn set_pressure(&mut self, pressure: f64) -> Result<()> {
        self.volume_at(pressure, self.temperature)?;
        self.pressure = pressure;
        Ok(())
    }

    /// Set the temperature (K).
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a non-positive temperature or when the
    /// equation of state has no volume at these conditions.
    pub fn set_temperature(&mut self, temperature: f64) -> Result<()> {
        if temperature <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "temperature {temperature} K"
            )));
        }
        self.volume_at(self.pressure, temperature)?;
        self.temperature = temperature;
        Ok(())
    }

    /// Cell volume at `pressure` (GPa) and `temperature` (K), Å³.
    ///
    /// # Errors
    /// Returns `InvalidParameter` outside the range of the equation of state.
    pub fn volume_at(&self, pressure: f64, temperature: f64) -> Result<f64> {
        let dt = temperature - REFERENCE_TEMPERATURE;
        let e = &self.eos;
        let alpha = e.alpha_t0 + e.d_alpha_dt * dt;
        let v0_t = self.v0 * (1.0 + alpha * dt);
        let k0_t = e.k0 + e.dk0dt * dt;
        let k0p_t = e.k0p + e.dk0pdt * dt;
        if v0_t.is_nan() || v0_t <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "thermal expansion gives volume {v0_t} at {temperature} K"
            )));
        }
        Ok(v0_t * compression(pressure, k0_t, k0p_t)?)
    }

    /// Current volume, Å³.
    ///
    /// # Errors
    /// See [`Phase::volume_at`].
    pub fn volume(&self) -> Result<f64> {
        self.volume_at(self.pressure, self.temperature)
    }

    /// Current d-spacings.
    ///
    /// # Errors
    /// See [`Phase::volume_at`].
    pub fn d_spacings(&self) -> Result<Vec<f64>> {
        let scale = (self.volume()? / self.v0).cbrt();
        Ok(self.reflections.iter().map(|r| r.d0 * scale).collect())
    }

    /// Reflection positions in `unit` for wavelength `wavelength_m`.
    /// Reflections out of reach of the wavelength are omitted.
    ///
    /// # Errors
    /// See [`Phase::volume_at`].
    pub fn reflection_positions(
        &self,
        wavelength_m: f64,
        unit: IntegrationUnit,
    ) -> Result<Vec<ReflectionPosition>> {
        let lambda_a = wavelength_m * 1e10;
        let d = self.d_spacings()?;
        let positions: Vec<ReflectionPosition> = self
            .reflections
            .iter()
            .zip(d)
            .filter_map(|(r, d)| {
                let sin_theta = lambda_a / (2.0 * d);
                if !(sin_theta.is_finite() && sin_theta <= 1.0 && d > 0.0) {
                    return None;
                }
                let tth = 2.0 * sin_theta.asin().to_degrees();
                let position = match unit {
                    IntegrationUnit::D => d,
                    other => other.value_from_tth(tth, wavelength_m),
                };
                Some(ReflectionPosition {
                    position,
                    intensity: r.intensity,
                    hkl: (r.h, r.k, r.l),
                })
            })
            .collect();
        debug!(
            "phase '{}': {} of {} reflections in range",
            self.name,
            positions.len(),
            self.reflections.len()
        );
        Ok(positions)
    }
}

fn parse_f64(key: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidFormat(format!("{key}: '{value}' is not a number")))
}

fn parse_reflection(fields: &[&str]) -> Result<Reflection> {
    if fields.len() < 5 {
        return Err(Error::InvalidFormat(format!(
            "reflection needs d I h k l, got '{}'",
            fields.join(" ")
        )));
    }
    let int = |s: &str| {
        s.parse::<i32>()
            .map_err(|_| Error::InvalidFormat(format!("'{s}' is not a Miller index")))
    };
    Ok(Reflection {
        d0: parse_f64("d", fields[0])?,
        intensity: parse_f64("I", fields[1])?,
        h: int(fields[2])?,
        k: int(fields[3])?,
        l: int(fields[4])?,
    })
}

fn parse_v4(name: &str, text: &str) -> Result<Phase> {
    let mut comments = Vec::new();
    let mut symmetry = Symmetry::Cubic;
    let mut cell = UnitCell::cubic(0.0);
    let mut volume = None;
    let mut eos = EosParameters::default();
    let mut reflections = Vec::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_uppercase();
        match key.as_str() {
            "VERSION" => {}
            "COMMENT" | "NAME" => comments.push(value.trim().to_string()),
            "K0" => eos.k0 = parse_f64(&key, value)?,
            "K0P" => eos.k0p = parse_f64(&key, value)?,
            "DK0DT" => eos.dk0dt = parse_f64(&key, value)?,
            "DK0PDT" => eos.dk0pdt = parse_f64(&key, value)?,
            "SYMMETRY" => symmetry = value.parse()?,
            "A" => cell.a = parse_f64(&key, value)?,
            "B" => cell.b = parse_f64(&key, value)?,
            "C" => cell.c = parse_f64(&key, value)?,
            "ALPHA" => cell.alpha = parse_f64(&key, value)?,
            "BETA" => cell.beta = parse_f64(&key, value)?,
            "GAMMA" => cell.gamma = parse_f64(&key, value)?,
            "VOLUME" => volume = Some(parse_f64(&key, value)?),
            "ALPHAT" => eos.alpha_t0 = parse_f64(&key, value)?,
            "DALPHADT" => eos.d_alpha_dt = parse_f64(&key, value)?,
            "DIHKL" => {
                let fields: Vec<&str> = value.split_whitespace().collect();
                reflections.push(parse_reflection(&fields)?);
            }
            other => debug!("ignoring JCPDS key {other}"),
        }
    }
    let mut phase = Phase::new(name, symmetry, cell, eos, reflections)?;
    if let Some(v) = volume.filter(|v| *v > 0.0) {
        phase.v0 = v;
    }
    phase.comments = comments;
    Ok(phase)
}

fn parse_legacy(name: &str, text: &str) -> Result<Phase> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let mut next = |what: &str| {
        lines
            .next()
            .ok_or_else(|| Error::InvalidFormat(format!("JCPDS file ends before {what}")))
    };
    let version = next("version")?.trim();
    let version: i64 = version
        .parse()
        .map_err(|_| Error::InvalidFormat(format!("unknown JCPDS version '{version}'")))?;
    if !(1..=3).contains(&version) {
        return Err(Error::InvalidFormat(format!(
            "unsupported JCPDS version {version}"
        )));
    }
    let comment = next("comment")?.trim().to_string();

    let header: Vec<&str> = next("symmetry line")?.split_whitespace().collect();
    if header.len() < 3 {
        return Err(Error::InvalidFormat(
            "symmetry line needs 'symmetry k0 k0p'".into(),
        ));
    }
    let code: i64 = header[0]
        .parse()
        .map_err(|_| Error::InvalidFormat(format!("symmetry code '{}'", header[0])))?;
    let symmetry = Symmetry::from_legacy_code(code)
        .ok_or_else(|| Error::InvalidFormat(format!("unknown symmetry code {code}")))?;
    let eos = EosParameters {
        k0: parse_f64("k0", header[1])?,
        k0p: parse_f64("k0p", header[2])?,
        ..EosParameters::default()
    };

    let values: Vec<f64> = next("cell line")?
        .split_whitespace()
        .map(|v| parse_f64("cell", v))
        .collect::<Result<_>>()?;
    let need = match symmetry {
        Symmetry::Cubic => 1,
        Symmetry::Hexagonal | Symmetry::Tetragonal | Symmetry::Rhombohedral => 2,
        Symmetry::Orthorhombic => 3,
        Symmetry::Monoclinic => 4,
        Symmetry::Triclinic => 6,
    };
    if values.len() < need {
        return Err(Error::InvalidFormat(format!(
            "{symmetry} cell needs {need} parameters, got {}",
            values.len()
        )));
    }
    let mut cell = UnitCell::cubic(values[0]);
    match symmetry {
        Symmetry::Cubic => {}
        Symmetry::Hexagonal | Symmetry::Tetragonal => cell.c = values[1],
        Symmetry::Rhombohedral => cell.alpha = values[1],
        Symmetry::Orthorhombic => {
            cell.b = values[1];
            cell.c = values[2];
        }
        Symmetry::Monoclinic => {
            cell.b = values[1];
            cell.c = values[2];
            cell.beta = values[3];
        }
        Symmetry::Triclinic => {
            cell.b = values[1];
            cell.c = values[2];
            cell.alpha = values[3];
            cell.beta = values[4];
            cell.gamma = values[5];
        }
    }

    let mut reflections = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        reflections.push(parse_reflection(&fields)?);
    }
    let mut phase = Phase::new(name, symmetry, cell, eos, reflections)?;
    phase.comments = vec![comment];
    Ok(phase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const GOLD_V4: &str = "\
VERSION: 4
COMMENT: Gold
K0: 167.0
K0P: 5.5
SYMMETRY: CUBIC
A: 4.0786
ALPHAT: 4.26e-5
DIHKL: 2.3548 100 1 1 1
DIHKL: 2.0393 52 2 0 0
DIHKL: 1.4420 32 2 2 0
";

    const LEGACY: &str = "\
1
MgO periclase
1 160.0 4.0
4.2112
2.4313 10 1 1 1
2.1056 100 2 0 0
";

    #[test]
    fn test_parse_v4() {
        let phase = Phase::parse_jcpds("au", GOLD_V4).unwrap();
        assert_eq!(phase.symmetry(), Symmetry::Cubic);
        assert_eq!(phase.reflections().len(), 3);
        assert_eq!(phase.comments(), ["Gold"]);
        assert_relative_eq!(phase.v0(), 4.0786f64.powi(3), max_relative = 1e-12);
        assert_relative_eq!(phase.eos().alpha_t0, 4.26e-5);
    }

    #[test]
    fn test_parse_legacy() {
        let phase = Phase::parse_jcpds("mgo", LEGACY).unwrap();
        assert_eq!(phase.comments(), ["MgO periclase"]);
        assert_eq!(phase.eos().k0, 160.0);
        assert_eq!(phase.reflections()[1], Reflection::new(2.1056, 100.0, (2, 0, 0)));
        assert!(Phase::parse_jcpds("x", "9\nbad\n").is_err());
    }

    #[test]
    fn test_v4_roundtrip_text() {
        let phase = Phase::parse_jcpds("au", GOLD_V4).unwrap();
        let again = Phase::parse_jcpds("au", &phase.to_jcpds_string()).unwrap();
        assert_eq!(again.reflections(), phase.reflections());
        assert_relative_eq!(again.v0(), phase.v0(), max_relative = 1e-12);
    }

    #[test]
    fn test_compression_solves_eos() {
        let x = compression(50.0, 167.0, 5.5).unwrap();
        assert!(x < 1.0);
        assert_relative_eq!(birch_murnaghan(x, 167.0, 5.5), 50.0, max_relative = 1e-9);
        assert_eq!(compression(10.0, 0.0, 4.0).unwrap(), 1.0);
    }

    #[test]
    fn test_pressure_scales_d_isotropically() {
        let mut phase = Phase::parse_jcpds("au", GOLD_V4).unwrap();
        phase.set_pressure(30.0).unwrap();
        let ratio = (phase.volume().unwrap() / phase.v0()).cbrt();
        let d = phase.d_spacings().unwrap();
        assert_relative_eq!(d[0], 2.3548 * ratio, max_relative = 1e-12);
        assert!(d[0] < 2.3548);
    }

    #[test]
    fn test_temperature_expands_cell() {
        let mut phase = Phase::parse_jcpds("au", GOLD_V4).unwrap();
        phase.set_temperature(1298.0).unwrap();
        assert_relative_eq!(
            phase.volume().unwrap(),
            phase.v0() * (1.0 + 4.26e-5 * 1000.0),
            max_relative = 1e-12
        );
        assert!(phase.set_temperature(-5.0).is_err());
        assert_eq!(phase.temperature(), 1298.0);
    }

    #[test]
    fn test_reflection_positions_units() {
        let phase = Phase::parse_jcpds("au", GOLD_V4).unwrap();
        let lambda = 3.1e-11;
        let tth = phase
            .reflection_positions(lambda, IntegrationUnit::TwoTheta)
            .unwrap();
        let expected = 2.0 * (0.31 / (2.0 * 2.3548f64)).asin().to_degrees();
        assert_relative_eq!(tth[0].position, expected, max_relative = 1e-9);
        assert_eq!(tth[0].hkl, (1, 1, 1));

        let d = phase.reflection_positions(lambda, IntegrationUnit::D).unwrap();
        assert_relative_eq!(d[2].position, 1.4420, max_relative = 1e-12);
        assert_relative_eq!(
            IntegrationUnit::D.value_to_tth(d[0].position, lambda),
            expected,
            max_relative = 1e-9
        );

        // 5 Å light cannot reach d = 1.44 Å
        let long = phase
            .reflection_positions(5e-10, IntegrationUnit::TwoTheta)
            .unwrap();
        assert!(long.is_empty());
    }
}
