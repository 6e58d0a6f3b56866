//! 1D diffraction patterns.
//!
//! A [`Pattern`] keeps the data it was created from (`original_x`,
//! `original_y`) and derives the published `(x, y)` from it:
//!
//! 1. `y = original_y * scaling + offset`
//! 2. subtract an attached background pattern (interpolated when the
//!    x grids differ, restricted to the overlapping range)
//! 3. subtract the automatic background, optionally restricted to a ROI
//! 4. Gaussian smoothing
//!
//! Every setter that changes the derivation recomputes it and emits the
//! `changed` signal exactly once. Setters are atomic: on error the pattern
//! is left untouched and nothing is emitted.

use std::fmt::Write as _;
use std::fs;
use std::ops::{Add, Mul, Sub};
use std::path::Path;

use log::{debug, info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::background::extract_background;
use crate::filters::gaussian_filter1d;
use crate::interp::{interp_linear_at, CubicSpline};
use crate::signal::Signal;
use crate::{Error, Result};

/// Parameters of the automatic background estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AutoBackgroundParams {
    /// Fit window in x units.
    pub smooth_width: f64,
    /// Number of stripping passes.
    pub iterations: usize,
    /// Order of the local polynomial.
    pub poly_order: usize,
}

impl Default for AutoBackgroundParams {
    fn default() -> Self {
        Self {
            smooth_width: 0.1,
            iterations: 50,
            poly_order: 2,
        }
    }
}

impl AutoBackgroundParams {
    /// Creates parameters with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fit window.
    #[must_use]
    pub fn with_smooth_width(mut self, width: f64) -> Self {
        self.smooth_width = width;
        self
    }

    /// Sets the number of passes.
    #[must_use]
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets the polynomial order.
    #[must_use]
    pub fn with_poly_order(mut self, order: usize) -> Self {
        self.poly_order = order;
        self
    }
}

/// Snapshot of another pattern's derived data used as a background.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundData {
    /// Name of the source pattern, reported on overlap errors.
    pub name: String,
    /// Background x values, ascending.
    pub x: Vec<f64>,
    /// Background intensities.
    pub y: Vec<f64>,
}

impl BackgroundData {
    /// Snapshots the derived data of `pattern`.
    #[must_use]
    pub fn from_pattern(pattern: &Pattern) -> Self {
        Self {
            name: pattern.name.clone(),
            x: pattern.x.clone(),
            y: pattern.y.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AutoBackground {
    params: AutoBackgroundParams,
    roi: Option<(f64, f64)>,
}

struct Derived {
    x: Vec<f64>,
    y: Vec<f64>,
    auto_background: Option<(Vec<f64>, Vec<f64>)>,
}

/// A 1D intensity pattern.
pub struct Pattern {
    name: String,
    original_x: Vec<f64>,
    original_y: Vec<f64>,
    scaling: f64,
    offset: f64,
    smoothing: f64,
    background: Option<BackgroundData>,
    auto_background: Option<AutoBackground>,
    auto_background_data: Option<(Vec<f64>, Vec<f64>)>,
    x: Vec<f64>,
    y: Vec<f64>,
    changed: Signal<()>,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            name: String::new(),
            original_x: Vec::new(),
            original_y: Vec::new(),
            scaling: 1.0,
            offset: 0.0,
            smoothing: 0.0,
            background: None,
            auto_background: None,
            auto_background_data: None,
            x: Vec::new(),
            y: Vec::new(),
            changed: Signal::new(),
        }
    }
}

impl Clone for Pattern {
    /// Deep copy with its own, unconnected `changed` signal.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            original_x: self.original_x.clone(),
            original_y: self.original_y.clone(),
            scaling: self.scaling,
            offset: self.offset,
            smoothing: self.smoothing,
            background: self.background.clone(),
            auto_background: self.auto_background.clone(),
            auto_background_data: self.auto_background_data.clone(),
            x: self.x.clone(),
            y: self.y.clone(),
            changed: Signal::new(),
        }
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pattern")
            .field("name", &self.name)
            .field("len", &self.x.len())
            .field("scaling", &self.scaling)
            .field("offset", &self.offset)
            .field("background", &self.background.as_ref().map(|b| &b.name))
            .field("auto_background", &self.auto_background.is_some())
            .finish_non_exhaustive()
    }
}

impl Pattern {
    /// Creates a pattern from raw data.
    ///
    /// Points are sorted by x and repeated x values keep their first sample,
    /// so the derived x is strictly increasing.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the lengths differ.
    pub fn new(x: Vec<f64>, y: Vec<f64>, name: impl Into<String>) -> Result<Self> {
        let (x, y) = normalize(x, y)?;
        Ok(Self {
            name: name.into(),
            x: x.clone(),
            y: y.clone(),
            original_x: x,
            original_y: y,
            ..Self::default()
        })
    }

    /// Creates an empty pattern.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads a two-column whitespace separated text file.
    ///
    /// The first `skiprows` lines are ignored, as are blank lines and lines
    /// starting with `#`. The pattern is named after the file stem.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read and `Format` for lines that
    /// do not hold two numbers.
    pub fn load(path: impl AsRef<Path>, skiprows: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let (x, y) = parse_columns(&text, skiprows)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("loaded pattern {} ({} points)", path.display(), x.len());
        Self::new(x, y, name)
    }

    /// Writes `original_x`, `original_y` as two columns.
    ///
    /// Each header line is written prefixed with `# `.
    ///
    /// # Errors
    /// Returns `Io` on write failure.
    pub fn save(&self, path: impl AsRef<Path>, header: Option<&str>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, xy_text(&self.original_x, &self.original_y, header))?;
        info!("saved pattern {}", path.display());
        Ok(())
    }

    /// Pattern name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the pattern. Does not emit.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Derived x values.
    #[must_use]
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    /// Derived intensities.
    #[must_use]
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    /// Derived `(x, y)`.
    #[must_use]
    pub fn data(&self) -> (&[f64], &[f64]) {
        (&self.x, &self.y)
    }

    /// Data the pattern was created from.
    #[must_use]
    pub fn original_data(&self) -> (&[f64], &[f64]) {
        (&self.original_x, &self.original_y)
    }

    /// Number of derived points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Returns true if the derived pattern has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Change notification, emitted once per successful setter.
    #[must_use]
    pub fn changed(&self) -> &Signal<()> {
        &self.changed
    }

    /// Replaces the original data and recomputes.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for mismatched lengths or
    /// `NoBackgroundOverlap` if the attached background no longer overlaps.
    pub fn set_data(&mut self, x: Vec<f64>, y: Vec<f64>) -> Result<()> {
        let (x, y) = normalize(x, y)?;
        let previous_x = std::mem::replace(&mut self.original_x, x);
        let previous_y = std::mem::replace(&mut self.original_y, y);
        if let Err(err) = self.recalculate() {
            self.original_x = previous_x;
            self.original_y = previous_y;
            return Err(err);
        }
        Ok(())
    }

    /// Multiplicative scaling.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Sets the scaling; negative values clamp to 0.
    ///
    /// # Errors
    /// Propagates derivation errors, see [`Pattern::recalculate`].
    pub fn set_scaling(&mut self, scaling: f64) -> Result<()> {
        let previous = self.scaling;
        self.scaling = scaling.max(0.0);
        self.commit_or_restore(|p| p.scaling = previous)
    }

    /// Additive offset.
    #[must_use]
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Sets the additive offset.
    ///
    /// # Errors
    /// Propagates derivation errors, see [`Pattern::recalculate`].
    pub fn set_offset(&mut self, offset: f64) -> Result<()> {
        let previous = self.offset;
        self.offset = offset;
        self.commit_or_restore(|p| p.offset = previous)
    }

    /// Gaussian smoothing sigma in points (0 disables).
    #[must_use]
    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    /// Sets the smoothing sigma; negative values clamp to 0.
    ///
    /// # Errors
    /// Propagates derivation errors, see [`Pattern::recalculate`].
    pub fn set_smoothing(&mut self, sigma: f64) -> Result<()> {
        let previous = self.smoothing;
        self.smoothing = sigma.max(0.0);
        self.commit_or_restore(|p| p.smoothing = previous)
    }

    /// Attached background, if any.
    #[must_use]
    pub fn background(&self) -> Option<&BackgroundData> {
        self.background.as_ref()
    }

    /// Returns true if a background pattern is attached.
    #[must_use]
    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    /// Attaches (or refreshes) a background.
    ///
    /// # Errors
    /// Returns `NoBackgroundOverlap` if the background x-range is disjoint
    /// from the pattern's; the previous background stays attached.
    pub fn set_background(&mut self, background: BackgroundData) -> Result<()> {
        let previous = self.background.replace(background);
        self.commit_or_restore(|p| p.background = previous)
    }

    /// Detaches the background pattern.
    pub fn unset_background(&mut self) {
        if self.background.take().is_some() {
            self.recalculate_infallible();
        }
    }

    /// Enables automatic background subtraction.
    ///
    /// `roi` restricts the published pattern to `min <= x < max`.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a non-positive window or an empty ROI.
    pub fn set_auto_background_subtraction(
        &mut self,
        params: AutoBackgroundParams,
        roi: Option<(f64, f64)>,
    ) -> Result<()> {
        if let Some((lo, hi)) = roi {
            if lo.partial_cmp(&hi) != Some(std::cmp::Ordering::Less) {
                return Err(Error::InvalidParameter(format!(
                    "auto background roi ({lo}, {hi}) is empty"
                )));
            }
        }
        let previous = self
            .auto_background
            .replace(AutoBackground { params, roi });
        self.commit_or_restore(|p| p.auto_background = previous)
    }

    /// Disables automatic background subtraction.
    pub fn unset_auto_background_subtraction(&mut self) {
        if self.auto_background.take().is_some() {
            self.recalculate_infallible();
        }
    }

    /// Returns true if automatic background subtraction is enabled.
    #[must_use]
    pub fn auto_background_subtracted(&self) -> bool {
        self.auto_background.is_some()
    }

    /// Automatic background parameters, if enabled.
    #[must_use]
    pub fn auto_background_params(&self) -> Option<AutoBackgroundParams> {
        self.auto_background.as_ref().map(|a| a.params)
    }

    /// Automatic background ROI, if enabled and set.
    #[must_use]
    pub fn auto_background_roi(&self) -> Option<(f64, f64)> {
        self.auto_background.as_ref().and_then(|a| a.roi)
    }

    /// The last computed automatic background as a pattern.
    #[must_use]
    pub fn auto_background_pattern(&self) -> Option<Pattern> {
        let (x, y) = self.auto_background_data.as_ref()?;
        Some(Pattern::from_sorted(
            x.clone(),
            y.clone(),
            format!("{} auto background", self.name),
        ))
    }

    /// New pattern holding the derived data of this one.
    #[must_use]
    pub fn snapshot(&self) -> Pattern {
        Pattern::from_sorted(self.x.clone(), self.y.clone(), self.name.clone())
    }

    /// New pattern with the derived points in `[x_min, x_max]`.
    #[must_use]
    pub fn limit(&self, x_min: f64, x_max: f64) -> Pattern {
        let (x, y): (Vec<f64>, Vec<f64>) = self
            .x
            .iter()
            .zip(&self.y)
            .filter(|(x, _)| **x >= x_min && **x <= x_max)
            .map(|(x, y)| (*x, *y))
            .unzip();
        Pattern::from_sorted(x, y, self.name.clone())
    }

    /// Recomputes the derived data and emits `changed`.
    ///
    /// # Errors
    /// Returns `NoBackgroundOverlap` if the attached background does not
    /// overlap, or `InvalidParameter` for unusable auto background
    /// parameters. The derived data is left untouched on error.
    pub fn recalculate(&mut self) -> Result<()> {
        let derived = self.derive()?;
        self.x = derived.x;
        self.y = derived.y;
        self.auto_background_data = derived.auto_background;
        debug!("pattern '{}' recalculated ({} points)", self.name, self.x.len());
        self.changed.emit(&());
        Ok(())
    }

    fn commit_or_restore(&mut self, restore: impl FnOnce(&mut Self)) -> Result<()> {
        if let Err(err) = self.recalculate() {
            restore(self);
            return Err(err);
        }
        Ok(())
    }

    /// Used after removing a derivation step, which cannot introduce errors
    /// that were not already present.
    fn recalculate_infallible(&mut self) {
        if let Err(err) = self.recalculate() {
            warn!("pattern '{}': {err}", self.name);
        }
    }

    fn from_sorted(x: Vec<f64>, y: Vec<f64>, name: String) -> Self {
        Self {
            name,
            x: x.clone(),
            y: y.clone(),
            original_x: x,
            original_y: y,
            ..Self::default()
        }
    }

    fn derive(&self) -> Result<Derived> {
        let mut x = self.original_x.clone();
        let mut y: Vec<f64> = self
            .original_y
            .iter()
            .map(|v| v * self.scaling + self.offset)
            .collect();

        if let Some(bg) = &self.background {
            if bg.x == x {
                for (yi, bi) in y.iter_mut().zip(&bg.y) {
                    *yi -= bi;
                }
            } else {
                let (x_sub, y_sub) = subtract_interpolated(&x, &y, bg)?;
                x = x_sub;
                y = y_sub;
            }
        }

        let mut auto_background = None;
        if let Some(auto) = &self.auto_background {
            if let Some((lo, hi)) = auto.roi {
                let (xr, yr): (Vec<f64>, Vec<f64>) = x
                    .iter()
                    .zip(&y)
                    .filter(|(xv, _)| **xv >= lo && **xv < hi)
                    .map(|(a, b)| (*a, *b))
                    .unzip();
                x = xr;
                y = yr;
            }
            let y_bg = extract_background(
                &x,
                &y,
                auto.params.smooth_width,
                auto.params.iterations,
                auto.params.poly_order,
            )?;
            for (yi, bi) in y.iter_mut().zip(&y_bg) {
                *yi -= bi;
            }
            auto_background = Some((x.clone(), y_bg));
        }

        if self.smoothing > 0.0 {
            y = gaussian_filter1d(&y, self.smoothing);
        }

        Ok(Derived {
            x,
            y,
            auto_background,
        })
    }

    fn arithmetic(&self, other: &Pattern, sign: f64, cubic: bool) -> Result<Pattern> {
        if self.x == other.x {
            let y = self
                .y
                .iter()
                .zip(&other.y)
                .map(|(a, b)| a + sign * b)
                .collect();
            return Ok(Pattern::from_sorted(self.x.clone(), y, self.name.clone()));
        }
        let (lo, hi) = range(&other.x).ok_or_else(|| Error::NoBackgroundOverlap(other.name.clone()))?;
        let (x, y_self): (Vec<f64>, Vec<f64>) = self
            .x
            .iter()
            .zip(&self.y)
            .filter(|(x, _)| **x >= lo && **x <= hi)
            .map(|(a, b)| (*a, *b))
            .unzip();
        if x.is_empty() {
            return Err(Error::NoBackgroundOverlap(other.name.clone()));
        }
        let y_other = if cubic && other.x.len() >= 2 {
            CubicSpline::natural(&other.x, &other.y)?.eval_many(&x)
        } else {
            x.iter()
                .map(|v| interp_linear_at(*v, &other.x, &other.y))
                .collect()
        };
        let y = y_self
            .iter()
            .zip(&y_other)
            .map(|(a, b)| a + sign * b)
            .collect();
        Ok(Pattern::from_sorted(x, y, self.name.clone()))
    }
}

impl Sub for &Pattern {
    type Output = Result<Pattern>;

    /// Subtracts `rhs`, cubic-interpolated onto the overlap when the grids differ.
    fn sub(self, rhs: &Pattern) -> Result<Pattern> {
        self.arithmetic(rhs, -1.0, true)
    }
}

impl Add for &Pattern {
    type Output = Result<Pattern>;

    /// Adds `rhs`, linearly interpolated onto the overlap when the grids differ.
    fn add(self, rhs: &Pattern) -> Result<Pattern> {
        self.arithmetic(rhs, 1.0, false)
    }
}

impl Mul<f64> for &Pattern {
    type Output = Pattern;

    fn mul(self, rhs: f64) -> Pattern {
        Pattern::from_sorted(
            self.x.clone(),
            self.y.iter().map(|v| v * rhs).collect(),
            self.name.clone(),
        )
    }
}

fn range(x: &[f64]) -> Option<(f64, f64)> {
    let lo = x.iter().copied().reduce(f64::min)?;
    let hi = x.iter().copied().reduce(f64::max)?;
    Some((lo, hi))
}

fn subtract_interpolated(
    x: &[f64],
    y: &[f64],
    bg: &BackgroundData,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let (lo, hi) = range(&bg.x).ok_or_else(|| Error::NoBackgroundOverlap(bg.name.clone()))?;
    let (xs, ys): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(xv, _)| **xv >= lo && **xv <= hi)
        .map(|(xv, yv)| (*xv, yv - interp_linear_at(*xv, &bg.x, &bg.y)))
        .unzip();
    if xs.is_empty() {
        return Err(Error::NoBackgroundOverlap(bg.name.clone()));
    }
    Ok((xs, ys))
}

/// Sorts by x and drops repeated x values.
fn normalize(x: Vec<f64>, y: Vec<f64>) -> Result<(Vec<f64>, Vec<f64>)> {
    if x.len() != y.len() {
        return Err(Error::InvalidParameter(format!(
            "pattern has {} x values and {} y values",
            x.len(),
            y.len()
        )));
    }
    if x.windows(2).all(|w| w[0] < w[1]) {
        return Ok((x, y));
    }
    let mut points: Vec<(f64, f64)> = x.into_iter().zip(y).collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    points.dedup_by(|b, a| a.0 == b.0);
    Ok(points.into_iter().unzip())
}

/// Parses whitespace separated `x y` columns.
pub(crate) fn parse_columns(text: &str, skiprows: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut x = Vec::new();
    let mut y = Vec::new();
    for (line_no, line) in text.lines().enumerate().skip(skiprows) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace().map(str::parse::<f64>);
        match (fields.next(), fields.next()) {
            (Some(Ok(a)), Some(Ok(b))) => {
                x.push(a);
                y.push(b);
            }
            _ => {
                return Err(Error::Format(format!(
                    "line {}: expected two numeric columns, got '{line}'",
                    line_no + 1
                )))
            }
        }
    }
    Ok((x, y))
}

/// Renders two columns with an optional `#`-prefixed header.
#[must_use]
pub fn xy_text(x: &[f64], y: &[f64], header: Option<&str>) -> String {
    let mut out = String::with_capacity(x.len() * 32);
    if let Some(header) = header {
        for line in header.lines() {
            let _ = writeln!(out, "# {line}");
        }
    }
    for (a, b) in x.iter().zip(y) {
        let _ = writeln!(out, "{a:.10e}  {b:.10e}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::linspace;
    use approx::assert_relative_eq;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::NamedTempFile;

    fn ramp(n: usize) -> Pattern {
        let x = linspace(0.0, 10.0, n);
        let y = x.iter().map(|v| v * 2.0).collect();
        Pattern::new(x, y, "ramp").unwrap()
    }

    #[test]
    fn test_new_sorts_and_dedups() {
        let p = Pattern::new(vec![2.0, 1.0, 1.0, 3.0], vec![20.0, 10.0, 11.0, 30.0], "p").unwrap();
        assert_eq!(p.x(), &[1.0, 2.0, 3.0]);
        assert_eq!(p.y(), &[10.0, 20.0, 30.0]);
        assert!(Pattern::new(vec![1.0], vec![], "bad").is_err());
    }

    #[test]
    fn test_scaling_clamps_and_emits_once() {
        let mut p = ramp(11);
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let _sub = p.changed().subscribe(move |()| counter.set(counter.get() + 1));

        p.set_scaling(-3.0).unwrap();
        assert_relative_eq!(p.scaling(), 0.0);
        assert!(p.y().iter().all(|v| *v == 0.0));
        assert_eq!(hits.get(), 1);

        p.set_scaling(2.0).unwrap();
        p.set_offset(1.0).unwrap();
        assert_eq!(hits.get(), 3);
        assert_relative_eq!(p.y()[5], 2.0 * 10.0 + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_background_same_grid() {
        let mut p = ramp(11);
        let bg = Pattern::new(p.x().to_vec(), vec![1.0; 11], "flat").unwrap();
        p.set_background(BackgroundData::from_pattern(&bg)).unwrap();
        assert_relative_eq!(p.y()[3], p.original_data().1[3] - 1.0, epsilon = 1e-12);
        p.unset_background();
        assert!(!p.has_background());
        assert_relative_eq!(p.y()[3], p.original_data().1[3], epsilon = 1e-12);
    }

    #[test]
    fn test_background_interpolated_overlap_only() {
        let mut p = ramp(101);
        let bg = Pattern::new(vec![2.0, 8.0], vec![1.0, 4.0], "partial").unwrap();
        p.set_background(BackgroundData::from_pattern(&bg)).unwrap();
        let (x, y) = p.data();
        assert!(x.iter().all(|v| *v >= 2.0 && *v <= 8.0));
        let i = x.iter().position(|v| (*v - 5.0).abs() < 1e-9).unwrap();
        assert_relative_eq!(y[i], 10.0 - 2.5, epsilon = 1e-9);
    }

    #[test]
    fn test_background_disjoint_is_rejected_atomically() {
        let mut p = ramp(11);
        let before = p.y().to_vec();
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let _sub = p.changed().subscribe(move |()| counter.set(counter.get() + 1));

        let bg = Pattern::new(vec![20.0, 30.0], vec![1.0, 1.0], "far").unwrap();
        let err = p.set_background(BackgroundData::from_pattern(&bg)).unwrap_err();
        assert!(matches!(err, Error::NoBackgroundOverlap(ref n) if n == "far"));
        assert!(!p.has_background());
        assert_eq!(p.y(), before.as_slice());
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_auto_background_roi() {
        let mut p = ramp(101);
        let params = AutoBackgroundParams::new().with_smooth_width(1.0);
        p.set_auto_background_subtraction(params, Some((2.0, 6.0))).unwrap();
        assert!(p.x().iter().all(|v| *v >= 2.0 && *v < 6.0));
        let bg = p.auto_background_pattern().unwrap();
        assert_eq!(bg.len(), p.len());
        assert!(p.auto_background_subtracted());

        p.unset_auto_background_subtraction();
        assert_eq!(p.len(), 101);
        assert!(p.auto_background_pattern().is_none());
    }

    #[test]
    fn test_arithmetic() {
        let a = ramp(11);
        let b = Pattern::new(a.x().to_vec(), vec![1.0; 11], "ones").unwrap();
        let diff = (&a - &b).unwrap();
        assert_relative_eq!(diff.y()[4], a.y()[4] - 1.0);
        let sum = (&a + &b).unwrap();
        assert_relative_eq!(sum.y()[4], a.y()[4] + 1.0);
        let scaled = &a * 3.0;
        assert_relative_eq!(scaled.y()[4], a.y()[4] * 3.0);

        let shifted = Pattern::new(vec![5.0, 6.0, 7.0, 20.0], vec![1.0, 1.0, 1.0, 1.0], "s").unwrap();
        let diff = (&a - &shifted).unwrap();
        assert_relative_eq!(diff.x()[0], 5.0);
        let far = Pattern::new(vec![50.0, 60.0], vec![1.0, 1.0], "far").unwrap();
        assert!(matches!(&a - &far, Err(Error::NoBackgroundOverlap(_))));
    }

    #[test]
    fn test_limit() {
        let p = ramp(11);
        let limited = p.limit(2.0, 4.0);
        assert_eq!(limited.x(), &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let p = ramp(21);
        let file = NamedTempFile::new().unwrap();
        p.save(file.path(), Some("ramp data\nsecond line")).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.starts_with("# ramp data\n# second line\n"));

        let loaded = Pattern::load(file.path(), 0).unwrap();
        assert_eq!(loaded.len(), 21);
        for (a, b) in loaded.y().iter().zip(p.y()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_load_rejects_garbage() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "1 2\nthree four\n").unwrap();
        let err = Pattern::load(file.path(), 0).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
        // skiprows jumps over a text header
        fs::write(file.path(), "title\n1 2\n3 4\n").unwrap();
        assert_eq!(Pattern::load(file.path(), 1).unwrap().len(), 2);
    }

    #[test]
    fn test_clone_has_fresh_signal() {
        let p = ramp(5);
        let _sub = p.changed().subscribe(|()| {});
        let copy = p.clone();
        assert_eq!(copy.changed().subscriber_count(), 0);
        assert_eq!(p.changed().subscriber_count(), 1);
    }
}
