//! Binary pixel masks with bounded undo/redo.
//!
//! `true` marks an excluded pixel. Geometric primitives rasterise into a
//! stamp that is OR-ed into the mask in [`MaskMode::Mask`] and cleared from
//! it in [`MaskMode::Unmask`]. Every mutation snapshots the previous state
//! onto the undo stack (bounded, oldest entries dropped) and clears redo.
//!
//! Coordinates are `(x, y)` = `(column, row)`.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use log::{debug, info};
use ndarray::{Array2, ArrayView2, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::filters::{
    binary_dilation, binary_dilation_square, binary_erosion, block_average, downsample_nearest,
    laplacian, median_filter, upsample_nearest,
};
use crate::signal::Signal;
use crate::{Error, Result};

/// Default depth of the undo and redo stacks.
pub const DEFAULT_UNDO_LIMIT: usize = 20;

/// Whether geometric operations add or remove pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MaskMode {
    /// Stamps are added to the mask.
    #[default]
    Mask,
    /// Stamps are removed from the mask.
    Unmask,
}

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Roi {
    /// Left edge (column).
    pub x: f64,
    /// Top edge (row).
    pub y: f64,
    /// Width in columns.
    pub width: f64,
    /// Height in rows.
    pub height: f64,
}

impl Roi {
    /// Creates a rectangle; negative extents are normalised.
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        let (x, width) = if width < 0.0 { (x + width, -width) } else { (x, width) };
        let (y, height) = if height < 0.0 { (y + height, -height) } else { (y, height) };
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clipped half-open row and column ranges covered by the rectangle.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn pixel_ranges(&self, shape: (usize, usize)) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let clip = |v: f64, max: usize| -> usize { v.floor().clamp(0.0, max as f64) as usize };
        let rows = clip(self.y, shape.0)..clip(self.y + self.height, shape.0);
        let cols = clip(self.x, shape.1)..clip(self.x + self.width, shape.1);
        (rows, cols)
    }
}

/// Tuning of the cosmic-ray detector.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CosmicParams {
    /// Detection limit in units of the local noise.
    pub sigclip: f64,
    /// Fraction of `sigclip` used when growing detections into neighbours.
    pub sigfrac: f64,
    /// Minimum contrast against the fine-structure image.
    pub objlim: f64,
    /// Maximum number of detect-and-clean passes.
    pub niter: usize,
    /// Detector gain (electrons per count).
    pub gain: f64,
    /// Read noise in electrons.
    pub readnoise: f64,
}

impl Default for CosmicParams {
    fn default() -> Self {
        Self {
            sigclip: 4.5,
            sigfrac: 0.3,
            objlim: 5.0,
            niter: 4,
            gain: 2.2,
            readnoise: 10.0,
        }
    }
}

/// Pixel exclusion mask.
pub struct Mask {
    data: Array2<bool>,
    mode: MaskMode,
    undo_stack: VecDeque<Array2<bool>>,
    redo_stack: VecDeque<Array2<bool>>,
    undo_limit: usize,
    roi: Option<Roi>,
    supersampling: usize,
    changed: Signal<()>,
}

impl Clone for Mask {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            mode: self.mode,
            undo_stack: self.undo_stack.clone(),
            redo_stack: self.redo_stack.clone(),
            undo_limit: self.undo_limit,
            roi: self.roi,
            supersampling: self.supersampling,
            changed: Signal::new(),
        }
    }
}

impl std::fmt::Debug for Mask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mask")
            .field("shape", &self.data.dim())
            .field("masked", &self.count())
            .field("mode", &self.mode)
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .field("supersampling", &self.supersampling)
            .finish_non_exhaustive()
    }
}

impl Default for Mask {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Mask {
    /// Creates an empty mask of `height × width` pixels.
    #[must_use]
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            data: Array2::from_elem((height, width), false),
            mode: MaskMode::Mask,
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            undo_limit: DEFAULT_UNDO_LIMIT,
            roi: None,
            supersampling: 1,
            changed: Signal::new(),
        }
    }

    /// Sets the depth of the undo/redo stacks.
    #[must_use]
    pub fn with_undo_limit(mut self, limit: usize) -> Self {
        self.undo_limit = limit;
        self
    }

    /// Mask data, `true` = excluded.
    #[must_use]
    pub fn data(&self) -> ArrayView2<'_, bool> {
        self.data.view()
    }

    /// `(height, width)` at the current supersampling.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Number of masked pixels.
    #[must_use]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&m| m).count()
    }

    /// Returns true if no pixel is masked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&m| m)
    }

    /// Change notification.
    #[must_use]
    pub fn changed(&self) -> &Signal<()> {
        &self.changed
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> MaskMode {
        self.mode
    }

    /// Selects whether geometric operations add or remove pixels.
    pub fn set_mode(&mut self, mode: MaskMode) {
        self.mode = mode;
    }

    /// Number of states available to [`Mask::undo`].
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of states available to [`Mask::redo`].
    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Replaces the mask data (undoable).
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the shape differs from the current one.
    pub fn set_data(&mut self, data: Array2<bool>) -> Result<()> {
        self.check_shape("mask", data.dim())?;
        self.mutate(|m| *m = data);
        Ok(())
    }

    /// Discards the mask and starts over at a new shape (not undoable).
    ///
    /// Used when a differently sized image is loaded.
    pub fn reset(&mut self, height: usize, width: usize) {
        self.data = Array2::from_elem((height, width), false);
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.changed.emit(&());
    }

    /// Masks or unmasks pixels with `(x-cx)²/rx² + (y-cy)²/ry² <= 1`.
    pub fn mask_ellipse(&mut self, cx: f64, cy: f64, rx: f64, ry: f64) {
        let stamp = ellipse_stamp(self.shape(), cx, cy, rx, ry);
        self.apply(&stamp);
    }

    /// Masks or unmasks the rectangle `[x, x+w) × [y, y+h)`.
    pub fn mask_rect(&mut self, x: f64, y: f64, width: f64, height: f64) {
        let mut stamp = Array2::from_elem(self.shape(), false);
        let (rows, cols) = Roi::new(x, y, width, height).pixel_ranges(self.shape());
        for r in rows {
            for c in cols.clone() {
                stamp[[r, c]] = true;
            }
        }
        self.apply(&stamp);
    }

    /// Masks or unmasks the inside of a polygon given as `(x, y)` vertices.
    pub fn mask_polygon(&mut self, vertices: &[(f64, f64)]) {
        let stamp = polygon_stamp(self.shape(), vertices);
        self.apply(&stamp);
    }

    /// Masks or unmasks a disc of radius `radius` around `(x, y)`.
    pub fn mask_point(&mut self, x: f64, y: f64, radius: f64) {
        let stamp = ellipse_stamp(self.shape(), x, y, radius.max(0.0), radius.max(0.0));
        self.apply(&stamp);
    }

    /// Masks every pixel whose value is below `threshold`.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if `img` does not match the mask shape.
    pub fn mask_below_threshold(&mut self, img: ArrayView2<'_, f64>, threshold: f64) -> Result<()> {
        self.check_shape("threshold image", img.dim())?;
        self.mutate(|m| Zip::from(m).and(img).for_each(|m, &v| *m |= v < threshold));
        Ok(())
    }

    /// Masks every pixel whose value is above `threshold`.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if `img` does not match the mask shape.
    pub fn mask_above_threshold(&mut self, img: ArrayView2<'_, f64>, threshold: f64) -> Result<()> {
        self.check_shape("threshold image", img.dim())?;
        self.mutate(|m| Zip::from(m).and(img).for_each(|m, &v| *m |= v > threshold));
        Ok(())
    }

    /// Swaps masked and unmasked pixels.
    pub fn invert_mask(&mut self) {
        self.mutate(|m| m.mapv_inplace(|v| !v));
    }

    /// Unmasks every pixel.
    pub fn clear_mask(&mut self) {
        self.mutate(|m| m.fill(false));
    }

    /// Dilates the mask with a 3×3 cross.
    pub fn grow(&mut self) {
        self.mutate(|m| *m = binary_dilation(m.view()));
    }

    /// Erodes the mask with a 3×3 cross.
    pub fn shrink(&mut self) {
        self.mutate(|m| *m = binary_erosion(m.view()));
    }

    /// Detects cosmic-ray hits in `img` and adds them to the mask.
    ///
    /// Returns the number of newly masked pixels.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if `img` does not match the mask shape.
    pub fn remove_cosmic(&mut self, img: ArrayView2<'_, f64>, params: &CosmicParams) -> Result<usize> {
        self.check_shape("cosmic image", img.dim())?;
        let hits = detect_cosmics(img, params);
        let added = Zip::from(&hits)
            .and(&self.data)
            .fold(0, |acc, &h, &m| acc + usize::from(h && !m));
        info!("cosmic filter: {added} new pixels");
        if added > 0 {
            self.mutate(|m| Zip::from(m).and(&hits).for_each(|m, &h| *m |= h));
        }
        Ok(added)
    }

    /// Restores the previous state; returns false if there is none.
    pub fn undo(&mut self) -> bool {
        let Some(previous) = self.undo_stack.pop_back() else {
            return false;
        };
        let current = std::mem::replace(&mut self.data, previous);
        push_bounded(&mut self.redo_stack, current, self.undo_limit);
        self.changed.emit(&());
        true
    }

    /// Re-applies the last undone state; returns false if there is none.
    pub fn redo(&mut self) -> bool {
        let Some(next) = self.redo_stack.pop_back() else {
            return false;
        };
        let current = std::mem::replace(&mut self.data, next);
        push_bounded(&mut self.undo_stack, current, self.undo_limit);
        self.changed.emit(&());
        true
    }

    /// Current supersampling factor.
    #[must_use]
    pub fn supersampling(&self) -> usize {
        self.supersampling
    }

    /// Resamples the mask to `n`× the base detector resolution.
    ///
    /// The undo history refers to the old resolution and is discarded.
    pub fn set_supersampling(&mut self, n: usize) {
        let n = n.max(1);
        if n == self.supersampling {
            return;
        }
        let base = downsample_nearest(self.data.view(), self.supersampling);
        self.data = upsample_nearest(base.view(), n);
        self.supersampling = n;
        self.undo_stack.clear();
        self.redo_stack.clear();
        debug!("mask resampled to {:?} (factor {n})", self.data.dim());
        self.changed.emit(&());
    }

    /// Rectangular region of interest, if set.
    #[must_use]
    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    /// Sets the region of interest. The ROI is not part of the undo history.
    pub fn set_roi(&mut self, roi: Option<Roi>) {
        self.roi = roi;
        self.changed.emit(&());
    }

    /// Mask excluding everything outside the ROI, if one is set.
    #[must_use]
    pub fn roi_mask(&self) -> Option<Array2<bool>> {
        let roi = self.roi?;
        let mut out = Array2::from_elem(self.shape(), true);
        let (rows, cols) = roi.pixel_ranges(self.shape());
        for r in rows {
            for c in cols.clone() {
                out[[r, c]] = false;
            }
        }
        Some(out)
    }

    /// Mask data combined with the ROI mask.
    #[must_use]
    pub fn combined(&self) -> Array2<bool> {
        match self.roi_mask() {
            Some(roi) => Zip::from(&self.data).and(&roi).map_collect(|&a, &b| a || b),
            None => self.data.clone(),
        }
    }

    /// Writes the mask as a 0/1 text grid, bottom row first.
    ///
    /// # Errors
    /// Returns `Io` on write failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let (h, w) = self.shape();
        let mut out = String::with_capacity(h * (2 * w + 1));
        for row in self.data.rows().into_iter().rev() {
            let line: Vec<&str> = row.iter().map(|&m| if m { "1" } else { "0" }).collect();
            let _ = writeln!(out, "{}", line.join(" "));
        }
        fs::write(path, out)?;
        info!("saved mask {} ({h}x{w})", path.display());
        Ok(())
    }

    /// Reads a mask written by [`Mask::save`] (undoable).
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read, `Format` for malformed grids
    /// and `DimensionMismatch` if the grid does not match the current shape.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = parse_mask_text(&fs::read_to_string(path)?)?;
        self.check_shape("mask file", data.dim())?;
        self.mutate(|m| *m = data);
        info!("loaded mask {}", path.display());
        Ok(())
    }

    fn check_shape(&self, what: &'static str, actual: (usize, usize)) -> Result<()> {
        if actual == self.shape() {
            Ok(())
        } else {
            Err(Error::DimensionMismatch {
                what,
                expected: self.shape(),
                actual,
            })
        }
    }

    fn apply(&mut self, stamp: &Array2<bool>) {
        let mode = self.mode;
        self.mutate(|m| {
            Zip::from(m).and(stamp).for_each(|m, &s| {
                if s {
                    *m = mode == MaskMode::Mask;
                }
            });
        });
    }

    fn mutate(&mut self, f: impl FnOnce(&mut Array2<bool>)) {
        push_bounded(&mut self.undo_stack, self.data.clone(), self.undo_limit);
        self.redo_stack.clear();
        f(&mut self.data);
        self.changed.emit(&());
    }
}

fn push_bounded(stack: &mut VecDeque<Array2<bool>>, state: Array2<bool>, limit: usize) {
    if limit == 0 {
        return;
    }
    while stack.len() >= limit {
        stack.pop_front();
    }
    stack.push_back(state);
}

#[allow(clippy::cast_precision_loss)]
fn ellipse_stamp(shape: (usize, usize), cx: f64, cy: f64, rx: f64, ry: f64) -> Array2<bool> {
    let mut stamp = Array2::from_elem(shape, false);
    if rx < 0.0 || ry < 0.0 || !(cx.is_finite() && cy.is_finite()) {
        return stamp;
    }
    let rows = pixel_span(cy - ry, cy + ry, shape.0);
    let cols = pixel_span(cx - rx, cx + rx, shape.1);
    for r in rows {
        let dy = r as f64 - cy;
        for c in cols.clone() {
            let dx = c as f64 - cx;
            let inside = match (rx > 0.0, ry > 0.0) {
                (true, true) => (dx / rx).powi(2) + (dy / ry).powi(2) <= 1.0,
                (false, true) => dx.abs() < 0.5 && dy.abs() <= ry,
                (true, false) => dy.abs() < 0.5 && dx.abs() <= rx,
                (false, false) => dx.abs() < 0.5 && dy.abs() < 0.5,
            };
            if inside {
                stamp[[r, c]] = true;
            }
        }
    }
    stamp
}

/// Integer pixels whose centre may fall in `[lo, hi]`, clipped to `0..n`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn pixel_span(lo: f64, hi: f64, n: usize) -> std::ops::Range<usize> {
    let start = lo.floor().clamp(0.0, n as f64) as usize;
    let end = (hi.ceil() + 1.0).clamp(0.0, n as f64) as usize;
    start..end
}

/// Ray-casting inside test.
fn point_in_polygon(px: f64, py: f64, vertices: &[(f64, f64)]) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = vertices[i];
        let (xj, yj) = vertices[j];
        let crosses =
            ((yi > py) != (yj > py)) && (px < (xj - xi) * (py - yi) / (yj - yi + f64::EPSILON) + xi);
        if crosses {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[allow(clippy::cast_precision_loss)]
fn polygon_stamp(shape: (usize, usize), vertices: &[(f64, f64)]) -> Array2<bool> {
    let mut stamp = Array2::from_elem(shape, false);
    if vertices.len() < 3 {
        return stamp;
    }
    let (mut x_lo, mut x_hi, mut y_lo, mut y_hi) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for &(x, y) in vertices {
        x_lo = x_lo.min(x);
        x_hi = x_hi.max(x);
        y_lo = y_lo.min(y);
        y_hi = y_hi.max(y);
    }
    let cols = pixel_span(x_lo, x_hi, shape.1);
    for r in pixel_span(y_lo, y_hi, shape.0) {
        for c in cols.clone() {
            if point_in_polygon(c as f64, r as f64, vertices) {
                stamp[[r, c]] = true;
            }
        }
    }
    stamp
}

/// LA-Cosmic style detection: Laplacian edge detection on a 2× subsampled
/// image, compared against a median-based noise model and a fine-structure
/// image to reject stars/peaks. Detections are grown into neighbours above
/// `sigfrac * sigclip` and the image is cleaned before the next pass.
fn detect_cosmics(img: ArrayView2<'_, f64>, params: &CosmicParams) -> Array2<bool> {
    let shape = img.dim();
    let mut hits = Array2::from_elem(shape, false);
    if shape.0 < 3 || shape.1 < 3 {
        return hits;
    }
    let gain = if params.gain > 0.0 { params.gain } else { 1.0 };
    let readnoise2 = params.readnoise * params.readnoise;
    let sigclip_low = params.sigfrac * params.sigclip;
    let mut cleaned = img.to_owned();

    for pass in 0..params.niter.max(1) {
        let sub = upsample_nearest(cleaned.view(), 2);
        let lap = laplacian(sub.view()).mapv(|v| v.max(0.0));
        let lap = block_average(lap.view(), 2);

        let m5 = median_filter(cleaned.view(), 5);
        let noise = m5.mapv(|v| (gain * v.max(1e-5) + readnoise2).sqrt() / gain);
        let s = Zip::from(&lap).and(&noise).map_collect(|&l, &n| l / (2.0 * n));
        let s_med = median_filter(s.view(), 5);
        let sp = &s - &s_med;

        let m3 = median_filter(cleaned.view(), 3);
        let m37 = median_filter(m3.view(), 7);
        let fine = Zip::from(&m3).and(&m37).map_collect(|&a, &b| (a - b).max(0.01));

        let candidates = Zip::from(&sp)
            .and(&lap)
            .and(&fine)
            .map_collect(|&spv, &l, &f| spv > params.sigclip && l / f > params.objlim);

        let grown = binary_dilation_square(candidates.view());
        let grown = Zip::from(&grown).and(&sp).map_collect(|&g, &v| g && v > params.sigclip);
        let grown = binary_dilation_square(grown.view());
        let selected = Zip::from(&grown).and(&sp).map_collect(|&g, &v| g && v > sigclip_low);

        let fresh = Zip::from(&selected)
            .and(&hits)
            .fold(0usize, |acc, &s, &h| acc + usize::from(s && !h));
        debug!("cosmic pass {pass}: {fresh} new pixels");
        if fresh == 0 {
            break;
        }
        Zip::from(&mut hits).and(&selected).for_each(|h, &s| *h |= s);
        Zip::from(&mut cleaned)
            .and(&hits)
            .and(&m5)
            .for_each(|c, &h, &m| {
                if h {
                    *c = m;
                }
            });
    }
    hits
}

fn parse_mask_text(text: &str) -> Result<Array2<bool>> {
    let mut rows: Vec<Vec<bool>> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|v| match v {
                "0" => Ok(false),
                "1" => Ok(true),
                other => Err(Error::Format(format!(
                    "mask line {}: unexpected value '{other}'",
                    line_no + 1
                ))),
            })
            .collect::<Result<Vec<bool>>>()?;
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(Error::Format(format!(
                    "mask line {}: {} columns, expected {}",
                    line_no + 1,
                    row.len(),
                    first.len()
                )));
            }
        }
        rows.push(row);
    }
    let height = rows.len();
    let width = rows.first().map_or(0, Vec::len);
    // Stored bottom row first.
    let flat: Vec<bool> = rows.into_iter().rev().flatten().collect();
    Array2::from_shape_vec((height, width), flat).map_err(|e| Error::Format(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_ellipse_convention_is_column_row() {
        let mut mask = Mask::new(20, 40);
        mask.mask_ellipse(30.0, 5.0, 3.0, 1.0);
        assert!(mask.data()[[5, 30]]);
        assert!(mask.data()[[5, 33]]);
        assert!(!mask.data()[[5, 34]]);
        assert!(!mask.data()[[7, 30]]);
        assert!(mask.data()[[6, 30]]);
    }

    #[test]
    fn test_unmask_mode_removes() {
        let mut mask = Mask::new(10, 10);
        mask.mask_rect(0.0, 0.0, 10.0, 10.0);
        assert_eq!(mask.count(), 100);
        mask.set_mode(MaskMode::Unmask);
        mask.mask_point(5.0, 5.0, 0.0);
        assert_eq!(mask.count(), 99);
        assert!(!mask.data()[[5, 5]]);
    }

    #[test]
    fn test_rect_negative_extent() {
        let mut mask = Mask::new(10, 10);
        mask.mask_rect(5.0, 5.0, -2.0, -3.0);
        assert_eq!(mask.count(), 6);
        assert!(mask.data()[[2, 3]]);
        assert!(mask.data()[[4, 4]]);
    }

    #[test]
    fn test_polygon_triangle() {
        let mut mask = Mask::new(10, 10);
        mask.mask_polygon(&[(0.5, 0.5), (8.5, 0.5), (0.5, 8.5)]);
        assert!(mask.data()[[1, 1]]);
        assert!(!mask.data()[[8, 8]]);
        mask.mask_polygon(&[(0.0, 0.0), (1.0, 1.0)]);
        assert_eq!(mask.undo_depth(), 2);
    }

    #[test]
    fn test_thresholds_and_shape_check() {
        let img = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64);
        let mut mask = Mask::new(4, 4);
        mask.mask_below_threshold(img.view(), 2.0).unwrap();
        mask.mask_above_threshold(img.view(), 14.0).unwrap();
        assert_eq!(mask.count(), 3);
        let wrong = Array2::zeros((3, 4));
        let err = mask.mask_above_threshold(wrong.view(), 1.0).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
        assert_eq!(mask.undo_depth(), 2);
    }

    #[test]
    fn test_undo_redo() {
        let mut mask = Mask::new(8, 8);
        mask.mask_point(2.0, 2.0, 1.0);
        let after_first = mask.data().to_owned();
        mask.invert_mask();
        assert!(mask.undo());
        assert_eq!(mask.data(), after_first.view());
        assert!(mask.redo());
        assert!(!mask.redo());
        assert!(mask.undo());
        assert!(mask.undo());
        assert!(mask.is_empty());
        assert!(!mask.undo());
    }

    #[test]
    fn test_new_mutation_clears_redo() {
        let mut mask = Mask::new(8, 8);
        mask.mask_point(2.0, 2.0, 1.0);
        mask.undo();
        assert_eq!(mask.redo_depth(), 1);
        mask.grow();
        assert_eq!(mask.redo_depth(), 0);
    }

    #[test]
    fn test_supersampling_roundtrip() {
        let mut mask = Mask::new(4, 5);
        mask.mask_point(1.0, 2.0, 0.0);
        mask.set_supersampling(3);
        assert_eq!(mask.shape(), (12, 15));
        assert_eq!(mask.count(), 9);
        assert_eq!(mask.undo_depth(), 0);
        mask.set_supersampling(1);
        assert_eq!(mask.shape(), (4, 5));
        assert!(mask.data()[[2, 1]]);
    }

    #[test]
    fn test_roi_mask_is_not_undoable() {
        let mut mask = Mask::new(10, 10);
        mask.set_roi(Some(Roi::new(2.0, 3.0, 4.0, 2.0)));
        let roi = mask.roi_mask().unwrap();
        assert_eq!(roi.iter().filter(|&&m| !m).count(), 8);
        assert_eq!(mask.undo_depth(), 0);
        assert!(mask.is_empty());
        assert_eq!(mask.combined().iter().filter(|&&m| m).count(), 92);
    }

    #[test]
    fn test_save_load_flip_aware() {
        let mut mask = Mask::new(3, 4);
        mask.mask_point(0.0, 0.0, 0.0);
        let file = NamedTempFile::new().unwrap();
        mask.save(file.path()).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert_eq!(text.lines().last().unwrap(), "1 0 0 0");

        let mut other = Mask::new(3, 4);
        other.load(file.path()).unwrap();
        assert_eq!(other.data(), mask.data());

        let mut wrong = Mask::new(4, 4);
        let err = wrong.load(file.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
        assert_eq!(wrong.undo_depth(), 0);
    }

    #[test]
    fn test_cosmic_single_spike() {
        let mut img = Array2::from_elem((32, 32), 100.0);
        img[[10, 20]] = 10_000.0;
        let mut mask = Mask::new(32, 32);
        let added = mask.remove_cosmic(img.view(), &CosmicParams::default()).unwrap();
        assert_eq!(added, 1);
        assert!(mask.data()[[10, 20]]);
    }

    #[test]
    fn test_cosmic_ignores_flat_image() {
        let img = Array2::from_elem((16, 16), 50.0);
        let mut mask = Mask::new(16, 16);
        assert_eq!(mask.remove_cosmic(img.view(), &CosmicParams::default()).unwrap(), 0);
        assert_eq!(mask.undo_depth(), 0);
    }

    #[test]
    fn test_cosmic_on_masked_spike_adds_no_history() {
        let mut img = Array2::from_elem((32, 32), 100.0);
        img[[10, 20]] = 10_000.0;
        let mut mask = Mask::new(32, 32);
        mask.remove_cosmic(img.view(), &CosmicParams::default()).unwrap();
        assert_eq!(mask.undo_depth(), 1);
        assert_eq!(mask.remove_cosmic(img.view(), &CosmicParams::default()).unwrap(), 0);
        assert_eq!(mask.undo_depth(), 1);
    }
}
