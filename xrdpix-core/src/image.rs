//! Detector image model.
//!
//! Holds the pristine frame, an ordered orientation history, an optional
//! background frame and a stack of named per-pixel corrections. The image
//! handed to the integrator is
//!
//! ```text
//! (data * factor - (background * background_scaling + background_offset))
//!     / divide-corrections * multiply-corrections
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};
use ndarray::{s, Array2, ArrayView2, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::filters::{downsample_nearest, upsample_nearest};
use crate::signal::Signal;
use crate::{Error, Result};

/// Orientation-only image transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Transformation {
    /// Quarter turn counter-clockwise.
    RotateCcw90,
    /// Quarter turn clockwise.
    RotateCw90,
    /// Mirror left/right.
    FlipHorizontal,
    /// Mirror top/bottom.
    FlipVertical,
}

impl Transformation {
    /// Stable token used in session files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Transformation::RotateCcw90 => "rotate_ccw90",
            Transformation::RotateCw90 => "rotate_cw90",
            Transformation::FlipHorizontal => "flip_horizontal",
            Transformation::FlipVertical => "flip_vertical",
        }
    }

    /// Signed permutation acting on centred `(x, y)` = `(column, row)`
    /// coordinates, with rows counted downward.
    #[must_use]
    pub fn matrix(self) -> [[i32; 2]; 2] {
        match self {
            Transformation::RotateCcw90 => [[0, 1], [-1, 0]],
            Transformation::RotateCw90 => [[0, -1], [1, 0]],
            Transformation::FlipHorizontal => [[-1, 0], [0, 1]],
            Transformation::FlipVertical => [[1, 0], [0, -1]],
        }
    }

    /// The transformation undoing this one.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Transformation::RotateCcw90 => Transformation::RotateCw90,
            Transformation::RotateCw90 => Transformation::RotateCcw90,
            other => other,
        }
    }

    /// Applies the transformation to a 2D array.
    #[must_use]
    pub fn apply<T: Clone>(self, a: ArrayView2<'_, T>) -> Array2<T> {
        match self {
            Transformation::RotateCcw90 => a.t().slice(s![..;-1, ..]).to_owned(),
            Transformation::RotateCw90 => a.t().slice(s![.., ..;-1]).to_owned(),
            Transformation::FlipHorizontal => a.slice(s![.., ..;-1]).to_owned(),
            Transformation::FlipVertical => a.slice(s![..;-1, ..]).to_owned(),
        }
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transformation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rotate_ccw90" => Ok(Transformation::RotateCcw90),
            "rotate_cw90" => Ok(Transformation::RotateCw90),
            "flip_horizontal" => Ok(Transformation::FlipHorizontal),
            "flip_vertical" => Ok(Transformation::FlipVertical),
            other => Err(Error::Format(format!("unknown image transformation '{other}'"))),
        }
    }
}

/// Product of a sequence of transformation matrices, first applied rightmost.
#[must_use]
pub fn composite_matrix(transformations: &[Transformation]) -> [[i32; 2]; 2] {
    transformations.iter().fold([[1, 0], [0, 1]], |acc, t| {
        let m = t.matrix();
        [
            [
                m[0][0] * acc[0][0] + m[0][1] * acc[1][0],
                m[0][0] * acc[0][1] + m[0][1] * acc[1][1],
            ],
            [
                m[1][0] * acc[0][0] + m[1][1] * acc[1][0],
                m[1][0] * acc[0][1] + m[1][1] * acc[1][1],
            ],
        ]
    })
}

/// How a correction array is combined with the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CorrectionMode {
    /// The image is divided by the correction (absolute corrections).
    #[default]
    Divide,
    /// The image is multiplied by the correction (ratio corrections).
    Multiply,
}

impl CorrectionMode {
    /// Stable token used in session files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CorrectionMode::Divide => "divide",
            CorrectionMode::Multiply => "multiply",
        }
    }
}

impl FromStr for CorrectionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "divide" => Ok(CorrectionMode::Divide),
            "multiply" => Ok(CorrectionMode::Multiply),
            other => Err(Error::Format(format!("unknown correction mode '{other}'"))),
        }
    }
}

/// Named per-pixel correction.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    /// Per-pixel factors, same shape as the image.
    pub data: Array2<f64>,
    /// Combination mode.
    pub mode: CorrectionMode,
}

impl Correction {
    /// Creates a correction.
    #[must_use]
    pub fn new(data: Array2<f64>, mode: CorrectionMode) -> Self {
        Self { data, mode }
    }
}

/// Order used to find the next/previous file of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FileIterationMode {
    /// Increment a numeric group of the file name.
    #[default]
    Number,
    /// Order files of the folder by modification time.
    Time,
    /// Order files of the folder by name.
    Alphabetical,
}

impl FileIterationMode {
    /// Stable token used in session files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            FileIterationMode::Number => "number",
            FileIterationMode::Time => "time",
            FileIterationMode::Alphabetical => "alphabetical",
        }
    }
}

impl FromStr for FileIterationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "number" => Ok(FileIterationMode::Number),
            "time" => Ok(FileIterationMode::Time),
            "alphabetical" => Ok(FileIterationMode::Alphabetical),
            other => Err(Error::Format(format!("unknown iteration mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
struct BackgroundImage {
    raw: Array2<f64>,
    filename: Option<PathBuf>,
}

/// Detector image with orientation history, background and corrections.
pub struct Image {
    raw_data: Array2<f64>,
    data: Array2<f64>,
    transformations: Vec<Transformation>,
    background: Option<BackgroundImage>,
    background_data: Option<Array2<f64>>,
    background_scaling: f64,
    background_offset: f64,
    factor: f64,
    supersampling: usize,
    corrections: BTreeMap<String, Correction>,
    filename: Option<PathBuf>,
    file_info: String,
    known_extensions: BTreeSet<String>,
    iteration_mode: FileIterationMode,
    changed: Signal<()>,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            raw_data: Array2::zeros((0, 0)),
            data: Array2::zeros((0, 0)),
            transformations: Vec::new(),
            background: None,
            background_data: None,
            background_scaling: 1.0,
            background_offset: 0.0,
            factor: 1.0,
            supersampling: 1,
            corrections: BTreeMap::new(),
            filename: None,
            file_info: String::new(),
            known_extensions: BTreeSet::new(),
            iteration_mode: FileIterationMode::Number,
            changed: Signal::new(),
        }
    }
}

impl Clone for Image {
    /// Deep copy with its own, unconnected `changed` signal.
    fn clone(&self) -> Self {
        Self {
            raw_data: self.raw_data.clone(),
            data: self.data.clone(),
            transformations: self.transformations.clone(),
            background: self.background.clone(),
            background_data: self.background_data.clone(),
            background_scaling: self.background_scaling,
            background_offset: self.background_offset,
            factor: self.factor,
            supersampling: self.supersampling,
            corrections: self.corrections.clone(),
            filename: self.filename.clone(),
            file_info: self.file_info.clone(),
            known_extensions: self.known_extensions.clone(),
            iteration_mode: self.iteration_mode,
            changed: Signal::new(),
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("shape", &self.data.dim())
            .field("filename", &self.filename)
            .field("transformations", &self.transformations)
            .field("background", &self.background.is_some())
            .field("corrections", &self.corrections.keys().collect::<Vec<_>>())
            .field("supersampling", &self.supersampling)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Creates an empty image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Change notification (`img_changed`).
    #[must_use]
    pub fn changed(&self) -> &Signal<()> {
        &self.changed
    }

    /// Loads a new frame.
    ///
    /// If the frame has the shape of the previous one the transformation
    /// history is re-applied, otherwise the history is reset and any
    /// background or correction of the old shape is dropped.
    pub fn load_data(&mut self, data: Array2<f64>, filename: Option<PathBuf>) {
        let same_shape = data.dim() == self.raw_data.dim();
        if !same_shape {
            if !self.transformations.is_empty() {
                debug!("image shape changed, dropping {} transformations", self.transformations.len());
            }
            self.transformations.clear();
            if self.background.take().is_some() {
                info!("background image dropped: shape differs from new image");
            }
            self.corrections.clear();
        }
        if let Some(ext) = filename
            .as_deref()
            .and_then(Path::extension)
            .map(|e| e.to_string_lossy().to_lowercase())
        {
            self.known_extensions.insert(ext);
        }
        self.raw_data = data;
        self.filename = filename;
        self.rebuild();
        info!(
            "image loaded: {:?} {}",
            self.raw_data.dim(),
            self.filename.as_deref().map(Path::display).map(|d| d.to_string()).unwrap_or_default()
        );
        self.changed.emit(&());
    }

    /// Pristine frame as loaded.
    #[must_use]
    pub fn raw_data(&self) -> ArrayView2<'_, f64> {
        self.raw_data.view()
    }

    /// Transformed (and supersampled) frame.
    #[must_use]
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Shape of [`Image::data`].
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Returns true if no frame has been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw_data.is_empty()
    }

    /// Source file of the current frame.
    #[must_use]
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Free-text description of the current frame (header summary etc.).
    #[must_use]
    pub fn file_info(&self) -> &str {
        &self.file_info
    }

    /// Sets the free-text frame description.
    pub fn set_file_info(&mut self, info: impl Into<String>) {
        self.file_info = info.into();
    }

    /// Lower-case extensions of every file loaded so far.
    #[must_use]
    pub fn known_extensions(&self) -> &BTreeSet<String> {
        &self.known_extensions
    }

    /// Registers an extension for file navigation without loading a file.
    pub fn add_known_extension(&mut self, extension: &str) {
        self.known_extensions
            .insert(extension.trim_start_matches('.').to_lowercase());
    }

    /// Order used by next/previous file navigation.
    #[must_use]
    pub fn iteration_mode(&self) -> FileIterationMode {
        self.iteration_mode
    }

    /// Sets the file navigation order.
    pub fn set_iteration_mode(&mut self, mode: FileIterationMode) {
        self.iteration_mode = mode;
    }

    /// Transformation history, oldest first.
    #[must_use]
    pub fn transformations(&self) -> &[Transformation] {
        &self.transformations
    }

    /// Appends a transformation and applies it.
    pub fn transform(&mut self, t: Transformation) {
        self.transformations.push(t);
        self.data = t.apply(self.data.view());
        if let Some(bg) = self.background_data.take() {
            self.background_data = Some(t.apply(bg.view()));
        }
        for correction in self.corrections.values_mut() {
            correction.data = t.apply(correction.data.view());
        }
        self.changed.emit(&());
    }

    /// Rotates the image a quarter turn counter-clockwise.
    pub fn rotate_ccw90(&mut self) {
        self.transform(Transformation::RotateCcw90);
    }

    /// Rotates the image a quarter turn clockwise.
    pub fn rotate_cw90(&mut self) {
        self.transform(Transformation::RotateCw90);
    }

    /// Mirrors the image left/right.
    pub fn flip_horizontal(&mut self) {
        self.transform(Transformation::FlipHorizontal);
    }

    /// Mirrors the image top/bottom.
    pub fn flip_vertical(&mut self) {
        self.transform(Transformation::FlipVertical);
    }

    /// Replaces the transformation history (session restore).
    pub fn set_transformations(&mut self, transformations: Vec<Transformation>) {
        self.transformations = transformations;
        self.rebuild_keeping_corrections();
        self.changed.emit(&());
    }

    /// Clears the transformation history.
    pub fn reset_transformations(&mut self) {
        self.set_transformations(Vec::new());
    }

    /// Attaches a background frame in raw (untransformed) orientation.
    ///
    /// # Errors
    /// Returns `BackgroundDimensionWrong` if its shape differs from the raw
    /// image shape; the previous background is kept.
    pub fn set_background_data(
        &mut self,
        raw: Array2<f64>,
        filename: Option<PathBuf>,
    ) -> Result<()> {
        if raw.dim() != self.raw_data.dim() {
            return Err(Error::BackgroundDimensionWrong {
                expected: self.raw_data.dim(),
                actual: raw.dim(),
            });
        }
        self.background = Some(BackgroundImage { raw, filename });
        self.background_data = self.derive_background();
        self.changed.emit(&());
        Ok(())
    }

    /// Removes the background frame.
    pub fn unset_background(&mut self) {
        if self.background.take().is_some() {
            self.background_data = None;
            self.changed.emit(&());
        }
    }

    /// Returns true if a background frame is attached.
    #[must_use]
    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    /// Background frame in image orientation, if any.
    #[must_use]
    pub fn background_data(&self) -> Option<ArrayView2<'_, f64>> {
        self.background_data.as_ref().map(Array2::view)
    }

    /// Background frame as loaded, if any.
    #[must_use]
    pub fn raw_background_data(&self) -> Option<ArrayView2<'_, f64>> {
        self.background.as_ref().map(|b| b.raw.view())
    }

    /// Source file of the background frame.
    #[must_use]
    pub fn background_filename(&self) -> Option<&Path> {
        self.background.as_ref().and_then(|b| b.filename.as_deref())
    }

    /// Background multiplier.
    #[must_use]
    pub fn background_scaling(&self) -> f64 {
        self.background_scaling
    }

    /// Sets the background multiplier.
    pub fn set_background_scaling(&mut self, scaling: f64) {
        self.background_scaling = scaling;
        if self.has_background() {
            self.changed.emit(&());
        }
    }

    /// Background additive offset.
    #[must_use]
    pub fn background_offset(&self) -> f64 {
        self.background_offset
    }

    /// Sets the background additive offset.
    pub fn set_background_offset(&mut self, offset: f64) {
        self.background_offset = offset;
        if self.has_background() {
            self.changed.emit(&());
        }
    }

    /// Multiplicative gain of the frame.
    #[must_use]
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Sets the gain; negative values clamp to 0.
    pub fn set_factor(&mut self, factor: f64) {
        self.factor = factor.max(0.0);
        self.changed.emit(&());
    }

    /// Supersampling factor of [`Image::data`].
    #[must_use]
    pub fn supersampling(&self) -> usize {
        self.supersampling
    }

    /// Upsamples the frame by `n`; each value is replicated into its
    /// `n`×`n` block. Corrections are resampled with it.
    pub fn set_supersampling(&mut self, n: usize) {
        let n = n.max(1);
        if n == self.supersampling {
            return;
        }
        let previous = self.supersampling;
        self.supersampling = n;
        for correction in self.corrections.values_mut() {
            let base = downsample_nearest(correction.data.view(), previous);
            correction.data = upsample_nearest(base.view(), n);
        }
        self.rebuild_keeping_corrections();
        self.changed.emit(&());
    }

    /// Registers (or replaces) a named correction.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the correction does not match the
    /// current (transformed, supersampled) image shape.
    pub fn add_correction(&mut self, name: impl Into<String>, correction: Correction) -> Result<()> {
        if correction.data.dim() != self.shape() {
            return Err(Error::DimensionMismatch {
                what: "correction",
                expected: self.shape(),
                actual: correction.data.dim(),
            });
        }
        let name = name.into();
        debug!("correction '{name}' registered ({:?})", correction.mode);
        self.corrections.insert(name, correction);
        self.changed.emit(&());
        Ok(())
    }

    /// Removes a correction; returns it if it was registered.
    pub fn remove_correction(&mut self, name: &str) -> Option<Correction> {
        let removed = self.corrections.remove(name);
        if removed.is_some() {
            self.changed.emit(&());
        }
        removed
    }

    /// A registered correction.
    #[must_use]
    pub fn correction(&self, name: &str) -> Option<&Correction> {
        self.corrections.get(name)
    }

    /// All registered corrections, by name.
    #[must_use]
    pub fn corrections(&self) -> &BTreeMap<String, Correction> {
        &self.corrections
    }

    /// Returns true if any correction is registered.
    #[must_use]
    pub fn has_corrections(&self) -> bool {
        !self.corrections.is_empty()
    }

    /// Image with gain, background and corrections applied.
    #[must_use]
    pub fn effective_image(&self) -> Array2<f64> {
        let mut out = self.data.mapv(|v| v * self.factor);
        if let Some(bg) = &self.background_data {
            let (scale, offset) = (self.background_scaling, self.background_offset);
            Zip::from(&mut out)
                .and(bg)
                .for_each(|o, &b| *o -= b * scale + offset);
        }
        for correction in self.corrections.values() {
            match correction.mode {
                CorrectionMode::Divide => out /= &correction.data,
                CorrectionMode::Multiply => out *= &correction.data,
            }
        }
        out
    }

    fn supersample(&self, a: ArrayView2<'_, f64>) -> Array2<f64> {
        if self.supersampling == 1 {
            return a.to_owned();
        }
        upsample_nearest(a, self.supersampling)
    }

    fn orient(&self, a: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut out = self.supersample(a);
        for t in &self.transformations {
            out = t.apply(out.view());
        }
        out
    }

    fn derive_background(&self) -> Option<Array2<f64>> {
        self.background.as_ref().map(|b| self.orient(b.raw.view()))
    }

    fn rebuild(&mut self) {
        self.data = self.orient(self.raw_data.view());
        self.background_data = self.derive_background();
    }

    /// Rebuilds after a history replacement; corrections follow the new shape
    /// only if it is unchanged, otherwise they no longer apply and are dropped.
    fn rebuild_keeping_corrections(&mut self) {
        self.rebuild();
        let shape = self.shape();
        let before = self.corrections.len();
        self.corrections.retain(|_, c| c.data.dim() == shape);
        if self.corrections.len() != before {
            info!("dropped {} corrections after reorientation", before - self.corrections.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use std::cell::Cell;
    use std::rc::Rc;

    fn frame() -> Array2<f64> {
        array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]
    }

    #[test]
    fn test_rotations_match_numpy_convention() {
        let a = array![[1, 2], [3, 4]];
        assert_eq!(Transformation::RotateCcw90.apply(a.view()), array![[2, 4], [1, 3]]);
        assert_eq!(Transformation::RotateCw90.apply(a.view()), array![[3, 1], [4, 2]]);
        assert_eq!(Transformation::FlipHorizontal.apply(a.view()), array![[2, 1], [4, 3]]);
        assert_eq!(Transformation::FlipVertical.apply(a.view()), array![[3, 4], [1, 2]]);
    }

    #[test]
    fn test_matrices_compose_to_identity() {
        for t in [
            Transformation::RotateCcw90,
            Transformation::RotateCw90,
            Transformation::FlipHorizontal,
            Transformation::FlipVertical,
        ] {
            assert_eq!(composite_matrix(&[t, t.inverse()]), [[1, 0], [0, 1]]);
            assert_eq!(t.name().parse::<Transformation>().unwrap(), t);
        }
        let half_turn = composite_matrix(&[Transformation::RotateCcw90, Transformation::RotateCcw90]);
        assert_eq!(
            half_turn,
            composite_matrix(&[Transformation::FlipHorizontal, Transformation::FlipVertical])
        );
    }

    #[test]
    fn test_history_survives_same_shape_load() {
        let mut img = Image::new();
        img.load_data(frame(), Some(PathBuf::from("a_001.tif")));
        img.rotate_ccw90();
        assert_eq!(img.shape(), (3, 2));

        img.load_data(frame() * 2.0, Some(PathBuf::from("a_002.tif")));
        assert_eq!(img.transformations(), &[Transformation::RotateCcw90]);
        assert_relative_eq!(img.data()[[0, 0]], 6.0);

        img.load_data(Array2::zeros((4, 4)), None);
        assert!(img.transformations().is_empty());
        assert!(img.known_extensions().contains("tif"));
    }

    #[test]
    fn test_background_shape_check() {
        let mut img = Image::new();
        img.load_data(frame(), None);
        let err = img.set_background_data(Array2::zeros((3, 3)), None).unwrap_err();
        assert!(matches!(err, Error::BackgroundDimensionWrong { .. }));
        assert!(!img.has_background());
    }

    #[test]
    fn test_effective_image() {
        let mut img = Image::new();
        img.load_data(frame(), None);
        img.set_factor(2.0);
        img.set_background_data(Array2::from_elem((2, 3), 1.0), None).unwrap();
        img.set_background_scaling(0.5);
        img.set_background_offset(1.0);
        let eff = img.effective_image();
        assert_relative_eq!(eff[[1, 2]], 6.0 * 2.0 - (0.5 + 1.0));

        img.add_correction("flat", Correction::new(Array2::from_elem((2, 3), 2.0), CorrectionMode::Divide))
            .unwrap();
        img.add_correction("ratio", Correction::new(Array2::from_elem((2, 3), 3.0), CorrectionMode::Multiply))
            .unwrap();
        let eff = img.effective_image();
        assert_relative_eq!(eff[[1, 2]], (12.0 - 1.5) / 2.0 * 3.0);
        assert!(img
            .add_correction("bad", Correction::new(Array2::zeros((1, 1)), CorrectionMode::Divide))
            .is_err());
    }

    #[test]
    fn test_background_follows_transformations() {
        let mut img = Image::new();
        img.load_data(frame(), None);
        img.set_background_data(frame(), None).unwrap();
        img.flip_horizontal();
        assert!(img.effective_image().iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_supersampling_replicates_values() {
        let mut img = Image::new();
        img.load_data(frame(), None);
        img.set_supersampling(2);
        assert_eq!(img.shape(), (4, 6));
        assert_relative_eq!(img.data().sum(), 4.0 * frame().sum(), epsilon = 1e-12);
        assert_relative_eq!(img.data()[[3, 5]], frame()[[1, 2]]);
        img.set_supersampling(1);
        assert_eq!(img.data(), frame().view());
    }

    #[test]
    fn test_changed_emissions() {
        let mut img = Image::new();
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let _sub = img.changed().subscribe(move |()| counter.set(counter.get() + 1));
        img.load_data(frame(), None);
        img.set_background_data(frame(), None).unwrap();
        img.unset_background();
        img.unset_background();
        assert_eq!(hits.get(), 3);
    }
}
