//! One image / mask / calibration / pattern set and its integration wiring.
//!
//! A [`Configuration`] owns its models. Every mutation goes through one of
//! the `update_*` methods (or a loader built on them); afterwards the
//! configuration looks at which models reported a change, re-integrates if
//! needed and publishes its outbound signals in the order
//! `img_changed` → `pattern_changed` → `cake_changed`.

#[cfg(feature = "hdf5")]
pub(crate) mod persist;

use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use xrdpix_calib::corrections::{self, transfer_function};
use xrdpix_calib::{Cake, Calibration};
use xrdpix_core::filters::upsample_nearest;
use xrdpix_core::units::{convert, convert_range};
use xrdpix_core::{
    AutoBackgroundParams, BackgroundData, ErrorReport, Image, IntegrationUnit, Mask, Pattern,
    Signal, Subscription,
};
use xrdpix_io::{ExportHeader, PatternFormat};

use crate::overlay::OverlayId;
use crate::settings::{IntegrationSettings, WorkingDirectories};
use crate::{Error, Result};

/// Folder below the pattern directory receiving background-subtracted copies.
pub const BKG_SUBTRACTED_DIR: &str = "bkg_subtracted";

/// Read a pattern file; `.chi` files carry a four line header.
pub(crate) fn read_pattern_file(path: &Path) -> Result<Pattern> {
    let skiprows = match PatternFormat::from_path(path) {
        Some(PatternFormat::Chi) => 4,
        _ => 0,
    };
    Ok(Pattern::load(path, skiprows)?)
}

/// Dirty bit raised by a model's `changed` signal.
struct ChangeFlag {
    raised: Rc<Cell<bool>>,
    _subscription: Subscription,
}

impl ChangeFlag {
    fn watch(signal: &Signal<()>) -> Self {
        let raised = Rc::new(Cell::new(false));
        let flag = Rc::clone(&raised);
        let subscription = signal.subscribe(move |_| flag.set(true));
        Self {
            raised,
            _subscription: subscription,
        }
    }

    fn take(&self) -> bool {
        self.raised.replace(false)
    }
}

struct Watchers {
    image: ChangeFlag,
    mask: ChangeFlag,
    calibration: ChangeFlag,
    pattern: ChangeFlag,
}

impl Watchers {
    fn new(image: &Image, mask: &Mask, calibration: &Calibration, pattern: &Pattern) -> Self {
        Self {
            image: ChangeFlag::watch(image.changed()),
            mask: ChangeFlag::watch(mask.changed()),
            calibration: ChangeFlag::watch(calibration.changed()),
            pattern: ChangeFlag::watch(pattern.changed()),
        }
    }
}

/// An image with its mask, calibration and integration results.
pub struct Configuration {
    image: Image,
    mask: Mask,
    calibration: Calibration,
    pattern: Pattern,
    cake: Cake,
    settings: IntegrationSettings,
    working_directories: WorkingDirectories,
    background_overlay: Option<OverlayId>,
    watchers: Watchers,
    cake_dirty: bool,
    img_changed: Signal<()>,
    pattern_changed: Signal<()>,
    cake_changed: Signal<()>,
    error_emitted: Signal<ErrorReport>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("image", &self.image)
            .field("mask", &self.mask)
            .field("calibrated", &self.calibration.is_calibrated())
            .field("pattern", &self.pattern)
            .field("settings", &self.settings)
            .field("background_overlay", &self.background_overlay)
            .finish_non_exhaustive()
    }
}

impl Configuration {
    /// Creates an empty, uncalibrated configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(
            Image::new(),
            Mask::default(),
            Calibration::new(),
            Pattern::empty(),
            IntegrationSettings::default(),
        )
    }

    /// Creates a configuration with the given settings.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the settings fail validation.
    pub fn with_settings(settings: IntegrationSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self::from_parts(
            Image::new(),
            Mask::default(),
            Calibration::new(),
            Pattern::empty(),
            settings,
        ))
    }

    fn from_parts(
        image: Image,
        mask: Mask,
        calibration: Calibration,
        pattern: Pattern,
        settings: IntegrationSettings,
    ) -> Self {
        let watchers = Watchers::new(&image, &mask, &calibration, &pattern);
        Self {
            image,
            mask,
            calibration,
            pattern,
            cake: Cake::default(),
            settings,
            working_directories: WorkingDirectories::default(),
            background_overlay: None,
            watchers,
            cake_dirty: false,
            img_changed: Signal::new(),
            pattern_changed: Signal::new(),
            cake_changed: Signal::new(),
            error_emitted: Signal::new(),
        }
    }

    /// Independent copy sharing no mutable state. The calibration is
    /// rebuilt from a temporary PONI file.
    ///
    /// # Errors
    /// Returns an I/O error if the temporary PONI file cannot be written or
    /// read back.
    pub fn copy(&self) -> Result<Self> {
        let mut copy = Self::from_parts(
            self.image.clone(),
            self.mask.clone(),
            Calibration::new(),
            self.pattern.clone(),
            self.settings.clone(),
        );
        copy.transfer_calibration(&self.calibration)?;
        copy.cake = self.cake.clone();
        copy.working_directories = self.working_directories.clone();
        copy.background_overlay = self.background_overlay;
        copy.discard_changes();
        Ok(copy)
    }

    /// Takes over the geometry of `source` through a PONI round trip.
    pub(crate) fn transfer_calibration(&mut self, source: &Calibration) -> Result<()> {
        let supersampling = self.image.supersampling();
        if let Some(calibrant) = source.calibrant() {
            self.calibration.set_calibrant(calibrant.clone());
        }
        if source.is_calibrated() {
            let dir = tempfile::tempdir()?;
            let poni = dir.path().join("transfer.poni");
            source.clone().save(&poni)?;
            self.calibration.load(&poni)?;
            debug!("calibration transferred via {}", poni.display());
        }
        self.calibration.set_supersampling(supersampling);
        Ok(())
    }

    /// Emitted after the image changed.
    #[must_use]
    pub fn img_changed(&self) -> &Signal<()> {
        &self.img_changed
    }

    /// Emitted after the pattern changed.
    #[must_use]
    pub fn pattern_changed(&self) -> &Signal<()> {
        &self.pattern_changed
    }

    /// Emitted after the cake changed.
    #[must_use]
    pub fn cake_changed(&self) -> &Signal<()> {
        &self.cake_changed
    }

    /// Errors trapped in automatic follow-up work (integration, auto-save,
    /// background refresh).
    #[must_use]
    pub fn error_emitted(&self) -> &Signal<ErrorReport> {
        &self.error_emitted
    }

    #[must_use]
    pub fn image(&self) -> &Image {
        &self.image
    }

    #[must_use]
    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    #[must_use]
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    #[must_use]
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    #[must_use]
    pub fn cake(&self) -> &Cake {
        &self.cake
    }

    #[must_use]
    pub fn settings(&self) -> &IntegrationSettings {
        &self.settings
    }

    #[must_use]
    pub fn working_directories(&self) -> &WorkingDirectories {
        &self.working_directories
    }

    pub fn working_directories_mut(&mut self) -> &mut WorkingDirectories {
        &mut self.working_directories
    }

    /// Overlay currently used as the pattern background.
    #[must_use]
    pub fn background_overlay(&self) -> Option<OverlayId> {
        self.background_overlay
    }

    /// Mutate the image, then integrate and notify.
    pub fn update_image<R>(&mut self, f: impl FnOnce(&mut Image) -> R) -> R {
        let out = f(&mut self.image);
        self.settle();
        out
    }

    /// Mutate the mask, then integrate (if the mask is in use) and notify.
    pub fn update_mask<R>(&mut self, f: impl FnOnce(&mut Mask) -> R) -> R {
        let out = f(&mut self.mask);
        self.settle();
        out
    }

    /// Mutate the calibration, then integrate and notify.
    pub fn update_calibration<R>(&mut self, f: impl FnOnce(&mut Calibration) -> R) -> R {
        let out = f(&mut self.calibration);
        self.settle();
        out
    }

    /// Mutate the pattern and notify.
    pub fn update_pattern<R>(&mut self, f: impl FnOnce(&mut Pattern) -> R) -> R {
        let out = f(&mut self.pattern);
        self.settle();
        out
    }

    /// Replace the integration settings, re-integrating what they affect.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for invalid settings, or the error of a
    /// unit change (see [`Configuration::set_integration_unit`]). Settings
    /// are unchanged on error.
    pub fn set_settings(&mut self, settings: IntegrationSettings) -> Result<()> {
        settings.validate()?;
        if settings.integration_unit != self.settings.integration_unit {
            self.set_integration_unit(settings.integration_unit)?;
        }
        let previous = std::mem::replace(&mut self.settings, settings);
        let pattern = self.settings.auto_integrate_pattern
            && (previous.pattern_differs(&self.settings) || !previous.auto_integrate_pattern);
        let cake = self.settings.auto_integrate_cake
            && (previous.cake_differs(&self.settings) || !previous.auto_integrate_cake);
        if self.calibration.is_calibrated() {
            if pattern {
                let result = self.run_pattern_integration().map(drop);
                self.trap(result);
            }
            if cake {
                let result = self.run_cake_integration().map(drop);
                self.trap(result);
            }
        }
        self.flush_results();
        Ok(())
    }

    /// Edit a copy of the settings and apply it.
    ///
    /// # Errors
    /// See [`Configuration::set_settings`].
    pub fn update_settings(&mut self, f: impl FnOnce(&mut IntegrationSettings)) -> Result<()> {
        let mut settings = self.settings.clone();
        f(&mut settings);
        self.set_settings(settings)
    }

    /// Switch the pattern unit.
    ///
    /// Automatic background parameters (window and ROI) are converted into
    /// the new unit, the image is re-integrated and the background is then
    /// recomputed. `pattern_changed` fires once, or twice when an automatic
    /// background was active.
    ///
    /// # Errors
    /// Returns `NotCalibrated` if a conversion needs a wavelength and there
    /// is none, or a conversion/integration error. The unit is unchanged on
    /// error.
    pub fn set_integration_unit(&mut self, unit: IntegrationUnit) -> Result<()> {
        let from = self.settings.integration_unit;
        if unit == from {
            return Ok(());
        }
        let original = self
            .pattern
            .auto_background_params()
            .map(|params| (params, self.pattern.auto_background_roi()));
        let converted = self.converted_auto_background(from, unit)?;
        if !self.calibration.is_calibrated() {
            if !self.pattern.is_empty() {
                return Err(xrdpix_calib::Error::NotCalibrated.into());
            }
            self.settings.integration_unit = unit;
            return Ok(());
        }

        if converted.is_some() {
            self.pattern.unset_auto_background_subtraction();
            self.watchers.pattern.take();
        }
        self.settings.integration_unit = unit;
        let reintegrated = match self.run_pattern_integration() {
            Ok(true) => Ok(()),
            Ok(false) => self.convert_pattern_axis(from, unit),
            Err(err) => Err(err),
        };
        if let Err(err) = reintegrated {
            self.settings.integration_unit = from;
            if let Some((params, roi)) = original {
                let restored = self.pattern.set_auto_background_subtraction(params, roi);
                self.trap(restored.map_err(Error::from));
            }
            self.watchers.pattern.take();
            return Err(err);
        }
        info!("integration unit changed from {from} to {unit}");
        self.flush_results();

        if let Some((params, roi)) = converted {
            self.pattern.set_auto_background_subtraction(params, roi)?;
            self.flush_results();
        }
        Ok(())
    }

    /// Auto-background parameters expressed in `to`.
    fn converted_auto_background(
        &self,
        from: IntegrationUnit,
        to: IntegrationUnit,
    ) -> Result<Option<(AutoBackgroundParams, Option<(f64, f64)>)>> {
        let Some(params) = self.pattern.auto_background_params() else {
            return Ok(None);
        };
        let wavelength = self
            .calibration
            .wavelength()
            .ok_or(xrdpix_calib::Error::NotCalibrated)?;
        let roi = self.pattern.auto_background_roi();
        let centre = match roi {
            Some((lo, hi)) => 0.5 * (lo + hi),
            None => match (self.pattern.x().first(), self.pattern.x().last()) {
                (Some(lo), Some(hi)) => 0.5 * (lo + hi),
                _ => return Ok(Some((params, None))),
            },
        };
        let (a, b) = convert_range(
            (centre, centre + 0.5 * params.smooth_width),
            from,
            to,
            wavelength,
        )?;
        let roi = roi
            .map(|r| convert_range(r, from, to, wavelength))
            .transpose()?;
        Ok(Some((params.with_smooth_width(2.0 * (b - a)), roi)))
    }

    /// Converts the x values of a pattern that did not come from the image.
    fn convert_pattern_axis(&mut self, from: IntegrationUnit, to: IntegrationUnit) -> Result<()> {
        if self.pattern.is_empty() {
            return Ok(());
        }
        let wavelength = self
            .calibration
            .wavelength()
            .ok_or(xrdpix_calib::Error::NotCalibrated)?;
        let (x, y) = self.pattern.original_data();
        let x = x
            .iter()
            .map(|&v| convert(v, from, to, wavelength))
            .collect::<xrdpix_core::Result<Vec<f64>>>()?;
        let y = y.to_vec();
        self.pattern.set_data(x, y)?;
        Ok(())
    }

    /// Load a detector image.
    ///
    /// # Errors
    /// Returns a decoding or I/O error; the image is unchanged.
    pub fn load_image<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = xrdpix_io::read_image_file(path)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            self.working_directories.image = Some(dir.to_path_buf());
        }
        self.update_image(|image| {
            image.set_file_info(file.info);
            image.load_data(file.data, Some(path.to_path_buf()));
        });
        Ok(())
    }

    /// Load the image `step` files after the current one.
    ///
    /// Returns `false` when there is no current file or no such neighbour.
    ///
    /// # Errors
    /// Returns a listing or loading error.
    pub fn load_next_image(&mut self, step: usize, pos: Option<usize>) -> Result<bool> {
        self.navigate(|path, image| {
            xrdpix_io::next_file(
                path,
                step,
                pos,
                image.iteration_mode(),
                image.known_extensions(),
            )
        })
    }

    /// Load the image `step` files before the current one.
    ///
    /// # Errors
    /// Returns a listing or loading error.
    pub fn load_previous_image(&mut self, step: usize, pos: Option<usize>) -> Result<bool> {
        self.navigate(|path, image| {
            xrdpix_io::previous_file(
                path,
                step,
                pos,
                image.iteration_mode(),
                image.known_extensions(),
            )
        })
    }

    /// Load the file of the same name from the next sibling folder.
    ///
    /// # Errors
    /// Returns a listing or loading error.
    pub fn load_next_folder(&mut self) -> Result<bool> {
        self.navigate(|path, _| xrdpix_io::next_folder(path))
    }

    /// Load the file of the same name from the previous sibling folder.
    ///
    /// # Errors
    /// Returns a listing or loading error.
    pub fn load_previous_folder(&mut self) -> Result<bool> {
        self.navigate(|path, _| xrdpix_io::previous_folder(path))
    }

    fn navigate(
        &mut self,
        find: impl FnOnce(&Path, &Image) -> xrdpix_io::Result<Option<PathBuf>>,
    ) -> Result<bool> {
        let Some(current) = self.image.filename() else {
            debug!("no current image file to navigate from");
            return Ok(false);
        };
        match find(current, &self.image)? {
            Some(path) => {
                self.load_image(path)?;
                Ok(true)
            }
            None => {
                debug!("no neighbouring image of {}", current.display());
                Ok(false)
            }
        }
    }

    /// Load a background image (raw orientation, same shape as the image).
    ///
    /// # Errors
    /// Returns a decoding error or `BackgroundDimensionWrong`.
    pub fn load_background_image<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let data = xrdpix_io::read_image(path)?;
        self.update_image(|image| image.set_background_data(data, Some(path.to_path_buf())))?;
        Ok(())
    }

    /// Load a mask file.
    ///
    /// # Errors
    /// Returns a format error or `DimensionMismatch` if the mask does not
    /// match the image.
    pub fn load_mask<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.sync_mask_shape();
        self.update_mask(|mask| mask.load(path))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            self.working_directories.mask = Some(dir.to_path_buf());
        }
        Ok(())
    }

    /// Save the mask.
    ///
    /// # Errors
    /// Returns an I/O error.
    pub fn save_mask<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Ok(self.mask.save(path)?)
    }

    /// Load a PONI calibration.
    ///
    /// # Errors
    /// Returns a format or I/O error; the calibration is unchanged.
    pub fn load_calibration<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.update_calibration(|calibration| calibration.load(path))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            self.working_directories.calibration = Some(dir.to_path_buf());
        }
        Ok(())
    }

    /// Save the calibration as PONI.
    ///
    /// # Errors
    /// Returns `NotCalibrated` or an I/O error.
    pub fn save_calibration<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        Ok(self.calibration.save(path)?)
    }

    /// Replace the pattern data with a pattern file (`.xy`, `.dat`, `.chi`).
    ///
    /// # Errors
    /// Returns a format or I/O error; the pattern is unchanged.
    pub fn load_pattern<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let loaded = read_pattern_file(path)?;
        let (x, y) = loaded.original_data();
        let (x, y) = (x.to_vec(), y.to_vec());
        self.update_pattern(|pattern| {
            pattern.set_name(loaded.name());
            pattern.set_data(x, y)
        })?;
        Ok(())
    }

    /// Export the published pattern; the format follows the extension.
    ///
    /// # Errors
    /// Returns a format or I/O error.
    pub fn save_pattern<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (x, y) = self.pattern.data();
        xrdpix_io::write_pattern(path, x, y, &self.export_header())?;
        Ok(())
    }

    /// Register the transfer-function correction `original / response`,
    /// given in raw detector orientation.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the arrays differ from each other or
    /// from the raw image.
    pub fn set_transfer_correction(
        &mut self,
        original: ArrayView2<'_, f64>,
        response: ArrayView2<'_, f64>,
    ) -> Result<()> {
        let mut correction = transfer_function(original, response)?;
        correction.data = self.to_image_grid(correction.data);
        self.update_image(|image| image.add_correction(corrections::TRANSFER, correction))?;
        Ok(())
    }

    /// [`Configuration::set_transfer_correction`] from two image files.
    ///
    /// # Errors
    /// Returns a decoding error or a shape mismatch.
    pub fn load_transfer_correction<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        original: P,
        response: Q,
    ) -> Result<()> {
        let original = xrdpix_io::read_image(original)?;
        let response = xrdpix_io::read_image(response)?;
        self.set_transfer_correction(original.view(), response.view())
    }

    /// Register the detector absorption correction for a sensor of
    /// `thickness` and attenuation length `absorption_length` (metres).
    ///
    /// # Errors
    /// Returns `NotCalibrated` or `InvalidParameter`.
    pub fn set_detector_absorption_correction(
        &mut self,
        thickness: f64,
        absorption_length: f64,
    ) -> Result<()> {
        self.sync_supersampling();
        let shape = self.image.shape();
        let correction =
            self.calibration
                .detector_absorption_correction(shape, thickness, absorption_length)?;
        self.update_image(|image| {
            image.add_correction(corrections::DETECTOR_ABSORPTION, correction)
        })?;
        Ok(())
    }

    /// Remove a named correction. Returns `true` if it was registered.
    pub fn remove_correction(&mut self, name: &str) -> bool {
        self.update_image(|image| image.remove_correction(name).is_some())
    }

    /// Raw-orientation array brought into image orientation and resolution.
    fn to_image_grid(&self, raw: Array2<f64>) -> Array2<f64> {
        let oriented = self
            .image
            .transformations()
            .iter()
            .fold(raw, |a, t| t.apply(a.view()));
        upsample_nearest(oriented.view(), self.image.supersampling())
    }

    /// Subtract an overlay from the pattern.
    ///
    /// # Errors
    /// Returns `NoBackgroundOverlap` if the ranges are disjoint; the
    /// previous background stays attached.
    pub fn set_background_pattern(&mut self, id: OverlayId, overlay: &Pattern) -> Result<()> {
        self.update_pattern(|p| p.set_background(BackgroundData::from_pattern(overlay)))?;
        self.background_overlay = Some(id);
        info!("overlay '{}' set as background", overlay.name());
        Ok(())
    }

    /// Stop subtracting an overlay.
    pub fn unset_background_pattern(&mut self) {
        self.background_overlay = None;
        self.update_pattern(Pattern::unset_background);
    }

    /// Record which overlay the attached background came from.
    pub(crate) fn link_background_overlay(&mut self, id: Option<OverlayId>) {
        self.background_overlay = id;
    }

    /// Re-snapshot the linked overlay after it changed. Failures are
    /// reported on `error_emitted`.
    pub(crate) fn refresh_background(&mut self, overlay: &Pattern) {
        let result = self
            .update_pattern(|p| p.set_background(BackgroundData::from_pattern(overlay)))
            .map_err(Error::from);
        self.trap(result);
    }

    /// Integrate the image into the pattern.
    ///
    /// # Errors
    /// Returns `NotCalibrated` or an integrator error; the pattern is
    /// unchanged on error.
    pub fn integrate_image_1d(&mut self) -> Result<()> {
        if !self.calibration.is_calibrated() {
            return Err(xrdpix_calib::Error::NotCalibrated.into());
        }
        let result = self.run_pattern_integration();
        self.flush_results();
        result.map(drop)
    }

    /// Integrate the image into the cake.
    ///
    /// # Errors
    /// Returns `NotCalibrated` or an integrator error; the cake is
    /// unchanged on error.
    pub fn integrate_image_2d(&mut self) -> Result<()> {
        if !self.calibration.is_calibrated() {
            return Err(xrdpix_calib::Error::NotCalibrated.into());
        }
        let result = self.run_cake_integration();
        self.flush_results();
        result.map(drop)
    }

    fn integration_mask(&self) -> Option<Array2<bool>> {
        if self.settings.use_mask {
            Some(self.mask.combined())
        } else {
            self.mask.roi_mask()
        }
    }

    /// Brings mask and calibration to the image supersampling.
    fn sync_supersampling(&mut self) {
        let n = self.image.supersampling();
        self.mask.set_supersampling(n);
        self.calibration.set_supersampling(n);
        self.sync_mask_shape();
        self.watchers.mask.take();
        self.watchers.calibration.take();
    }

    fn sync_mask_shape(&mut self) {
        let shape = self.image.shape();
        if !self.image.is_empty() && self.mask.shape() != shape {
            debug!("mask reset to image shape {shape:?}");
            self.mask.reset(shape.0, shape.1);
        }
    }

    /// Returns `false` when there is no image to integrate.
    fn run_pattern_integration(&mut self) -> Result<bool> {
        if self.image.is_empty() {
            return Ok(false);
        }
        self.sync_supersampling();
        let mask = self.integration_mask();
        let image = self.image.effective_image();
        let integrated = self.calibration.integrate_1d(
            image.view(),
            mask.as_ref().map(Array2::view),
            &self.settings.pattern_options(),
        )?;
        debug!(
            "integrated {} bins ({} empty)",
            integrated.len(),
            integrated.empty_bins()
        );
        let (x, y) = integrated.filled();
        let name = self.image_stem();
        let previous_name = self.pattern.name().to_string();
        if let Some(name) = &name {
            self.pattern.set_name(name.as_str());
        }
        if let Err(err) = self.pattern.set_data(x, y) {
            self.pattern.set_name(previous_name);
            return Err(err.into());
        }
        if self.settings.auto_save_integrated_pattern {
            let saved = self.auto_save_pattern();
            self.trap(saved);
        }
        Ok(true)
    }

    fn run_cake_integration(&mut self) -> Result<bool> {
        if self.image.is_empty() {
            return Ok(false);
        }
        self.sync_supersampling();
        let mask = self.integration_mask();
        let image = self.image.effective_image();
        self.cake = self.calibration.integrate_2d(
            image.view(),
            mask.as_ref().map(Array2::view),
            &self.settings.cake_options(),
        )?;
        self.cake_dirty = true;
        Ok(true)
    }

    fn image_stem(&self) -> Option<String> {
        self.image
            .filename()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
    }

    fn export_header(&self) -> ExportHeader {
        ExportHeader {
            source: self
                .image
                .filename()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            unit: self.settings.integration_unit,
            wavelength: self.calibration.wavelength(),
            calibration: self
                .calibration
                .params()
                .map(|p| p.to_poni_string(""))
                .unwrap_or_default(),
        }
    }

    /// Writes the integrated pattern in every configured format.
    fn auto_save_pattern(&self) -> Result<()> {
        let Some(dir) = self.working_directories.pattern.as_deref() else {
            debug!("auto-save skipped: no pattern directory");
            return Ok(());
        };
        let Some(stem) = self.image_stem() else {
            debug!("auto-save skipped: image has no file name");
            return Ok(());
        };
        let header = self.export_header();
        let subtracted = self.pattern.has_background() || self.pattern.auto_background_subtracted();
        for format in &self.settings.integrated_patterns_file_formats {
            let file = format!("{stem}{}", format.extension());
            let (x, y) = self.pattern.original_data();
            xrdpix_io::write_pattern(dir.join(&file), x, y, &header)?;
            if subtracted {
                let sub = dir.join(BKG_SUBTRACTED_DIR);
                std::fs::create_dir_all(&sub)?;
                let (x, y) = self.pattern.data();
                xrdpix_io::write_pattern(sub.join(&file), x, y, &header)?;
            }
        }
        Ok(())
    }

    /// Reacts to model changes: integrates and publishes signals in order.
    fn settle(&mut self) {
        let image = self.watchers.image.take();
        let mask = self.watchers.mask.take();
        let calibration = self.watchers.calibration.take();
        if image {
            self.sync_mask_shape();
            self.watchers.mask.take();
            self.img_changed.emit(&());
        }
        let mask_in_use = self.settings.use_mask || self.mask.roi().is_some();
        if image || calibration || (mask && mask_in_use) {
            self.auto_integrate();
        }
        self.flush_results();
    }

    fn auto_integrate(&mut self) {
        if !self.calibration.is_calibrated() {
            debug!("not calibrated, integration skipped");
            if !self.cake.is_empty() {
                self.cake = Cake::default();
                self.cake_dirty = true;
            }
            return;
        }
        if self.settings.auto_integrate_pattern {
            let result = self.run_pattern_integration().map(drop);
            self.trap(result);
        }
        if self.settings.auto_integrate_cake {
            let result = self.run_cake_integration().map(drop);
            self.trap(result);
        }
    }

    fn flush_results(&mut self) {
        if self.watchers.pattern.take() {
            self.pattern_changed.emit(&());
        }
        if std::mem::take(&mut self.cake_dirty) {
            self.cake_changed.emit(&());
        }
    }

    /// Drops pending change flags without notifying.
    fn discard_changes(&mut self) {
        self.watchers.image.take();
        self.watchers.mask.take();
        self.watchers.calibration.take();
        self.watchers.pattern.take();
        self.cake_dirty = false;
    }

    fn trap(&self, result: Result<()>) {
        if let Err(err) = result {
            warn!("{err}");
            self.error_emitted.emit(&err.report());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use xrdpix_calib::PoniParameters;
    use xrdpix_core::ErrorKind;

    fn params() -> PoniParameters {
        PoniParameters::default()
            .with_distance(0.1)
            .with_poni(3e-3, 3e-3)
            .with_pixel_size(1e-4, 1e-4)
            .with_wavelength(3.1e-11)
    }

    fn ring_image() -> Array2<f64> {
        Array2::from_shape_fn((60, 60), |(r, c)| {
            let d = ((r as f64 - 30.0).powi(2) + (c as f64 - 30.0).powi(2)).sqrt();
            100.0 * (-(d - 15.0).powi(2) / 4.0).exp() + 1.0
        })
    }

    fn record(config: &Configuration) -> (Rc<RefCell<Vec<&'static str>>>, Vec<Subscription>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let subs = [
            ("img", config.img_changed()),
            ("pattern", config.pattern_changed()),
            ("cake", config.cake_changed()),
        ]
        .into_iter()
        .map(|(name, signal)| {
            let sink = Rc::clone(&log);
            signal.subscribe(move |_| sink.borrow_mut().push(name))
        })
        .collect();
        (log, subs)
    }

    fn calibrated() -> Configuration {
        let mut config = Configuration::new();
        config
            .update_calibration(|c| c.set_params(params()))
            .unwrap();
        config
    }

    #[test]
    fn test_uncalibrated_image_load_leaves_pattern_empty() {
        let mut config = Configuration::new();
        let (log, _subs) = record(&config);
        config.update_image(|img| img.load_data(ring_image(), None));
        assert!(config.pattern().is_empty());
        assert_eq!(*log.borrow(), vec!["img"]);
        assert!(config.integrate_image_1d().is_err());
    }

    #[test]
    fn test_signal_order_with_cake() {
        let mut config = calibrated();
        config
            .update_settings(|s| s.auto_integrate_cake = true)
            .unwrap();
        let (log, _subs) = record(&config);
        config.update_image(|img| img.load_data(ring_image(), Some("frame_001.tif".into())));
        assert_eq!(*log.borrow(), vec!["img", "pattern", "cake"]);
        assert_eq!(config.pattern().name(), "frame_001");
        assert!(!config.cake().is_empty());
    }

    #[test]
    fn test_fixed_bin_count() {
        let mut config = calibrated();
        config
            .update_settings(|s| s.integration_num_points = Some(40))
            .unwrap();
        config.update_image(|img| img.load_data(Array2::from_elem((60, 60), 1.0), None));
        assert_eq!(config.pattern().len(), 40);
    }

    #[test]
    fn test_supersampling_keeps_intensities() {
        let mut config = calibrated();
        config
            .update_settings(|s| s.integration_num_points = Some(40))
            .unwrap();
        config.update_image(|img| img.load_data(Array2::from_elem((60, 60), 100.0), None));
        for y in config.pattern().y() {
            assert_relative_eq!(*y, 100.0, epsilon = 1e-9);
        }
        config.update_image(|img| img.set_supersampling(2));
        assert_eq!(config.image().shape(), (120, 120));
        assert_eq!(config.pattern().len(), 40);
        for y in config.pattern().y() {
            assert_relative_eq!(*y, 100.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_auto_bin_count_keeps_empty_bins() {
        let mut config = calibrated();
        config.update_image(|img| img.load_data(Array2::from_elem((60, 60), 1.0), None));
        let n = xrdpix_calib::integrator::auto_num_points((60, 60), 1);
        assert_eq!(config.pattern().x().len(), n);
        assert_eq!(config.pattern().y().len(), n);
        assert!(config.pattern().y().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_mask_change_reintegrates_only_when_used() {
        let mut config = calibrated();
        config.update_image(|img| img.load_data(ring_image(), None));
        let (log, _subs) = record(&config);
        config.update_mask(|m| m.mask_rect(0.0, 0.0, 10.0, 10.0));
        assert!(log.borrow().is_empty());

        config.update_settings(|s| s.use_mask = true).unwrap();
        assert_eq!(*log.borrow(), vec!["pattern"]);
        config.update_mask(Mask::clear_mask);
        assert_eq!(*log.borrow(), vec!["pattern", "pattern"]);
    }

    #[test]
    fn test_unit_round_trip_keeps_intensities() {
        let mut config = calibrated();
        config.update_image(|img| img.load_data(ring_image(), None));
        let before = config.pattern().y().to_vec();
        config.set_integration_unit(IntegrationUnit::Q).unwrap();
        assert_eq!(config.settings().integration_unit, IntegrationUnit::Q);
        config.set_integration_unit(IntegrationUnit::TwoTheta).unwrap();
        let after = config.pattern().y();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after) {
            assert_relative_eq!(a, b, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_unit_change_emits_twice_with_auto_background() {
        let mut config = calibrated();
        config.update_image(|img| img.load_data(ring_image(), None));
        config
            .update_pattern(|p| p.set_auto_background_subtraction(AutoBackgroundParams::default(), None))
            .unwrap();
        let (log, _subs) = record(&config);
        config.set_integration_unit(IntegrationUnit::Q).unwrap();
        assert_eq!(*log.borrow(), vec!["pattern", "pattern"]);
        assert!(config.pattern().auto_background_subtracted());
    }

    #[test]
    fn test_unit_change_without_wavelength_is_rejected() {
        let mut config = Configuration::new();
        config
            .update_pattern(|p| p.set_data(vec![1.0, 2.0, 3.0], vec![1.0, 1.0, 1.0]))
            .unwrap();
        let err = config.set_integration_unit(IntegrationUnit::D).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotCalibrated);
        assert_eq!(config.settings().integration_unit, IntegrationUnit::TwoTheta);
    }

    #[test]
    fn test_background_overlap_failure_is_reported() {
        let mut config = calibrated();
        config
            .update_pattern(|p| p.set_data(vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]))
            .unwrap();
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&reports);
        let _sub = config
            .error_emitted()
            .subscribe(move |r: &ErrorReport| sink.borrow_mut().push(r.kind));
        let far = Pattern::new(vec![500.0, 501.0], vec![1.0, 1.0], "far").unwrap();
        config.refresh_background(&far);
        assert_eq!(*reports.borrow(), vec![ErrorKind::NoBackgroundOverlap]);
    }

    #[test]
    fn test_copy_is_independent() {
        let mut config = calibrated();
        config.update_image(|img| img.load_data(ring_image(), None));
        let mut copy = config.copy().unwrap();
        assert_eq!(copy.calibration().params(), config.calibration().params());
        copy.update_image(|img| img.set_factor(2.0));
        assert_relative_eq!(config.image().factor(), 1.0);
        assert_eq!(copy.pattern().len(), config.pattern().len());
    }

    #[test]
    fn test_transfer_correction_maps_response_onto_original() {
        let original = ring_image();
        let response = original.mapv(|v| v * 0.5 + 2.0);

        let mut reference = calibrated();
        reference.update_image(|img| img.load_data(original.clone(), None));

        let mut corrected = calibrated();
        corrected.update_image(|img| img.load_data(response.clone(), None));
        corrected
            .set_transfer_correction(original.view(), response.view())
            .unwrap();
        for (a, b) in reference.pattern().y().iter().zip(corrected.pattern().y()) {
            assert_relative_eq!(a, b, max_relative = 1e-6);
        }
    }
}
