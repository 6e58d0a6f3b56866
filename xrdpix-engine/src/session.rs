//! Ordered configurations sharing one overlay list and one phase list.
//!
//! The session re-publishes the signals of the selected configuration on
//! its own `img_changed`, `pattern_changed` and `cake_changed`, so that
//! listeners survive configuration switches. While patterns (or cakes) are
//! combined, every configuration's `pattern_changed` (or `cake_changed`)
//! is forwarded.

#[cfg(feature = "hdf5")]
mod persist;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info};
use xrdpix_calib::Cake;
use xrdpix_core::{ErrorReport, Pattern, Signal, Subscription};

use crate::combine::{combine_cakes, combine_patterns, DEFAULT_COMBINED_CAKE_POINTS};
use crate::configuration::{read_pattern_file, Configuration};
use crate::overlay::{Overlay, OverlayId, OverlayModel};
use crate::phase::ReflectionPosition;
use crate::phase_model::PhaseModel;
use crate::{Error, Result};

/// The top-level state of a reduction session.
#[derive(Debug)]
pub struct Session {
    configurations: Vec<Configuration>,
    selected: usize,
    overlays: OverlayModel,
    phases: PhaseModel,
    combine_patterns: bool,
    combine_cakes: bool,
    combined_cake_points: usize,
    /// Combined cake, dropped on every `cake_changed`.
    combined_cake: Rc<RefCell<Option<Rc<Cake>>>>,
    _cake_invalidation: Subscription,
    forwarding: Vec<Subscription>,
    img_changed: Signal<()>,
    pattern_changed: Signal<()>,
    cake_changed: Signal<()>,
    error_emitted: Signal<ErrorReport>,
    configuration_added: Signal<()>,
    configuration_removed: Signal<usize>,
    configuration_selected: Signal<usize>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session holding one empty configuration.
    #[must_use]
    pub fn new() -> Self {
        let cake_changed = Signal::new();
        let combined_cake = Rc::new(RefCell::new(None));
        let cache = Rc::clone(&combined_cake);
        let _cake_invalidation = cake_changed.subscribe(move |()| {
            cache.borrow_mut().take();
        });
        let mut session = Self {
            configurations: vec![Configuration::new()],
            selected: 0,
            overlays: OverlayModel::new(),
            phases: PhaseModel::new(),
            combine_patterns: false,
            combine_cakes: false,
            combined_cake_points: DEFAULT_COMBINED_CAKE_POINTS,
            combined_cake,
            _cake_invalidation,
            forwarding: Vec::new(),
            img_changed: Signal::new(),
            pattern_changed: Signal::new(),
            cake_changed,
            error_emitted: Signal::new(),
            configuration_added: Signal::new(),
            configuration_removed: Signal::new(),
            configuration_selected: Signal::new(),
        };
        session.wire();
        session
    }

    /// Image of the selected configuration changed.
    #[must_use]
    pub fn img_changed(&self) -> &Signal<()> {
        &self.img_changed
    }

    /// Pattern of the selected configuration (or any, when combining) changed.
    #[must_use]
    pub fn pattern_changed(&self) -> &Signal<()> {
        &self.pattern_changed
    }

    /// Cake of the selected configuration (or any, when combining) changed.
    #[must_use]
    pub fn cake_changed(&self) -> &Signal<()> {
        &self.cake_changed
    }

    /// Errors trapped by any configuration.
    #[must_use]
    pub fn error_emitted(&self) -> &Signal<ErrorReport> {
        &self.error_emitted
    }

    #[must_use]
    pub fn configuration_added(&self) -> &Signal<()> {
        &self.configuration_added
    }

    /// Carries the former index of the removed configuration.
    #[must_use]
    pub fn configuration_removed(&self) -> &Signal<usize> {
        &self.configuration_removed
    }

    #[must_use]
    pub fn configuration_selected(&self) -> &Signal<usize> {
        &self.configuration_selected
    }

    #[must_use]
    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    #[must_use]
    pub fn configuration(&self, index: usize) -> Option<&Configuration> {
        self.configurations.get(index)
    }

    /// Mutable access to any configuration; only the selected one is
    /// forwarded on the session signals.
    pub fn configuration_mut(&mut self, index: usize) -> Option<&mut Configuration> {
        self.configurations.get_mut(index)
    }

    #[must_use]
    pub fn selected_index(&self) -> usize {
        self.selected
    }

    #[must_use]
    pub fn current(&self) -> &Configuration {
        &self.configurations[self.selected]
    }

    pub fn current_mut(&mut self) -> &mut Configuration {
        &mut self.configurations[self.selected]
    }

    /// Reconnects the session signals to the current configuration set.
    fn wire(&mut self) {
        self.forwarding.clear();
        let current = &self.configurations[self.selected];
        let mut forwarding = vec![current.img_changed().forward_to(&self.img_changed)];
        for (index, config) in self.configurations.iter().enumerate() {
            let selected = index == self.selected;
            if selected || self.combine_patterns {
                forwarding.push(config.pattern_changed().forward_to(&self.pattern_changed));
            }
            if selected || self.combine_cakes {
                forwarding.push(config.cake_changed().forward_to(&self.cake_changed));
            }
            forwarding.push(config.error_emitted().forward_to(&self.error_emitted));
        }
        self.forwarding = forwarding;
    }

    fn check(&self, index: usize) -> Result<()> {
        if index < self.configurations.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                what: "configuration",
                index,
                len: self.configurations.len(),
            })
        }
    }

    /// Append a configuration seeded from the current one and select it.
    ///
    /// The new configuration takes over the settings, working directories
    /// and a value copy of the current image; the calibration is carried
    /// over through a PONI round trip. Returns the new index.
    ///
    /// # Errors
    /// Returns an I/O error if the calibration cannot be transferred.
    pub fn add_configuration(&mut self) -> Result<usize> {
        let current = self.current();
        let mut config = Configuration::with_settings(current.settings().clone())?;
        *config.working_directories_mut() = current.working_directories().clone();
        config.transfer_calibration(current.calibration())?;
        let image = current.image();
        if !image.is_empty() {
            let raw = image.raw_data().to_owned();
            let filename = image.filename().map(Path::to_path_buf);
            let file_info = image.file_info().to_string();
            config.update_image(|img| {
                img.set_file_info(file_info);
                img.load_data(raw, filename);
            });
        }
        self.configurations.push(config);
        let index = self.configurations.len() - 1;
        info!("configuration {index} added");
        self.configuration_added.emit(&());
        self.select_configuration(index)?;
        Ok(index)
    }

    /// Remove the selected configuration; the one at the same index (or
    /// the new last one) becomes selected.
    ///
    /// # Errors
    /// Returns `InvalidParameter` when only one configuration is left.
    pub fn remove_configuration(&mut self) -> Result<()> {
        if self.configurations.len() <= 1 {
            return Err(Error::InvalidParameter(
                "cannot remove the last configuration".into(),
            ));
        }
        let index = self.selected;
        self.forwarding.clear();
        self.configurations.remove(index);
        self.selected = index.min(self.configurations.len() - 1);
        info!("configuration {index} removed");
        self.configuration_removed.emit(&index);
        self.select_configuration(self.selected)
    }

    /// Make configuration `index` current and re-publish its state.
    ///
    /// Emits `configuration_selected(index)`, then `img_changed`,
    /// `pattern_changed` and `cake_changed`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index.
    pub fn select_configuration(&mut self, index: usize) -> Result<()> {
        self.check(index)?;
        self.selected = index;
        self.wire();
        debug!("configuration {index} selected");
        self.configuration_selected.emit(&index);
        self.img_changed.emit(&());
        self.pattern_changed.emit(&());
        self.cake_changed.emit(&());
        Ok(())
    }

    #[must_use]
    pub fn combine_patterns(&self) -> bool {
        self.combine_patterns
    }

    /// Switch between the selected and the combined pattern.
    pub fn set_combine_patterns(&mut self, combine: bool) {
        self.combine_patterns = combine;
        self.wire();
        self.pattern_changed.emit(&());
    }

    #[must_use]
    pub fn combine_cakes(&self) -> bool {
        self.combine_cakes
    }

    /// Switch between the selected and the combined cake.
    pub fn set_combine_cakes(&mut self, combine: bool) {
        self.combine_cakes = combine;
        self.combined_cake.borrow_mut().take();
        self.wire();
        self.cake_changed.emit(&());
    }

    #[must_use]
    pub fn combined_cake_points(&self) -> usize {
        self.combined_cake_points
    }

    /// Edge length of the combined cake grid.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for 0.
    pub fn set_combined_cake_points(&mut self, points: usize) -> Result<()> {
        if points == 0 {
            return Err(Error::InvalidParameter(
                "combined cake needs at least one point".into(),
            ));
        }
        self.combined_cake_points = points;
        self.combined_cake.borrow_mut().take();
        if self.combine_cakes {
            self.cake_changed.emit(&());
        }
        Ok(())
    }

    /// Patterns of all configurations merged along x.
    ///
    /// # Errors
    /// See [`combine_patterns`].
    pub fn combined_pattern(&self) -> Result<Pattern> {
        combine_patterns(self.configurations.iter().map(Configuration::pattern))
    }

    /// Cakes of all configurations summed on a common grid.
    ///
    /// While cakes are combined the result is kept until the next
    /// `cake_changed`.
    ///
    /// # Errors
    /// See [`combine_cakes`].
    pub fn combined_cake(&self) -> Result<Rc<Cake>> {
        if self.combine_cakes {
            if let Some(cake) = self.combined_cake.borrow().as_ref() {
                return Ok(Rc::clone(cake));
            }
        }
        let cake = Rc::new(combine_cakes(
            self.configurations.iter().map(Configuration::cake),
            self.combined_cake_points,
        )?);
        if self.combine_cakes {
            debug!("combined cake cached");
            *self.combined_cake.borrow_mut() = Some(Rc::clone(&cake));
        }
        Ok(cake)
    }

    /// Runs `step` on every configuration; all are attempted and the first
    /// error is returned.
    fn lockstep(&mut self, step: impl Fn(&mut Configuration) -> Result<bool>) -> Result<()> {
        let mut first_error = None;
        for config in &mut self.configurations {
            if let Err(err) = step(config) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Advance every configuration by `step` image files.
    ///
    /// # Errors
    /// Returns the first navigation error.
    pub fn next_image(&mut self, step: usize, pos: Option<usize>) -> Result<()> {
        self.lockstep(|c| c.load_next_image(step, pos))
    }

    /// Step every configuration back by `step` image files.
    ///
    /// # Errors
    /// Returns the first navigation error.
    pub fn previous_image(&mut self, step: usize, pos: Option<usize>) -> Result<()> {
        self.lockstep(|c| c.load_previous_image(step, pos))
    }

    /// Move every configuration to the next sibling folder.
    ///
    /// # Errors
    /// Returns the first navigation error.
    pub fn next_folder(&mut self) -> Result<()> {
        self.lockstep(Configuration::load_next_folder)
    }

    /// Move every configuration to the previous sibling folder.
    ///
    /// # Errors
    /// Returns the first navigation error.
    pub fn previous_folder(&mut self) -> Result<()> {
        self.lockstep(Configuration::load_previous_folder)
    }

    #[must_use]
    pub fn overlays(&self) -> &OverlayModel {
        &self.overlays
    }

    /// Append an overlay.
    pub fn add_overlay(&mut self, pattern: Pattern) -> OverlayId {
        self.overlays.push(pattern)
    }

    /// Load a pattern file as an overlay.
    ///
    /// # Errors
    /// Returns a format or I/O error.
    pub fn load_overlay<P: AsRef<Path>>(&mut self, path: P) -> Result<OverlayId> {
        let path = path.as_ref();
        let pattern = read_pattern_file(path)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            self.current_mut().working_directories_mut().overlay = Some(dir.to_path_buf());
        }
        Ok(self.overlays.push(pattern))
    }

    /// Snapshot the current pattern as an overlay.
    pub fn add_overlay_from_current(&mut self) -> OverlayId {
        let pattern = self.configurations[self.selected].pattern();
        self.overlays.add_overlay(pattern)
    }

    /// Remove an overlay, detaching it from every configuration using it
    /// as background.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index.
    pub fn remove_overlay(&mut self, index: usize) -> Result<Overlay> {
        let id = self
            .overlays
            .get(index)
            .map(Overlay::id)
            .ok_or(Error::IndexOutOfRange {
                what: "overlay",
                index,
                len: self.overlays.len(),
            })?;
        for config in &mut self.configurations {
            if config.background_overlay() == Some(id) {
                config.unset_background_pattern();
            }
        }
        self.overlays.remove_overlay(index)
    }

    /// Remove every overlay and every background link.
    pub fn clear_overlays(&mut self) {
        for config in &mut self.configurations {
            if config.background_overlay().is_some() {
                config.unset_background_pattern();
            }
        }
        self.overlays.clear();
    }

    /// Rename an overlay.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index.
    pub fn rename_overlay(&mut self, index: usize, name: &str) -> Result<()> {
        self.overlays.rename(index, name)
    }

    /// Set an overlay's scaling; linked backgrounds follow.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` or the pattern's error.
    pub fn set_overlay_scaling(&mut self, index: usize, scaling: f64) -> Result<()> {
        self.overlays.set_scaling(index, scaling)?;
        self.refresh_linked_backgrounds(index);
        Ok(())
    }

    /// Set an overlay's offset; linked backgrounds follow.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` or the pattern's error.
    pub fn set_overlay_offset(&mut self, index: usize, offset: f64) -> Result<()> {
        self.overlays.set_offset(index, offset)?;
        self.refresh_linked_backgrounds(index);
        Ok(())
    }

    fn refresh_linked_backgrounds(&mut self, index: usize) {
        let Some(overlay) = self.overlays.get(index) else {
            return;
        };
        for config in &mut self.configurations {
            if config.background_overlay() == Some(overlay.id()) {
                config.refresh_background(overlay.pattern());
            }
        }
    }

    /// Subtract overlay `index` from the current pattern.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` or `NoBackgroundOverlap`.
    pub fn set_overlay_as_background(&mut self, index: usize) -> Result<()> {
        let overlay = self.overlays.get(index).ok_or(Error::IndexOutOfRange {
            what: "overlay",
            index,
            len: self.overlays.len(),
        })?;
        self.configurations[self.selected].set_background_pattern(overlay.id(), overlay.pattern())
    }

    /// Stop subtracting an overlay from the current pattern.
    pub fn unset_overlay_background(&mut self) {
        self.current_mut().unset_background_pattern();
    }

    /// Index of the overlay subtracted from the current pattern.
    #[must_use]
    pub fn background_overlay_index(&self) -> Option<usize> {
        self.current()
            .background_overlay()
            .and_then(|id| self.overlays.index_of(id))
    }

    #[must_use]
    pub fn phases(&self) -> &PhaseModel {
        &self.phases
    }

    pub fn phases_mut(&mut self) -> &mut PhaseModel {
        &mut self.phases
    }

    /// Load a JCPDS phase file.
    ///
    /// # Errors
    /// Returns a format or I/O error.
    pub fn load_phase<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let index = self.phases.load_phase(path)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            self.current_mut().working_directories_mut().phase = Some(PathBuf::from(dir));
        }
        Ok(index)
    }

    /// Line positions of phase `index` in the current unit and wavelength.
    ///
    /// # Errors
    /// Returns `NotCalibrated` without a wavelength, `IndexOutOfRange`, or
    /// the equation of state error.
    pub fn reflection_positions(&self, index: usize) -> Result<Vec<ReflectionPosition>> {
        let current = self.current();
        let wavelength = current
            .calibration()
            .wavelength()
            .ok_or(xrdpix_calib::Error::NotCalibrated)?;
        self.phases
            .reflection_positions(index, wavelength, current.settings().integration_unit)
    }
}
