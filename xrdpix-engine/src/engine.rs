//! Headless entry point over a [`Session`].

use std::borrow::Cow;
use std::path::Path;

use ndarray::{Array2, ArrayView2};
use xrdpix_calib::Cake;
use xrdpix_core::{ErrorReport, Pattern, Signal};

use crate::configuration::Configuration;
use crate::session::Session;
use crate::Result;

/// Command and query surface for a user interface or a script.
///
/// Loaders act on the current configuration. Signals are the session's
/// (and its overlay and phase models'); subscribing once is enough to
/// follow configuration switches and session loads.
#[derive(Debug, Default)]
pub struct Engine {
    session: Session,
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// # Errors
    /// See [`Configuration::load_image`].
    pub fn load_image<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.session.current_mut().load_image(path)
    }

    /// # Errors
    /// See [`Configuration::load_mask`].
    pub fn load_mask<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.session.current_mut().load_mask(path)
    }

    /// # Errors
    /// See [`Configuration::load_calibration`].
    pub fn load_calibration<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.session.current_mut().load_calibration(path)
    }

    /// # Errors
    /// See [`Configuration::load_pattern`].
    pub fn load_pattern<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.session.current_mut().load_pattern(path)
    }

    /// # Errors
    /// See [`Session::load`].
    #[cfg(feature = "hdf5")]
    pub fn load_session<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.session.load(path)
    }

    /// # Errors
    /// See [`Session::save`].
    #[cfg(feature = "hdf5")]
    pub fn save_session<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.session.save(path)
    }

    #[must_use]
    pub fn img_changed(&self) -> &Signal<()> {
        self.session.img_changed()
    }

    #[must_use]
    pub fn pattern_changed(&self) -> &Signal<()> {
        self.session.pattern_changed()
    }

    #[must_use]
    pub fn cake_changed(&self) -> &Signal<()> {
        self.session.cake_changed()
    }

    #[must_use]
    pub fn error_emitted(&self) -> &Signal<ErrorReport> {
        self.session.error_emitted()
    }

    #[must_use]
    pub fn configuration_added(&self) -> &Signal<()> {
        self.session.configuration_added()
    }

    #[must_use]
    pub fn configuration_removed(&self) -> &Signal<usize> {
        self.session.configuration_removed()
    }

    #[must_use]
    pub fn configuration_selected(&self) -> &Signal<usize> {
        self.session.configuration_selected()
    }

    #[must_use]
    pub fn overlay_added(&self) -> &Signal<()> {
        self.session.overlays().overlay_added()
    }

    #[must_use]
    pub fn overlay_removed(&self) -> &Signal<usize> {
        self.session.overlays().overlay_removed()
    }

    #[must_use]
    pub fn overlay_changed(&self) -> &Signal<usize> {
        self.session.overlays().overlay_changed()
    }

    #[must_use]
    pub fn phase_added(&self) -> &Signal<()> {
        self.session.phases().phase_added()
    }

    #[must_use]
    pub fn phase_removed(&self) -> &Signal<usize> {
        self.session.phases().phase_removed()
    }

    #[must_use]
    pub fn phase_changed(&self) -> &Signal<usize> {
        self.session.phases().phase_changed()
    }

    /// Displayed image of the current configuration.
    #[must_use]
    pub fn img_data(&self) -> ArrayView2<'_, f64> {
        self.session.current().image().data()
    }

    #[must_use]
    pub fn mask_data(&self) -> ArrayView2<'_, bool> {
        self.session.current().mask().data()
    }

    /// Current pattern, or the combined one while patterns are combined.
    ///
    /// # Errors
    /// Returns the combination error.
    pub fn pattern(&self) -> Result<Cow<'_, Pattern>> {
        if self.session.combine_patterns() {
            Ok(Cow::Owned(self.session.combined_pattern()?))
        } else {
            Ok(Cow::Borrowed(self.session.current().pattern()))
        }
    }

    /// Runs `f` on the current cake, or on the combined one while cakes
    /// are combined.
    fn with_cake<R>(&self, f: impl FnOnce(&Cake) -> R) -> Result<R> {
        if self.session.combine_cakes() {
            let cake = self.session.combined_cake()?;
            Ok(f(&cake))
        } else {
            Ok(f(self.session.current().cake()))
        }
    }

    /// Cake intensity, `[azimuth, 2θ]`.
    ///
    /// # Errors
    /// Returns the combination error.
    pub fn cake_data(&self) -> Result<Array2<f64>> {
        self.with_cake(|cake| cake.intensity.clone())
    }

    /// Radial cake axis, 2θ degrees.
    ///
    /// # Errors
    /// Returns the combination error.
    pub fn cake_tth(&self) -> Result<Vec<f64>> {
        self.with_cake(|cake| cake.tth.clone())
    }

    /// Azimuthal cake axis, degrees.
    ///
    /// # Errors
    /// Returns the combination error.
    pub fn cake_azi(&self) -> Result<Vec<f64>> {
        self.with_cake(|cake| cake.azimuth.clone())
    }

    #[must_use]
    pub fn configurations(&self) -> &[Configuration] {
        self.session.configurations()
    }

    #[must_use]
    pub fn current_configuration(&self) -> &Configuration {
        self.session.current()
    }

    pub fn current_configuration_mut(&mut self) -> &mut Configuration {
        self.session.current_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_pattern_follows_combine_flag() {
        let mut engine = Engine::new();
        engine
            .current_configuration_mut()
            .update_pattern(|p| p.set_data(vec![0.0, 1.0], vec![1.0, 1.0]))
            .unwrap();
        assert!(matches!(engine.pattern().unwrap(), Cow::Borrowed(_)));
        engine.session_mut().set_combine_patterns(true);
        let combined = engine.pattern().unwrap();
        assert_eq!(combined.name(), crate::combine::COMBINED_PATTERN_NAME);
        assert_eq!(combined.y(), &[1.0, 1.0]);
    }

    #[test]
    fn test_combined_cake_is_reused_until_cake_changes() {
        let mut engine = Engine::new();
        let params = xrdpix_calib::PoniParameters::default()
            .with_distance(0.1)
            .with_poni(2e-3, 2e-3)
            .with_pixel_size(1e-4, 1e-4)
            .with_wavelength(3.1e-11);
        let config = engine.current_configuration_mut();
        config
            .update_settings(|s| {
                s.auto_integrate_cake = true;
                s.cake_azimuth_points = 18;
            })
            .unwrap();
        config.update_calibration(|c| c.set_params(params)).unwrap();
        config.update_image(|img| img.load_data(Array2::from_elem((40, 40), 1.0), None));
        let session = engine.session_mut();
        session.set_combine_cakes(true);
        session.set_combined_cake_points(16).unwrap();

        let first = session.combined_cake().unwrap();
        assert_eq!(first.intensity.dim(), (16, 16));
        assert!(Rc::ptr_eq(&first, &session.combined_cake().unwrap()));
        assert_eq!(engine.cake_tth().unwrap(), first.tth);
        assert_eq!(engine.cake_data().unwrap(), first.intensity);

        engine
            .current_configuration_mut()
            .update_image(|img| img.set_factor(3.0));
        let second = engine.session().combined_cake().unwrap();
        assert!(!Rc::ptr_eq(&first, &second));
        for (a, b) in first.intensity.iter().zip(&second.intensity) {
            assert_relative_eq!(3.0 * a, *b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_signals_survive_configuration_switch() {
        let mut engine = Engine::new();
        let count = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&count);
        let _sub = engine.img_changed().subscribe(move |()| *sink.borrow_mut() += 1);
        engine.session_mut().add_configuration().unwrap();
        *count.borrow_mut() = 0;
        engine
            .current_configuration_mut()
            .update_image(|img| img.load_data(Array2::zeros((2, 2)), None));
        assert_eq!(*count.borrow(), 1);
        assert!(engine.cake_data().unwrap().is_empty());
    }
}
