#![cfg(feature = "hdf5")]

use std::cell::RefCell;
use std::rc::Rc;

use approx::assert_relative_eq;
use ndarray::Array2;
use tempfile::tempdir;
use xrdpix_calib::PoniParameters;
use xrdpix_core::{AutoBackgroundParams, Correction, CorrectionMode, IntegrationUnit, Pattern, Roi};
use xrdpix_engine::{Engine, IntegrationSettings};

fn params() -> PoniParameters {
    PoniParameters::default()
        .with_distance(0.1)
        .with_poni(3e-3, 3.5e-3)
        .with_rotations(0.01, -0.02, 0.0)
        .with_pixel_size(1e-4, 1e-4)
        .with_wavelength(3.1e-11)
}

#[allow(clippy::cast_precision_loss)]
fn ring_image() -> Array2<f64> {
    Array2::from_shape_fn((60, 70), |(r, c)| {
        let d = ((r as f64 - 30.0).powi(2) + (c as f64 - 35.0).powi(2)).sqrt();
        100.0 * (-(d - 18.0).powi(2) / 4.0).exp() + 1.0
    })
}

fn populated_engine() -> Engine {
    let mut engine = Engine::new();
    let config = engine.current_configuration_mut();
    config
        .set_settings(
            IntegrationSettings::new()
                .with_integration_unit(IntegrationUnit::Q)
                .with_integration_num_points(Some(300))
                .with_use_mask(true)
                .with_auto_integrate_cake(true)
                .with_cake_azimuth_points(90),
        )
        .unwrap();
    config.update_calibration(|c| c.set_params(params())).unwrap();
    config.update_image(|img| {
        img.load_data(ring_image(), Some("/data/run7/frame_0001.tif".into()));
        img.set_file_info("exposure 1 s");
        img.flip_horizontal();
        img.set_factor(1.5);
    });
    config
        .update_image(|img| {
            img.add_correction(
                "flat",
                Correction::new(Array2::from_elem((60, 70), 0.9), CorrectionMode::Divide),
            )
        })
        .unwrap();
    config.update_mask(|m| {
        m.mask_ellipse(10.0, 10.0, 4.0, 3.0);
        m.set_roi(Some(Roi::new(2.0, 2.0, 50.0, 40.0)));
    });
    config
        .update_pattern(|p| {
            p.set_scaling(1.2)?;
            p.set_auto_background_subtraction(AutoBackgroundParams::new().with_smooth_width(0.05), None)
        })
        .unwrap();
    config.working_directories_mut().image = Some("/data/run7".into());

    let session = engine.session_mut();
    session.add_overlay(Pattern::new(vec![0.0, 10.0], vec![3.0, 3.0], "flat bg").unwrap());
    session.set_overlay_scaling(0, 0.5).unwrap();
    session.add_configuration().unwrap();
    session.set_combine_cakes(true);
    session.set_combined_cake_points(64).unwrap();
    engine
}

#[test]
fn test_session_roundtrip_preserves_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.h5");
    let mut engine = populated_engine();
    engine.session_mut().select_configuration(0).unwrap();
    engine.save_session(&path).unwrap();

    let mut loaded = Engine::new();
    loaded.load_session(&path).unwrap();

    assert_eq!(loaded.configurations().len(), 2);
    assert_eq!(loaded.session().selected_index(), 0);
    assert!(loaded.session().combine_cakes());
    assert_eq!(loaded.session().combined_cake_points(), 64);

    let (a, b) = (engine.current_configuration(), loaded.current_configuration());
    assert_eq!(a.settings(), b.settings());
    assert_eq!(a.working_directories(), b.working_directories());
    assert_eq!(a.calibration().params(), b.calibration().params());
    assert_eq!(a.image().raw_data(), b.image().raw_data());
    assert_eq!(a.image().data(), b.image().data());
    assert_eq!(a.image().transformations(), b.image().transformations());
    assert_eq!(a.image().file_info(), b.image().file_info());
    assert_relative_eq!(b.image().factor(), 1.5);
    assert_eq!(
        a.image().correction("flat").map(|c| c.mode),
        b.image().correction("flat").map(|c| c.mode)
    );
    assert_eq!(a.mask().data(), b.mask().data());
    assert_eq!(a.mask().roi(), b.mask().roi());
    assert_eq!(a.pattern().original_data(), b.pattern().original_data());
    assert_eq!(a.pattern().auto_background_params(), b.pattern().auto_background_params());
    assert_relative_eq!(b.pattern().scaling(), 1.2);
    for (ya, yb) in a.pattern().y().iter().zip(b.pattern().y()) {
        assert_relative_eq!(ya, yb, epsilon = 1e-9);
    }
    assert_eq!(a.cake().intensity.dim(), b.cake().intensity.dim());

    let overlay = loaded.session().overlays().get(0).unwrap().pattern();
    assert_eq!(overlay.name(), "flat bg");
    assert_relative_eq!(overlay.scaling(), 0.5);
    assert_eq!(overlay.y(), &[1.5, 1.5]);
}

#[test]
fn test_load_publishes_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.h5");
    populated_engine().save_session(&path).unwrap();

    let mut engine = Engine::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut subs = Vec::new();
    for (name, signal) in [
        ("img", engine.img_changed()),
        ("pattern", engine.pattern_changed()),
    ] {
        let sink = Rc::clone(&log);
        subs.push(signal.subscribe(move |()| sink.borrow_mut().push(name)));
    }
    engine.load_session(&path).unwrap();
    assert_eq!(*log.borrow(), vec!["img", "pattern"]);
    assert_eq!(engine.session().selected_index(), 1);
}

#[test]
fn test_corrupt_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.h5");
    std::fs::write(&path, b"not hdf5").unwrap();
    let mut engine = Engine::new();
    assert!(engine.load_session(&path).is_err());
    assert_eq!(engine.configurations().len(), 1);
}
