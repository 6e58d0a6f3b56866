use std::cell::RefCell;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use approx::assert_relative_eq;
use ndarray::Array2;
use tempfile::tempdir;
use tiff::encoder::{colortype, TiffEncoder};
use xrdpix_calib::PoniParameters;
use xrdpix_core::interp::linspace;
use xrdpix_core::{Pattern, Subscription};
use xrdpix_engine::{Engine, IntegrationSettings, Session, BKG_SUBTRACTED_DIR};
use xrdpix_io::PatternFormat;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn params() -> PoniParameters {
    PoniParameters::default()
        .with_distance(0.1)
        .with_poni(3.2e-3, 3.2e-3)
        .with_pixel_size(1e-4, 1e-4)
        .with_wavelength(3.1e-11)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn write_ring(path: &Path, amplitude: f64) {
    let (width, height) = (64u32, 64u32);
    let pixels: Vec<u16> = (0..height)
        .flat_map(|r| (0..width).map(move |c| (r, c)))
        .map(|(r, c)| {
            let d = ((f64::from(r) - 32.0).powi(2) + (f64::from(c) - 32.0).powi(2)).sqrt();
            (amplitude * (-(d - 16.0).powi(2) / 4.0).exp() + 10.0) as u16
        })
        .collect();
    let file = File::create(path).unwrap();
    TiffEncoder::new(file)
        .unwrap()
        .write_image::<colortype::Gray16>(width, height, &pixels)
        .unwrap();
}

fn record(session: &Session) -> (Rc<RefCell<Vec<String>>>, Vec<Subscription>) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut subs = Vec::new();
    let sink = Rc::clone(&log);
    subs.push(
        session
            .configuration_selected()
            .subscribe(move |i| sink.borrow_mut().push(format!("selected {i}"))),
    );
    for (name, signal) in [
        ("img", session.img_changed()),
        ("pattern", session.pattern_changed()),
        ("cake", session.cake_changed()),
    ] {
        let sink = Rc::clone(&log);
        subs.push(signal.subscribe(move |()| sink.borrow_mut().push(name.to_string())));
    }
    (log, subs)
}

#[test]
fn test_select_configuration_order() {
    init_logging();
    let mut session = Session::new();
    session
        .current_mut()
        .update_image(|img| img.load_data(Array2::from_elem((8, 8), 1.0), None));
    session.add_configuration().unwrap();
    let second = Array2::from_shape_fn((8, 8), |(r, c)| (r * 8 + c) as f64);
    session
        .current_mut()
        .update_image(|img| img.load_data(second.clone(), None));
    session.select_configuration(0).unwrap();

    let (log, _subs) = record(&session);
    session.select_configuration(1).unwrap();
    assert_eq!(
        *log.borrow(),
        vec!["selected 1", "img", "pattern", "cake"]
    );
    assert_eq!(session.current().image().raw_data(), second.view());
}

#[test]
fn test_combined_pattern_across_configurations() {
    let mut session = Session::new();
    session
        .current_mut()
        .update_pattern(|p| p.set_data(linspace(0.0, 10.0, 50), vec![1.0; 50]))
        .unwrap();
    session.add_configuration().unwrap();
    session
        .current_mut()
        .update_pattern(|p| p.set_data(linspace(7.0, 15.0, 50), vec![2.0; 50]))
        .unwrap();

    let combined = session.combined_pattern().unwrap();
    let (x, y) = combined.data();
    assert_relative_eq!(x[0], 0.0);
    assert_relative_eq!(*x.last().unwrap(), 15.0);
    for (&xi, &yi) in x.iter().zip(y) {
        if xi < 7.0 {
            assert_relative_eq!(yi, 1.0);
        } else if xi <= 10.0 {
            assert_relative_eq!(yi, 1.5);
        } else {
            assert_relative_eq!(yi, 2.0);
        }
    }
}

#[test]
fn test_combine_flag_forwards_every_pattern() {
    let mut session = Session::new();
    session.add_configuration().unwrap();
    let count = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&count);
    let _sub = session
        .pattern_changed()
        .subscribe(move |()| *sink.borrow_mut() += 1);

    let touch = |session: &mut Session| {
        session
            .configuration_mut(0)
            .unwrap()
            .update_pattern(|p| p.set_data(vec![0.0, 1.0], vec![1.0, 1.0]))
            .unwrap();
    };
    touch(&mut session);
    assert_eq!(*count.borrow(), 0);
    session.set_combine_patterns(true);
    *count.borrow_mut() = 0;
    touch(&mut session);
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn test_remove_then_add_overlay_keeps_length() {
    let mut session = Session::new();
    for name in ["a", "b", "c"] {
        session.add_overlay(Pattern::new(vec![0.0, 1.0], vec![1.0, 2.0], name).unwrap());
    }
    let removed = session.remove_overlay(1).unwrap();
    session.add_overlay(removed.pattern().snapshot());
    assert_eq!(session.overlays().len(), 3);
}

#[test]
fn test_lockstep_image_iteration() {
    let dir = tempdir().unwrap();
    for sub in ["a", "b"] {
        std::fs::create_dir(dir.path().join(sub)).unwrap();
        for i in 1..=3u32 {
            let amplitude = f64::from(i) * if sub == "a" { 100.0 } else { 1000.0 };
            write_ring(&dir.path().join(sub).join(format!("{sub}_{i:03}.tif")), amplitude);
        }
    }

    let mut engine = Engine::new();
    engine.load_image(dir.path().join("a/a_001.tif")).unwrap();
    engine.session_mut().add_configuration().unwrap();
    engine.load_image(dir.path().join("b/b_001.tif")).unwrap();

    engine.session_mut().next_image(1, None).unwrap();
    let names: Vec<String> = engine
        .configurations()
        .iter()
        .map(|c| {
            c.image()
                .filename()
                .and_then(Path::file_name)
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    assert_eq!(names, vec!["a_002.tif", "b_002.tif"]);

    engine.session_mut().previous_image(1, None).unwrap();
    assert!(engine.configurations()[0]
        .image()
        .filename()
        .unwrap()
        .ends_with("a_001.tif"));
}

#[test]
fn test_auto_save_writes_raw_and_background_subtracted() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("ring.tif");
    write_ring(&image, 500.0);
    let out = dir.path().join("patterns");
    std::fs::create_dir(&out).unwrap();

    let mut engine = Engine::new();
    let settings = IntegrationSettings::new()
        .with_integration_num_points(Some(100))
        .with_auto_save_integrated_pattern(true)
        .with_integrated_patterns_file_formats([PatternFormat::Xy, PatternFormat::Chi]);
    let config = engine.current_configuration_mut();
    config.set_settings(settings).unwrap();
    config.working_directories_mut().pattern = Some(out.clone());
    config.update_calibration(|c| c.set_params(params())).unwrap();

    engine.load_image(&image).unwrap();
    assert!(!engine.current_configuration().pattern().is_empty());
    assert!(out.join("ring.xy").exists());
    assert!(out.join("ring.chi").exists());
    assert!(!out.join(BKG_SUBTRACTED_DIR).exists());

    engine.session_mut().add_overlay_from_current();
    engine.session_mut().set_overlay_as_background(0).unwrap();
    engine.load_image(&image).unwrap();
    assert!(out.join(BKG_SUBTRACTED_DIR).join("ring.xy").exists());
    let (_, y) = engine.current_configuration().pattern().data();
    assert!(y.iter().all(|v| v.abs() < 1e-9));
}
