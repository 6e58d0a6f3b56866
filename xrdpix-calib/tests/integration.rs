use approx::assert_relative_eq;
use ndarray::Array2;
use xrdpix_calib::corrections::{transfer_function, TRANSFER};
use xrdpix_calib::geometry::pixel_angles;
use xrdpix_calib::{CakeOptions, Calibration, IntegrationOptions, PoniParameters};
use xrdpix_core::Image;

fn s1_params() -> PoniParameters {
    PoniParameters::default()
        .with_distance(0.2)
        .with_poni(0.1, 0.1)
        .with_rotations(0.0, 0.0, 0.0)
        .with_pixel_size(1e-4, 1e-4)
        .with_wavelength(3.1e-11)
}

#[allow(clippy::cast_precision_loss)]
fn ring_image(params: &PoniParameters, shape: (usize, usize), centre: f64, sigma: f64) -> Array2<f64> {
    Array2::from_shape_fn(shape, |(r, c)| {
        let tth = pixel_angles(params, r as f64, c as f64).0.to_degrees();
        (-(tth - centre).powi(2) / (2.0 * sigma * sigma)).exp()
    })
}

#[test]
fn test_single_ring_position_and_width() {
    let params = s1_params();
    let image = ring_image(&params, (1024, 1024), 10.0, 0.1);
    let mut calibration = Calibration::new();
    calibration.set_params(params).unwrap();

    let result = calibration
        .integrate_1d(image.view(), None, &IntegrationOptions::default())
        .unwrap();
    assert_eq!(result.len(), 1448);

    let (x, y) = result.trimmed();
    let window: Vec<(f64, f64)> = x
        .iter()
        .zip(&y)
        .filter(|(x, _)| (**x - 10.0).abs() < 1.0)
        .map(|(x, y)| (*x, *y))
        .collect();
    let total: f64 = window.iter().map(|p| p.1).sum();
    let com = window.iter().map(|p| p.0 * p.1).sum::<f64>() / total;
    let var = window.iter().map(|p| (p.0 - com).powi(2) * p.1).sum::<f64>() / total;
    let fwhm = 2.0 * (2.0 * 2f64.ln()).sqrt() * var.sqrt();

    assert!((com - 10.0).abs() < 0.02, "centre of mass {com}");
    assert!((fwhm - 0.235).abs() < 0.01, "fwhm {fwhm}");
}

#[test]
fn test_cake_ring_is_straight() {
    let params = s1_params().with_distance(0.05).with_poni(0.01, 0.01);
    let image = ring_image(&params, (200, 200), 8.0, 0.3);
    let mut calibration = Calibration::new();
    calibration.set_params(params).unwrap();
    let options = CakeOptions::default()
        .with_radial_points(Some(200))
        .with_azimuth_points(36);
    let cake = calibration.integrate_2d(image.view(), None, &options).unwrap();
    assert_eq!(cake.intensity.dim(), (36, 200));

    // every azimuthal slice that sees the ring peaks near 8°
    for row in cake.intensity.rows() {
        let (best, max) = row
            .iter()
            .enumerate()
            .fold((0, 0.0), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        if max > 0.5 {
            assert!((cake.tth[best] - 8.0).abs() < 0.2, "peak at {}", cake.tth[best]);
        }
    }
}

#[test]
fn test_transfer_correction_restores_original() {
    let params = s1_params().with_distance(0.1).with_poni(0.01, 0.012);
    let shape = (200, 240);
    let original = ring_image(&params, shape, 6.0, 0.5).mapv(|v| 10.0 + 100.0 * v);
    #[allow(clippy::cast_precision_loss)]
    let response =
        Array2::from_shape_fn(shape, |(r, c)| original[[r, c]] * (0.6 + 0.002 * (r + c) as f64));

    let transfer = transfer_function(original.view(), response.view()).unwrap();
    let mut image = Image::new();
    image.load_data(response, None);
    image.add_correction(TRANSFER, transfer).unwrap();
    let corrected = image.effective_image();

    let mut calibration = Calibration::new();
    calibration.set_params(params).unwrap();
    let options = IntegrationOptions::default().with_num_points(Some(300));
    let expected = calibration
        .integrate_1d(original.view(), None, &options)
        .unwrap();
    let actual = calibration
        .integrate_1d(corrected.view(), None, &options)
        .unwrap();

    assert_eq!(expected.len(), actual.len());
    for (a, e) in actual.y.iter().zip(&expected.y) {
        if e.is_nan() {
            assert!(a.is_nan());
        } else {
            assert_relative_eq!(*a, *e, max_relative = 1e-6);
        }
    }
}

#[test]
fn test_masked_ring_quadrant_keeps_profile() {
    let params = s1_params().with_distance(0.05).with_poni(0.01, 0.01);
    let image = ring_image(&params, (200, 200), 8.0, 0.3);
    let mut mask = Array2::from_elem((200, 200), false);
    for r in 0..100 {
        for c in 0..100 {
            mask[[r, c]] = true;
        }
    }
    let mut calibration = Calibration::new();
    calibration.set_params(params).unwrap();
    let options = IntegrationOptions::default().with_num_points(Some(150));
    let full = calibration.integrate_1d(image.view(), None, &options).unwrap();
    let masked = calibration
        .integrate_1d(image.view(), Some(mask.view()), &options)
        .unwrap();
    let peak = |x: &[f64], y: &[f64]| {
        let (i, _) = y
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .fold((0, f64::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        x[i]
    };
    assert!((peak(&full.x, &full.y) - 8.0).abs() < 0.1);
    assert!((peak(&masked.x, &masked.y) - 8.0).abs() < 0.1);
}
