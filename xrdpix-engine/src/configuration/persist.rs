//! HDF5 layout of a single configuration.
//!
//! ```text
//! <group>/
//!   general_information        attrs: integration settings
//!   working_directories        attrs: one path per key
//!   image_model/               raw_image_data, background_data?, corrections/<name>/data, roi?
//!   mask/data
//!   calibration_model/pyfai_parameters   attrs: PONI values
//!   pattern/                   x, y, attrs, auto_background_settings?
//!   background_pattern/        x, y (optional)
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use hdf5::Group;
use log::{debug, info};
use ndarray::Array2;
use xrdpix_calib::{Calibration, PoniParameters};
use xrdpix_core::{
    AutoBackgroundParams, BackgroundData, Correction, CorrectionMode, FileIterationMode, Image,
    IntegrationUnit, Mask, Pattern, Roi, Transformation,
};
use xrdpix_io::hdf5::{
    ensure_group, group_opt, member_names, read_array2, read_array2_opt, read_attr,
    read_attr_opt, read_attr_opt_bool, read_attr_opt_string, read_attr_string, read_mask,
    read_vec, set_attr, set_attr_bool, set_attr_str, write_array2, write_mask, write_vec,
};
use xrdpix_io::PatternFormat;

use super::{Configuration, Watchers};
use crate::settings::{IntegrationSettings, WorkingDirectories};
use crate::{Error, Result};

const GENERAL: &str = "general_information";
const WORKING_DIRECTORIES: &str = "working_directories";
const IMAGE: &str = "image_model";
const MASK: &str = "mask";
const CALIBRATION: &str = "calibration_model";
const PONI: &str = "pyfai_parameters";
const PATTERN: &str = "pattern";
const AUTO_BACKGROUND: &str = "auto_background_settings";
const BACKGROUND_PATTERN: &str = "background_pattern";

pub(crate) fn set_usize(group: &Group, name: &str, value: usize) -> Result<()> {
    set_attr(group, name, &(value as u64))?;
    Ok(())
}

pub(crate) fn read_usize_opt(group: &Group, name: &str) -> Result<Option<usize>> {
    read_attr_opt::<u64>(group, name)?
        .map(|v| {
            usize::try_from(v)
                .map_err(|_| Error::InvalidFormat(format!("attribute '{name}' = {v} out of range")))
        })
        .transpose()
}

pub(crate) fn read_usize(group: &Group, name: &str) -> Result<usize> {
    read_usize_opt(group, name)?
        .ok_or_else(|| Error::InvalidFormat(format!("{} has no '{name}'", group.name())))
}

/// Empty strings mean "unspecified".
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn parse_list<T: FromStr>(text: &str) -> std::result::Result<Vec<T>, T::Err> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(T::from_str)
        .collect()
}

fn join<T>(items: impl IntoIterator<Item = T>, f: impl Fn(T) -> String) -> String {
    items.into_iter().map(f).collect::<Vec<_>>().join(",")
}

fn write_settings(group: &Group, settings: &IntegrationSettings) -> Result<()> {
    set_attr_str(group, "integration_unit", settings.integration_unit.name())?;
    if let Some(n) = settings.integration_num_points {
        set_usize(group, "integration_num_points", n)?;
    }
    set_usize(group, "cake_azimuth_points", settings.cake_azimuth_points)?;
    if let Some((lo, hi)) = settings.cake_azimuth_range {
        set_attr(group, "cake_azimuth_min", &lo)?;
        set_attr(group, "cake_azimuth_max", &hi)?;
    }
    set_attr_bool(group, "auto_integrate_pattern", settings.auto_integrate_pattern)?;
    set_attr_bool(group, "auto_integrate_cake", settings.auto_integrate_cake)?;
    set_attr_bool(group, "use_mask", settings.use_mask)?;
    set_attr_bool(group, "transparent_mask", settings.transparent_mask)?;
    set_attr_bool(
        group,
        "auto_save_integrated_pattern",
        settings.auto_save_integrated_pattern,
    )?;
    set_attr_str(
        group,
        "integrated_patterns_file_formats",
        &join(&settings.integrated_patterns_file_formats, |f| {
            f.extension().to_string()
        }),
    )?;
    set_attr_bool(group, "correct_solid_angle", settings.correct_solid_angle)?;
    if let Some(f) = settings.polarization_factor {
        set_attr(group, "polarization_factor", &f)?;
    }
    Ok(())
}

fn read_settings(group: &Group) -> Result<IntegrationSettings> {
    let defaults = IntegrationSettings::default();
    let unit = match non_empty(read_attr_opt_string(group, "integration_unit")?) {
        Some(name) => IntegrationUnit::from_str(&name)?,
        None => defaults.integration_unit,
    };
    let azimuth_range = match (
        read_attr_opt::<f64>(group, "cake_azimuth_min")?,
        read_attr_opt::<f64>(group, "cake_azimuth_max")?,
    ) {
        (Some(lo), Some(hi)) => Some((lo, hi)),
        _ => None,
    };
    let formats = match read_attr_opt_string(group, "integrated_patterns_file_formats")? {
        Some(list) => parse_list::<PatternFormat>(&list)?.into_iter().collect(),
        None => defaults.integrated_patterns_file_formats.clone(),
    };
    let flag = |name: &str, default: bool| -> Result<bool> {
        Ok(read_attr_opt_bool(group, name)?.unwrap_or(default))
    };
    let settings = IntegrationSettings {
        integration_unit: unit,
        integration_num_points: read_usize_opt(group, "integration_num_points")?,
        cake_azimuth_points: read_usize_opt(group, "cake_azimuth_points")?
            .unwrap_or(defaults.cake_azimuth_points),
        cake_azimuth_range: azimuth_range,
        auto_integrate_pattern: flag("auto_integrate_pattern", defaults.auto_integrate_pattern)?,
        auto_integrate_cake: flag("auto_integrate_cake", defaults.auto_integrate_cake)?,
        use_mask: flag("use_mask", defaults.use_mask)?,
        transparent_mask: flag("transparent_mask", defaults.transparent_mask)?,
        auto_save_integrated_pattern: flag(
            "auto_save_integrated_pattern",
            defaults.auto_save_integrated_pattern,
        )?,
        integrated_patterns_file_formats: formats,
        correct_solid_angle: flag("correct_solid_angle", defaults.correct_solid_angle)?,
        polarization_factor: read_attr_opt::<f64>(group, "polarization_factor")?,
    };
    settings.validate()?;
    Ok(settings)
}

fn write_working_directories(group: &Group, dirs: &WorkingDirectories) -> Result<()> {
    for key in WorkingDirectories::KEYS {
        if let Some(path) = dirs.get(key) {
            set_attr_str(group, key, &path.to_string_lossy())?;
        }
    }
    Ok(())
}

fn read_working_directories(group: &Group) -> Result<WorkingDirectories> {
    let mut dirs = WorkingDirectories::default();
    for key in WorkingDirectories::KEYS {
        if let Some(path) = read_attr_opt_string(group, key)? {
            dirs.set(key, path)?;
        }
    }
    Ok(dirs)
}

fn write_image(group: &Group, image: &Image, mask: &Mask) -> Result<()> {
    write_array2(group, "raw_image_data", image.raw_data())?;
    let filename = image
        .filename()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    set_attr_str(group, "filename", &filename)?;
    set_attr_str(group, "file_info", image.file_info())?;
    set_attr_str(
        group,
        "transformations",
        &join(image.transformations(), |t| t.name().to_string()),
    )?;
    set_usize(group, "supersampling", image.supersampling())?;
    set_attr(group, "factor", &image.factor())?;
    set_attr_str(group, "iteration_mode", image.iteration_mode().name())?;
    set_attr_str(
        group,
        "known_extensions",
        &join(image.known_extensions(), String::clone),
    )?;
    set_attr(group, "background_scaling", &image.background_scaling())?;
    set_attr(group, "background_offset", &image.background_offset())?;
    if let Some(background) = image.raw_background_data() {
        write_array2(group, "background_data", background)?;
        let name = image
            .background_filename()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        set_attr_str(group, "background_filename", &name)?;
    }
    let corrections = ensure_group(group, "corrections")?;
    for (name, correction) in image.corrections() {
        let entry = ensure_group(&corrections, name)?;
        write_array2(&entry, "data", correction.data.view())?;
        set_attr_str(&entry, "mode", correction.mode.name())?;
    }
    if let Some(roi) = mask.roi() {
        let entry = ensure_group(group, "roi")?;
        set_attr(&entry, "x", &roi.x)?;
        set_attr(&entry, "y", &roi.y)?;
        set_attr(&entry, "width", &roi.width)?;
        set_attr(&entry, "height", &roi.height)?;
    }
    Ok(())
}

fn read_image(group: &Group) -> Result<(Image, Option<Roi>)> {
    let mut image = Image::new();
    if let Some(mode) = non_empty(read_attr_opt_string(group, "iteration_mode")?) {
        image.set_iteration_mode(FileIterationMode::from_str(&mode)?);
    }
    let raw = read_array2(group, "raw_image_data")?;
    let filename = non_empty(read_attr_opt_string(group, "filename")?).map(PathBuf::from);
    if !raw.is_empty() {
        image.load_data(raw, filename);
    }
    if let Some(known) = read_attr_opt_string(group, "known_extensions")? {
        for extension in parse_list::<String>(&known).unwrap_or_default() {
            image.add_known_extension(&extension);
        }
    }
    image.set_file_info(read_attr_opt_string(group, "file_info")?.unwrap_or_default());
    if let Some(list) = read_attr_opt_string(group, "transformations")? {
        image.set_transformations(parse_list::<Transformation>(&list)?);
    }
    image.set_supersampling(read_usize_opt(group, "supersampling")?.unwrap_or(1));
    image.set_factor(read_attr_opt(group, "factor")?.unwrap_or(1.0));
    if let Some(background) = read_array2_opt(group, "background_data")? {
        let name = non_empty(read_attr_opt_string(group, "background_filename")?);
        image.set_background_data(background, name.map(PathBuf::from))?;
    }
    image.set_background_scaling(read_attr_opt(group, "background_scaling")?.unwrap_or(1.0));
    image.set_background_offset(read_attr_opt(group, "background_offset")?.unwrap_or(0.0));
    if let Some(corrections) = group_opt(group, "corrections")? {
        for name in member_names(&corrections)? {
            let entry = corrections.group(&name)?;
            let mode = CorrectionMode::from_str(&read_attr_string(&entry, "mode")?)?;
            image.add_correction(name, Correction::new(read_array2(&entry, "data")?, mode))?;
        }
    }
    let roi = match group_opt(group, "roi")? {
        Some(entry) => Some(Roi::new(
            read_attr(&entry, "x")?,
            read_attr(&entry, "y")?,
            read_attr(&entry, "width")?,
            read_attr(&entry, "height")?,
        )),
        None => None,
    };
    Ok((image, roi))
}

fn read_mask_model(group: Option<Group>, supersampling: usize, roi: Option<Roi>) -> Result<Mask> {
    let mut mask = Mask::default();
    mask.set_supersampling(supersampling);
    if let Some(group) = group {
        let data: Array2<bool> = read_mask(&group, "data")?;
        let (h, w) = data.dim();
        mask.reset(h, w);
        mask.set_data(data)?;
    }
    mask.set_roi(roi);
    Ok(mask)
}

fn write_poni(group: &Group, params: &PoniParameters) -> Result<()> {
    set_attr_str(group, "detector", &params.detector)?;
    for (name, value) in [
        ("dist", params.distance),
        ("poni1", params.poni1),
        ("poni2", params.poni2),
        ("rot1", params.rot1),
        ("rot2", params.rot2),
        ("rot3", params.rot3),
        ("pixel1", params.pixel1),
        ("pixel2", params.pixel2),
        ("wavelength", params.wavelength),
    ] {
        set_attr(group, name, &value)?;
    }
    Ok(())
}

fn read_poni(group: &Group) -> Result<PoniParameters> {
    Ok(PoniParameters {
        detector: read_attr_opt_string(group, "detector")?.unwrap_or_default(),
        distance: read_attr(group, "dist")?,
        poni1: read_attr(group, "poni1")?,
        poni2: read_attr(group, "poni2")?,
        rot1: read_attr(group, "rot1")?,
        rot2: read_attr(group, "rot2")?,
        rot3: read_attr(group, "rot3")?,
        pixel1: read_attr(group, "pixel1")?,
        pixel2: read_attr(group, "pixel2")?,
        wavelength: read_attr(group, "wavelength")?,
    })
}

pub(crate) fn write_pattern(group: &Group, pattern: &Pattern) -> Result<()> {
    let (x, y) = pattern.original_data();
    write_vec(group, "x", x)?;
    write_vec(group, "y", y)?;
    set_attr_str(group, "name", pattern.name())?;
    set_attr(group, "scaling", &pattern.scaling())?;
    set_attr(group, "offset", &pattern.offset())?;
    set_attr(group, "smoothing", &pattern.smoothing())?;
    if let Some(params) = pattern.auto_background_params() {
        let auto = ensure_group(group, AUTO_BACKGROUND)?;
        set_attr(&auto, "smooth_width", &params.smooth_width)?;
        set_usize(&auto, "iterations", params.iterations)?;
        set_usize(&auto, "poly_order", params.poly_order)?;
        if let Some((lo, hi)) = pattern.auto_background_roi() {
            set_attr(&auto, "x_min", &lo)?;
            set_attr(&auto, "x_max", &hi)?;
        }
    }
    Ok(())
}

pub(crate) fn read_pattern(group: &Group, background: Option<BackgroundData>) -> Result<Pattern> {
    let name = read_attr_opt_string(group, "name")?.unwrap_or_default();
    let mut pattern = Pattern::new(read_vec(group, "x")?, read_vec(group, "y")?, name)?;
    pattern.set_scaling(read_attr_opt(group, "scaling")?.unwrap_or(1.0))?;
    pattern.set_offset(read_attr_opt(group, "offset")?.unwrap_or(0.0))?;
    pattern.set_smoothing(read_attr_opt(group, "smoothing")?.unwrap_or(0.0))?;
    if let Some(background) = background {
        pattern.set_background(background)?;
    }
    if let Some(auto) = group_opt(group, AUTO_BACKGROUND)? {
        let params = AutoBackgroundParams::new()
            .with_smooth_width(read_attr(&auto, "smooth_width")?)
            .with_iterations(read_usize(&auto, "iterations")?)
            .with_poly_order(read_usize(&auto, "poly_order")?);
        let roi = match (
            read_attr_opt::<f64>(&auto, "x_min")?,
            read_attr_opt::<f64>(&auto, "x_max")?,
        ) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        };
        pattern.set_auto_background_subtraction(params, roi)?;
    }
    Ok(pattern)
}

fn read_background_pattern(group: &Group) -> Result<BackgroundData> {
    Ok(BackgroundData {
        name: read_attr_opt_string(group, "name")?.unwrap_or_default(),
        x: read_vec(group, "x")?,
        y: read_vec(group, "y")?,
    })
}

impl Configuration {
    /// Write this configuration below `group`.
    ///
    /// # Errors
    /// Returns an HDF5 error if any object cannot be written.
    pub fn save_in_hdf5(&self, group: &Group) -> Result<()> {
        write_settings(&ensure_group(group, GENERAL)?, &self.settings)?;
        write_working_directories(
            &ensure_group(group, WORKING_DIRECTORIES)?,
            &self.working_directories,
        )?;
        write_image(&ensure_group(group, IMAGE)?, &self.image, &self.mask)?;
        write_mask(&ensure_group(group, MASK)?, "data", self.mask.data())?;

        let calibration = ensure_group(group, CALIBRATION)?;
        if let Some(params) = self.calibration.params() {
            write_poni(&ensure_group(&calibration, PONI)?, params)?;
        }

        write_pattern(&ensure_group(group, PATTERN)?, &self.pattern)?;
        if let Some(background) = self.pattern.background() {
            let entry = ensure_group(group, BACKGROUND_PATTERN)?;
            write_vec(&entry, "x", &background.x)?;
            write_vec(&entry, "y", &background.y)?;
            set_attr_str(&entry, "name", &background.name)?;
        }
        debug!("configuration written to {}", group.name());
        Ok(())
    }

    /// Replace this configuration with the one stored below `group`.
    ///
    /// Everything is read before anything is replaced, so a malformed group
    /// leaves the configuration untouched. Afterwards `img_changed` and
    /// `pattern_changed` fire exactly once each (followed by `cake_changed`
    /// when the cake is integrated automatically). The stored pattern is
    /// kept as is, not re-integrated. Models are replaced, so subscriptions
    /// to their own `changed` signals do not carry over.
    ///
    /// # Errors
    /// Returns an HDF5 or format error.
    pub fn load_from_hdf5(&mut self, group: &Group) -> Result<()> {
        let settings = match group_opt(group, GENERAL)? {
            Some(general) => read_settings(&general)?,
            None => IntegrationSettings::default(),
        };
        let working_directories = match group_opt(group, WORKING_DIRECTORIES)? {
            Some(dirs) => read_working_directories(&dirs)?,
            None => WorkingDirectories::default(),
        };
        let (image, roi) = match group_opt(group, IMAGE)? {
            Some(entry) => read_image(&entry)?,
            None => (Image::new(), None),
        };
        let mask = read_mask_model(group_opt(group, MASK)?, image.supersampling(), roi)?;

        let mut calibration = Calibration::new();
        if let Some(entry) = group_opt(group, CALIBRATION)? {
            if let Some(poni) = group_opt(&entry, PONI)? {
                calibration.set_params(read_poni(&poni)?)?;
            }
        }
        calibration.set_supersampling(image.supersampling());

        let background = group_opt(group, BACKGROUND_PATTERN)?
            .map(|entry| read_background_pattern(&entry))
            .transpose()?;
        let pattern = match group_opt(group, PATTERN)? {
            Some(entry) => read_pattern(&entry, background)?,
            None => Pattern::empty(),
        };

        self.watchers = Watchers::new(&image, &mask, &calibration, &pattern);
        self.image = image;
        self.mask = mask;
        self.calibration = calibration;
        self.pattern = pattern;
        self.settings = settings;
        self.working_directories = working_directories;
        self.background_overlay = None;
        self.cake = xrdpix_calib::Cake::default();
        self.discard_changes();
        info!("configuration loaded from {}", group.name());

        self.img_changed.emit(&());
        if self.settings.auto_integrate_cake && self.calibration.is_calibrated() {
            let result = self.run_cake_integration().map(drop);
            self.trap(result);
        }
        self.watchers.pattern.take();
        self.pattern_changed.emit(&());
        if std::mem::take(&mut self.cake_dirty) {
            self.cake_changed.emit(&());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::NamedTempFile;
    use xrdpix_io::hdf5::{create_file, open_file};

    #[test]
    fn test_settings_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let settings = IntegrationSettings::new()
            .with_integration_unit(IntegrationUnit::Q)
            .with_integration_num_points(Some(1200))
            .with_cake_azimuth_range(Some((-45.0, 45.0)))
            .with_use_mask(true)
            .with_polarization_factor(Some(0.99))
            .with_integrated_patterns_file_formats([PatternFormat::Chi, PatternFormat::Xy]);
        {
            let file = create_file(tmp.path()).unwrap();
            write_settings(&file, &settings).unwrap();
        }
        let file = open_file(tmp.path()).unwrap();
        assert_eq!(read_settings(&file).unwrap(), settings);
    }

    #[test]
    fn test_configuration_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut config = Configuration::new();
        config.update_image(|img| {
            img.load_data(
                Array2::from_shape_fn((8, 6), |(r, c)| (r * 6 + c) as f64),
                Some("frame_007.tif".into()),
            );
            img.rotate_cw90();
        });
        config.update_mask(|m| {
            m.mask_rect(1.0, 1.0, 2.0, 2.0);
            m.set_roi(Some(Roi::new(0.0, 0.0, 4.0, 4.0)));
        });
        config
            .update_pattern(|p| {
                p.set_data(vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0])?;
                p.set_scaling(2.0)
            })
            .unwrap();
        config.working_directories_mut().pattern = Some("/data/out".into());
        {
            let file = create_file(tmp.path()).unwrap();
            config.save_in_hdf5(&file).unwrap();
        }

        let mut loaded = Configuration::new();
        let file = open_file(tmp.path()).unwrap();
        loaded.load_from_hdf5(&file).unwrap();
        assert_eq!(loaded.image().raw_data(), config.image().raw_data());
        assert_eq!(loaded.image().data(), config.image().data());
        assert_eq!(loaded.image().filename(), config.image().filename());
        assert_eq!(loaded.mask().data(), config.mask().data());
        assert_eq!(loaded.mask().roi(), config.mask().roi());
        assert_eq!(loaded.pattern().original_data(), config.pattern().original_data());
        assert_relative_eq!(loaded.pattern().scaling(), 2.0);
        assert_eq!(loaded.working_directories(), config.working_directories());
        assert!(!loaded.calibration().is_calibrated());
    }
}
