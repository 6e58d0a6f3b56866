//! Session files.
//!
//! ```text
//! /            attrs: combine_patterns, combine_cakes, combined_cake_points
//! /configurations/<i>     one configuration group each, attr selected_configuration
//! /overlays/<i>           x, y, name, scaling, offset
//! /phases/<i>/params      attrs: name, symmetry, cell, equation of state, P, T
//! /phases/<i>/comments    attrs: one per comment line
//! /phases/<i>/reflections d0, intensity, h, k, l
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use hdf5::Group;
use log::info;
use xrdpix_io::hdf5::{
    attr_names, create_file, ensure_group, group_opt, indexed_groups, open_file, read_attr,
    read_attr_opt_bool, read_attr_opt_string, read_attr_string, read_vec, set_attr,
    set_attr_bool, set_attr_str, write_vec,
};

use super::Session;
use crate::configuration::persist::{read_pattern, read_usize_opt, set_usize, write_pattern};
use crate::configuration::Configuration;
use crate::phase::{EosParameters, Phase, Reflection, Symmetry, UnitCell};
use crate::{Error, Result};

const CONFIGURATIONS: &str = "configurations";
const OVERLAYS: &str = "overlays";
const PHASES: &str = "phases";
const GENERAL: &str = "general_information";
const SELECTED: &str = "selected_configuration";
const BACKGROUND_OVERLAY: &str = "background_overlay";

fn write_phase(group: &Group, phase: &Phase) -> Result<()> {
    let params = ensure_group(group, "params")?;
    set_attr_str(&params, "name", phase.name())?;
    let filename = phase
        .filename()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    set_attr_str(&params, "filename", &filename)?;
    set_attr_str(&params, "symmetry", phase.symmetry().name())?;
    let cell = phase.cell();
    let eos = phase.eos();
    for (name, value) in [
        ("a", cell.a),
        ("b", cell.b),
        ("c", cell.c),
        ("alpha", cell.alpha),
        ("beta", cell.beta),
        ("gamma", cell.gamma),
        ("k0", eos.k0),
        ("k0p", eos.k0p),
        ("dk0dt", eos.dk0dt),
        ("dk0pdt", eos.dk0pdt),
        ("alpha_t0", eos.alpha_t0),
        ("d_alpha_dt", eos.d_alpha_dt),
        ("pressure", phase.pressure()),
        ("temperature", phase.temperature()),
    ] {
        set_attr(&params, name, &value)?;
    }

    let comments = ensure_group(group, "comments")?;
    for (index, comment) in phase.comments().iter().enumerate() {
        set_attr_str(&comments, &index.to_string(), comment)?;
    }

    let reflections = ensure_group(group, "reflections")?;
    let column = |f: fn(&Reflection) -> f64| phase.reflections().iter().map(f).collect::<Vec<_>>();
    write_vec(&reflections, "d0", &column(|r| r.d0))?;
    write_vec(&reflections, "intensity", &column(|r| r.intensity))?;
    write_vec(&reflections, "h", &column(|r| f64::from(r.h)))?;
    write_vec(&reflections, "k", &column(|r| f64::from(r.k)))?;
    write_vec(&reflections, "l", &column(|r| f64::from(r.l)))?;
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn read_reflections(group: &Group) -> Result<Vec<Reflection>> {
    let d0 = read_vec(group, "d0")?;
    let intensity = read_vec(group, "intensity")?;
    let (h, k, l) = (read_vec(group, "h")?, read_vec(group, "k")?, read_vec(group, "l")?);
    let n = d0.len();
    if [intensity.len(), h.len(), k.len(), l.len()].iter().any(|&len| len != n) {
        return Err(Error::InvalidFormat(format!(
            "{} has columns of unequal length",
            group.name()
        )));
    }
    Ok((0..n)
        .map(|i| {
            Reflection::new(
                d0[i],
                intensity[i],
                (h[i].round() as i32, k[i].round() as i32, l[i].round() as i32),
            )
        })
        .collect())
}

fn read_phase(group: &Group) -> Result<Phase> {
    let params = group_opt(group, "params")?
        .ok_or_else(|| Error::InvalidFormat(format!("{} has no params", group.name())))?;
    let value = |name: &str| -> Result<f64> { Ok(read_attr(&params, name)?) };
    let cell = UnitCell {
        a: value("a")?,
        b: value("b")?,
        c: value("c")?,
        alpha: value("alpha")?,
        beta: value("beta")?,
        gamma: value("gamma")?,
    };
    let eos = EosParameters {
        k0: value("k0")?,
        k0p: value("k0p")?,
        dk0dt: value("dk0dt")?,
        dk0pdt: value("dk0pdt")?,
        alpha_t0: value("alpha_t0")?,
        d_alpha_dt: value("d_alpha_dt")?,
    };
    let reflections = match group_opt(group, "reflections")? {
        Some(entry) => read_reflections(&entry)?,
        None => Vec::new(),
    };
    let symmetry = Symmetry::from_str(&read_attr_string(&params, "symmetry")?)?;
    let mut phase = Phase::new(
        read_attr_string(&params, "name")?,
        symmetry,
        cell,
        eos,
        reflections,
    )?;
    phase.set_filename(
        read_attr_opt_string(&params, "filename")?
            .filter(|s| !s.is_empty())
            .map(PathBuf::from),
    );
    if let Some(comments) = group_opt(group, "comments")? {
        let mut indexed: Vec<(usize, String)> = Vec::new();
        for name in attr_names(&comments)? {
            if let Ok(index) = name.parse::<usize>() {
                indexed.push((index, read_attr_string(&comments, &name)?));
            }
        }
        indexed.sort_unstable();
        phase.set_comments(indexed.into_iter().map(|(_, c)| c).collect());
    }
    phase.set_temperature(value("temperature")?)?;
    phase.set_pressure(value("pressure")?)?;
    Ok(phase)
}

impl Session {
    /// Write the whole session to an HDF5 file.
    ///
    /// # Errors
    /// Returns an HDF5 or I/O error.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = create_file(path)?;
        set_attr_bool(&file, "combine_patterns", self.combine_patterns)?;
        set_attr_bool(&file, "combine_cakes", self.combine_cakes)?;
        set_usize(&file, "combined_cake_points", self.combined_cake_points)?;

        let configurations = ensure_group(&file, CONFIGURATIONS)?;
        set_usize(&configurations, SELECTED, self.selected)?;
        for (index, config) in self.configurations.iter().enumerate() {
            let group = ensure_group(&configurations, &index.to_string())?;
            config.save_in_hdf5(&group)?;
            if let Some(overlay) = config
                .background_overlay()
                .and_then(|id| self.overlays.index_of(id))
            {
                set_usize(&ensure_group(&group, GENERAL)?, BACKGROUND_OVERLAY, overlay)?;
            }
        }

        let overlays = ensure_group(&file, OVERLAYS)?;
        for (index, overlay) in self.overlays.iter().enumerate() {
            write_pattern(&ensure_group(&overlays, &index.to_string())?, overlay.pattern())?;
        }

        let phases = ensure_group(&file, PHASES)?;
        for (index, phase) in self.phases.phases().iter().enumerate() {
            write_phase(&ensure_group(&phases, &index.to_string())?, phase)?;
        }
        info!(
            "session saved to {} ({} configurations)",
            path.display(),
            self.configurations.len()
        );
        Ok(())
    }

    /// Replace the session with the content of an HDF5 file.
    ///
    /// Overlays and phases are read before anything changes; a file that
    /// fails there leaves the session untouched. Afterwards the stored
    /// configuration is selected, which re-publishes its state.
    ///
    /// # Errors
    /// Returns an HDF5, I/O or format error.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = open_file(path)?;

        let overlays = match group_opt(&file, OVERLAYS)? {
            Some(group) => indexed_groups(&group)?
                .iter()
                .map(|g| read_pattern(g, None))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let phases = match group_opt(&file, PHASES)? {
            Some(group) => indexed_groups(&group)?
                .iter()
                .map(read_phase)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let group = group_opt(&file, CONFIGURATIONS)?
            .ok_or_else(|| Error::InvalidFormat(format!("{} has no configurations", path.display())))?;
        let selected = read_usize_opt(&group, SELECTED)?.unwrap_or(0);
        let mut configurations = Vec::new();
        let mut links = Vec::new();
        for entry in indexed_groups(&group)? {
            let mut config = Configuration::new();
            config.load_from_hdf5(&entry)?;
            let link = match group_opt(&entry, GENERAL)? {
                Some(general) => read_usize_opt(&general, BACKGROUND_OVERLAY)?,
                None => None,
            };
            configurations.push(config);
            links.push(link);
        }
        if configurations.is_empty() {
            return Err(Error::InvalidFormat(format!(
                "{} has no configurations",
                path.display()
            )));
        }

        self.clear_overlays();
        let ids: Vec<_> = overlays.into_iter().map(|p| self.overlays.push(p)).collect();
        for (config, link) in configurations.iter_mut().zip(links) {
            config.link_background_overlay(link.and_then(|i| ids.get(i).copied()));
        }
        self.phases.clear();
        for phase in phases {
            self.phases.add_phase(phase);
        }

        self.forwarding.clear();
        for index in (0..self.configurations.len()).rev() {
            self.configuration_removed.emit(&index);
        }
        let count = configurations.len();
        self.configurations = configurations;
        for _ in 0..count {
            self.configuration_added.emit(&());
        }
        self.combine_patterns = read_attr_opt_bool(&file, "combine_patterns")?.unwrap_or(false);
        self.combine_cakes = read_attr_opt_bool(&file, "combine_cakes")?.unwrap_or(false);
        if let Some(points) = read_usize_opt(&file, "combined_cake_points")?.filter(|&p| p > 0) {
            self.combined_cake_points = points;
        }
        info!("session loaded from {} ({count} configurations)", path.display());
        self.select_configuration(selected.min(count - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use tempfile::tempdir;
    use xrdpix_core::Pattern;

    #[test]
    fn test_session_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.h5");

        let mut session = Session::new();
        session
            .current_mut()
            .update_image(|img| img.load_data(Array2::from_elem((5, 7), 3.0), None));
        session
            .current_mut()
            .update_pattern(|p| p.set_data(vec![1.0, 2.0, 3.0], vec![9.0, 9.0, 9.0]))
            .unwrap();
        session.add_overlay(Pattern::new(vec![0.0, 5.0], vec![1.0, 1.0], "other").unwrap());
        session.add_overlay(Pattern::new(vec![0.0, 5.0], vec![2.0, 2.0], "bg").unwrap());
        session.set_overlay_as_background(1).unwrap();
        let mut phase = Phase::new(
            "au",
            Symmetry::Cubic,
            UnitCell::cubic(4.0786),
            EosParameters {
                k0: 167.0,
                k0p: 5.5,
                ..EosParameters::default()
            },
            vec![Reflection::new(2.3548, 100.0, (1, 1, 1))],
        )
        .unwrap();
        phase.set_comments(vec!["gold standard".into(), "ambient".into()]);
        phase.set_pressure(12.0).unwrap();
        session.phases_mut().add_phase(phase);
        session.add_configuration().unwrap();
        session.set_combine_patterns(true);
        session.select_configuration(0).unwrap();
        session.save(&path).unwrap();

        let mut loaded = Session::new();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.configurations().len(), 2);
        assert_eq!(loaded.selected_index(), 0);
        assert!(loaded.combine_patterns());
        assert_eq!(loaded.overlays().len(), 2);
        assert_eq!(loaded.background_overlay_index(), Some(1));
        assert_eq!(loaded.current().pattern().y(), &[7.0, 7.0, 7.0]);
        assert_eq!(loaded.current().image().shape(), (5, 7));
        let phase = loaded.phases().get(0).unwrap();
        assert_eq!(phase.name(), "au");
        assert_relative_eq!(phase.pressure(), 12.0);
        assert_eq!(phase.comments(), &["gold standard", "ambient"]);
        assert_eq!(phase.reflections()[0].h, 1);
    }

    #[test]
    fn test_missing_configurations_leave_session_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.h5");
        drop(create_file(&path).unwrap());
        let mut session = Session::new();
        session.add_overlay(Pattern::new(vec![0.0, 1.0], vec![1.0, 1.0], "keep").unwrap());
        assert!(session.load(&path).is_err());
        assert_eq!(session.overlays().len(), 1);
    }
}
