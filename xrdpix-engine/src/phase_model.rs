//! Session-wide list of phases.

use std::path::Path;

use log::info;
use xrdpix_core::{IntegrationUnit, Signal};

use crate::phase::{Phase, ReflectionPosition};
use crate::{Error, Result};

/// Ordered phases with indexed change signals.
///
/// `phase_changed(i)` fires whenever pressure, temperature or any other
/// property of phase `i` changes, so that reflection markers can be
/// recomputed.
#[derive(Debug, Default)]
pub struct PhaseModel {
    phases: Vec<Phase>,
    added: Signal<()>,
    removed: Signal<usize>,
    changed: Signal<usize>,
}

impl PhaseModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn phase_added(&self) -> &Signal<()> {
        &self.added
    }

    #[must_use]
    pub fn phase_removed(&self) -> &Signal<usize> {
        &self.removed
    }

    #[must_use]
    pub fn phase_changed(&self) -> &Signal<usize> {
        &self.changed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    fn check(&self, index: usize) -> Result<()> {
        if index < self.phases.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                what: "phase",
                index,
                len: self.phases.len(),
            })
        }
    }

    /// Append a phase; returns its index.
    pub fn add_phase(&mut self, phase: Phase) -> usize {
        info!("phase '{}' added", phase.name());
        self.phases.push(phase);
        self.added.emit(&());
        self.phases.len() - 1
    }

    /// Load a JCPDS file and append it.
    ///
    /// # Errors
    /// Returns the loader's error; the model is unchanged.
    pub fn load_phase<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let phase = Phase::load(path)?;
        Ok(self.add_phase(phase))
    }

    /// Remove the phase at `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index.
    pub fn remove_phase(&mut self, index: usize) -> Result<Phase> {
        self.check(index)?;
        let phase = self.phases.remove(index);
        info!("phase '{}' removed", phase.name());
        self.removed.emit(&index);
        Ok(phase)
    }

    /// Remove every phase, last first.
    pub fn clear(&mut self) {
        while self.phases.pop().is_some() {
            self.removed.emit(&self.phases.len());
        }
    }

    /// Apply `f` to phase `index` and emit `phase_changed`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` or the error of `f`; nothing is emitted on
    /// error.
    pub fn update(&mut self, index: usize, f: impl FnOnce(&mut Phase) -> Result<()>) -> Result<()> {
        self.check(index)?;
        f(&mut self.phases[index])?;
        self.changed.emit(&index);
        Ok(())
    }

    /// Set the pressure (GPa) of one phase.
    ///
    /// # Errors
    /// See [`PhaseModel::update`] and [`Phase::set_pressure`].
    pub fn set_pressure(&mut self, index: usize, pressure: f64) -> Result<()> {
        self.update(index, |p| p.set_pressure(pressure))
    }

    /// Set the temperature (K) of one phase.
    ///
    /// # Errors
    /// See [`PhaseModel::update`] and [`Phase::set_temperature`].
    pub fn set_temperature(&mut self, index: usize, temperature: f64) -> Result<()> {
        self.update(index, |p| p.set_temperature(temperature))
    }

    /// Set the pressure of every phase. Phases whose equation of state
    /// cannot reach `pressure` keep their value; the first such error is
    /// returned after all others were updated.
    ///
    /// # Errors
    /// Returns the first per-phase error.
    pub fn set_pressure_all(&mut self, pressure: f64) -> Result<()> {
        let mut first_error = None;
        for index in 0..self.phases.len() {
            if let Err(err) = self.set_pressure(index, pressure) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Set the temperature of every phase.
    ///
    /// # Errors
    /// Returns the first per-phase error.
    pub fn set_temperature_all(&mut self, temperature: f64) -> Result<()> {
        let mut first_error = None;
        for index in 0..self.phases.len() {
            if let Err(err) = self.set_temperature(index, temperature) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reflection positions of phase `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` or the phase's equation of state error.
    pub fn reflection_positions(
        &self,
        index: usize,
        wavelength_m: f64,
        unit: IntegrationUnit,
    ) -> Result<Vec<ReflectionPosition>> {
        self.check(index)?;
        self.phases[index].reflection_positions(wavelength_m, unit)
    }
}
