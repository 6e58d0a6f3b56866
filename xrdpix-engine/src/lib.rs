//! xrdpix-engine: orchestration of 2D diffraction reduction.
//!
//! This crate provides:
//! - **Configuration** - one image, mask, calibration and pattern with
//!   automatic integration, auto-save and unit switching
//! - **Session** - several configurations sharing overlays and phases,
//!   combined patterns and cakes, HDF5 session files (feature `hdf5`)
//! - **Engine** - the command and query surface used by front ends
//!

pub mod combine;
mod configuration;
mod engine;
mod error;
pub mod overlay;
pub mod phase;
pub mod phase_model;
mod session;
pub mod settings;

pub use combine::{combine_cakes, combine_patterns, COMBINED_PATTERN_NAME};
pub use configuration::{Configuration, BKG_SUBTRACTED_DIR};
pub use engine::Engine;
pub use error::{Error, Result};
pub use overlay::{Overlay, OverlayId, OverlayModel};
pub use phase::{EosParameters, Phase, Reflection, ReflectionPosition, Symmetry, UnitCell};
pub use phase_model::PhaseModel;
pub use session::Session;
pub use settings::{IntegrationSettings, WorkingDirectories};
