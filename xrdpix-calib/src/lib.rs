//! xrdpix-calib: detector geometry and azimuthal integration.
//!
//! This crate provides:
//! - **Geometry** - PONI parameters, per-pixel 2θ/χ/solid-angle arrays
//! - **Integrator** - 1D patterns and 2D cakes from images and masks
//! - **Calibration** - calibrant rings, peak search, circle-fit start and
//!   least-squares refinement
//! - **Corrections** - detector absorption, polarization and transfer maps
//!

mod calibrant;
mod calibration;
pub mod corrections;
mod error;
pub mod geometry;
pub mod integrator;
pub mod peaks;
mod poni;
pub mod refinement;

pub use calibrant::Calibrant;
pub use calibration::Calibration;
pub use error::{Error, Result};
pub use geometry::{Geometry, GeometryArrays};
pub use integrator::{Cake, CakeOptions, Integrated1d, IntegrationOptions};
pub use peaks::PeakSearchOptions;
pub use poni::PoniParameters;
pub use refinement::{PickedPoint, RefinementOptions, RefinementReport};
