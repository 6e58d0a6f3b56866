//! xrdpix-core: data models for 2D X-ray diffraction reduction.
//!
//! This crate provides the pattern, mask and image models together with the
//! numerics they need (interpolation, filters, background estimation, unit
//! conversion) and the change-notification channels that couple them.
//!

pub mod background;
pub mod error;
pub mod filters;
pub mod image;
pub mod interp;
pub mod mask;
pub mod pattern;
pub mod signal;
pub mod units;

pub use background::extract_background;
pub use error::{Error, ErrorKind, ErrorReport, Result};
pub use image::{
    Correction, CorrectionMode, FileIterationMode, Image, Transformation,
};
pub use mask::{CosmicParams, Mask, MaskMode, Roi, DEFAULT_UNDO_LIMIT};
pub use pattern::{AutoBackgroundParams, BackgroundData, Pattern};
pub use signal::{QueuedDispatch, Signal, Subscription};
pub use units::IntegrationUnit;
