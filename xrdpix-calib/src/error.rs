//! Calibration error types.

use thiserror::Error;
use xrdpix_core::ErrorKind;

/// Result type for calibration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Calibration error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed PONI or calibrant file.
    #[error("invalid calibration file: {0}")]
    InvalidFormat(String),

    /// Detector configuration JSON could not be parsed.
    #[error("invalid detector configuration: {0}")]
    DetectorConfig(#[from] serde_json::Error),

    /// Integration or refinement requested without a geometry.
    #[error("calibration not available")]
    NotCalibrated,

    /// Image or mask shape does not match the geometry.
    #[error("{what} dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Refinement stopped without meeting its tolerance; the best parameters
    /// seen so far were kept.
    #[error("refinement did not converge: {0}")]
    ConvergenceFail(String),

    /// Per-pixel array could not take the requested shape.
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Rejected argument.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] xrdpix_core::Error),
}

impl Error {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::IoFailure,
            Error::InvalidFormat(_) | Error::DetectorConfig(_) => ErrorKind::Format,
            Error::NotCalibrated => ErrorKind::NotCalibrated,
            Error::DimensionMismatch { .. } | Error::Shape(_) => ErrorKind::DimensionMismatch,
            Error::ConvergenceFail(_) => ErrorKind::ConvergenceFail,
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::CoreError(e) => e.kind(),
        }
    }
}
