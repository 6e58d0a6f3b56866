//! Engine error types.

use thiserror::Error;
use xrdpix_core::{ErrorKind, ErrorReport};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input (phase file, settings, session).
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Settings JSON error.
    #[error("settings error: {0}")]
    Settings(#[from] serde_json::Error),

    /// Rejected argument.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Index outside a model list.
    #[error("{what} index {index} out of range (len {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// HDF5 library error.
    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] xrdpix_core::Error),

    /// Calibration error.
    #[error("calibration error: {0}")]
    CalibError(#[from] xrdpix_calib::Error),

    /// File format error.
    #[error("io error: {0}")]
    IoError(#[from] xrdpix_io::Error),
}

impl Error {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::IoFailure,
            Error::InvalidFormat(_) | Error::Settings(_) => ErrorKind::Format,
            Error::InvalidParameter(_) | Error::IndexOutOfRange { .. } => {
                ErrorKind::InvalidParameter
            }
            #[cfg(feature = "hdf5")]
            Error::Hdf5(_) => ErrorKind::Format,
            Error::CoreError(e) => e.kind(),
            Error::CalibError(e) => e.kind(),
            Error::IoError(e) => e.kind(),
        }
    }

    /// Payload for an `error_emitted` signal.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.kind(), self.to_string())
    }
}
