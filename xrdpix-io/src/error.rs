//! I/O error types.

use thiserror::Error;
use xrdpix_core::ErrorKind;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Raster image decoding error.
    #[error("image decoding error: {0}")]
    Image(#[from] image::ImageError),

    /// TIFF decoding error.
    #[error("TIFF decoding error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// HDF5 library error.
    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

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
            Error::InvalidFormat(_) | Error::Image(_) | Error::Tiff(_) => ErrorKind::Format,
            #[cfg(feature = "hdf5")]
            Error::Hdf5(_) => ErrorKind::Format,
            Error::CoreError(e) => e.kind(),
        }
    }
}
