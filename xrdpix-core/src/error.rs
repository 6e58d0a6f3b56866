//! Error types for xrdpix-core.

use std::fmt;

use thiserror::Error;

/// Result type alias for xrdpix operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for xrdpix operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed file contents or serialized state.
    #[error("format error: {0}")]
    Format(String),

    /// Two arrays that must share a shape do not.
    #[error("{what} dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Background image shape differs from the image shape.
    #[error("background image dimensions {actual:?} differ from image dimensions {expected:?}")]
    BackgroundDimensionWrong {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Background pattern shares no x-range with the pattern it is subtracted from.
    #[error("background pattern '{0}' does not overlap the pattern x-range")]
    NoBackgroundOverlap(String),

    /// Integration or unit conversion requested before a geometry is known.
    #[error("calibration not available")]
    NotCalibrated,

    /// Least-squares refinement did not converge.
    #[error("refinement did not converge: {0}")]
    ConvergenceFail(String),

    /// Parameter rejected by a setter.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Format(_) => ErrorKind::Format,
            Error::DimensionMismatch { .. } | Error::BackgroundDimensionWrong { .. } => {
                ErrorKind::DimensionMismatch
            }
            Error::NoBackgroundOverlap(_) => ErrorKind::NoBackgroundOverlap,
            Error::NotCalibrated => ErrorKind::NotCalibrated,
            Error::ConvergenceFail(_) => ErrorKind::ConvergenceFail,
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::Io(_) => ErrorKind::IoFailure,
        }
    }
}

/// Error taxonomy shared by every xrdpix crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed PONI/XY/mask/h5 input.
    Format,
    /// Background or mask shape does not match the image.
    DimensionMismatch,
    /// Pattern arithmetic on disjoint x-ranges.
    NoBackgroundOverlap,
    /// Integration before calibration.
    NotCalibrated,
    /// Calibration refinement failed.
    ConvergenceFail,
    /// Read/write failure.
    IoFailure,
    /// Rejected argument.
    InvalidParameter,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Format => "FormatError",
            ErrorKind::DimensionMismatch => "DimensionMismatch",
            ErrorKind::NoBackgroundOverlap => "NoBackgroundOverlap",
            ErrorKind::NotCalibrated => "NotCalibrated",
            ErrorKind::ConvergenceFail => "ConvergenceFail",
            ErrorKind::IoFailure => "IOFailure",
            ErrorKind::InvalidParameter => "InvalidParameter",
        };
        f.write_str(name)
    }
}

/// Payload of the `error_emitted` signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
}

impl ErrorReport {
    /// Creates a report from a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = Error::BackgroundDimensionWrong {
            expected: (2, 2),
            actual: (3, 3),
        };
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
        assert_eq!(
            Error::NoBackgroundOverlap("bg".into()).kind(),
            ErrorKind::NoBackgroundOverlap
        );
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        assert_eq!(io.kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn test_report_from_error() {
        let report = ErrorReport::from(&Error::NotCalibrated);
        assert_eq!(report.kind, ErrorKind::NotCalibrated);
        assert!(report.message.contains("calibration"));
        assert_eq!(report.kind.to_string(), "NotCalibrated");
    }
}
