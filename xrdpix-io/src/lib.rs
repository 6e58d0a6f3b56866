//! xrdpix-io: file formats for xrdpix.
//!
//! This crate provides detector image readers (TIFF with raw counts, other
//! rasters through `image`), integrated pattern exporters, discovery of
//! neighbouring files in an image sequence and, behind the `hdf5` feature,
//! the helper layer used for session files.
//!

mod error;
pub mod export;
#[cfg(feature = "hdf5")]
pub mod hdf5;
mod reader;
pub mod sequence;

pub use error::{Error, Result};
pub use export::{pattern_text, write_pattern, ExportHeader, PatternFormat};
pub use reader::{read_image, read_image_file, ImageFile};
pub use sequence::{next_file, next_folder, previous_file, previous_folder};
