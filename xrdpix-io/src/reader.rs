//! Detector image readers.
//!
//! TIFF files are decoded with the `tiff` crate so that 16/32-bit integer
//! and floating point detector frames keep their raw counts. Other raster
//! formats go through the `image` crate as 32-bit luminance.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{debug, info};
use ndarray::Array2;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::{Error, Result};

/// A decoded detector frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFile {
    /// Pixel values, `[row, column]`.
    pub data: Array2<f64>,
    /// Free-text metadata found in the file (TIFF image description).
    pub info: String,
}

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
}

/// Read a detector image as `f64` counts.
///
/// # Errors
/// Returns an error if the file cannot be opened or decoded.
pub fn read_image<P: AsRef<Path>>(path: P) -> Result<Array2<f64>> {
    Ok(read_image_file(path)?.data)
}

/// Read a detector image together with its embedded metadata.
///
/// # Errors
/// Returns an error if the file cannot be opened or decoded.
pub fn read_image_file<P: AsRef<Path>>(path: P) -> Result<ImageFile> {
    let path = path.as_ref();
    let image = if is_tiff(path) {
        read_tiff(path)?
    } else {
        read_raster(path)?
    };
    info!(
        "loaded image {} ({}x{})",
        path.display(),
        image.data.nrows(),
        image.data.ncols()
    );
    Ok(image)
}

#[allow(clippy::cast_precision_loss)]
fn samples_to_f64(result: DecodingResult) -> Result<Vec<f64>> {
    Ok(match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|s| s as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|s| s as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        #[allow(unreachable_patterns)]
        _ => {
            return Err(Error::InvalidFormat(
                "unsupported TIFF sample format".to_string(),
            ))
        }
    })
}

/// Collapse interleaved channels to their mean.
#[allow(clippy::cast_precision_loss)]
fn to_frame(samples: Vec<f64>, width: usize, height: usize) -> Result<Array2<f64>> {
    let pixels = width * height;
    if pixels == 0 || samples.len() % pixels != 0 {
        return Err(Error::InvalidFormat(format!(
            "{} samples do not fill a {width}x{height} frame",
            samples.len()
        )));
    }
    let channels = samples.len() / pixels;
    let values = if channels == 1 {
        samples
    } else {
        debug!("averaging {channels} channels");
        samples
            .chunks_exact(channels)
            .map(|c| c.iter().sum::<f64>() / channels as f64)
            .collect()
    };
    Array2::from_shape_vec((height, width), values)
        .map_err(|e| Error::InvalidFormat(format!("frame shape: {e}")))
}

fn read_tiff(path: &Path) -> Result<ImageFile> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    let (width, height) = decoder.dimensions()?;
    let info = decoder
        .get_tag_ascii_string(Tag::ImageDescription)
        .unwrap_or_default();
    let samples = samples_to_f64(decoder.read_image()?)?;
    let data = to_frame(samples, width as usize, height as usize)?;
    Ok(ImageFile { data, info })
}

fn read_raster(path: &Path) -> Result<ImageFile> {
    let luma = image::open(path)?.to_luma32f();
    let (width, height) = luma.dimensions();
    let samples = luma.into_raw().into_iter().map(f64::from).collect();
    let data = to_frame(samples, width as usize, height as usize)?;
    Ok(ImageFile {
        data,
        info: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tiff::encoder::{colortype, TiffEncoder};

    #[test]
    fn test_tiff_u16_keeps_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.tif");
        let (w, h) = (5u32, 3u32);
        let pixels: Vec<u16> = (0..w * h).map(|i| u16::try_from(i * 1000).unwrap()).collect();
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            encoder
                .write_image::<colortype::Gray16>(w, h, &pixels)
                .unwrap();
        }
        let data = read_image(&path).unwrap();
        assert_eq!(data.dim(), (3, 5));
        assert_eq!(data[[0, 1]], 1000.0);
        assert_eq!(data[[2, 4]], 14000.0);
    }

    #[test]
    fn test_tiff_float_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.tiff");
        let pixels = vec![0.5f32, -1.25, 3.0, 7.75];
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            encoder
                .write_image::<colortype::Gray32Float>(2, 2, &pixels)
                .unwrap();
        }
        let data = read_image(&path).unwrap();
        assert_eq!(data[[0, 1]], -1.25);
        assert_eq!(data[[1, 1]], 7.75);
    }

    #[test]
    fn test_png_through_image_crate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let img = image::GrayImage::from_raw(2, 2, vec![0, 255, 51, 102]).unwrap();
        img.save(&path).unwrap();
        let data = read_image(&path).unwrap();
        assert_eq!(data.dim(), (2, 2));
        assert!((data[[0, 1]] - 1.0).abs() < 1e-6);
        assert!((data[[1, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = read_image("/definitely/not/here.tif").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_channels_are_averaged() {
        let frame = to_frame(vec![1.0, 3.0, 5.0, 7.0], 2, 1).unwrap();
        assert_eq!(frame, ndarray::array![[2.0, 6.0]]);
        assert!(to_frame(vec![1.0, 2.0, 3.0], 2, 1).is_err());
    }
}
