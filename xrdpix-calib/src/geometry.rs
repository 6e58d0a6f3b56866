//! Pixel to scattering-angle geometry for a flat detector.
//!
//! For a pixel at detector coordinates `(d1, d2)` the scattered-ray vector
//! in the laboratory frame is obtained by rotating `(d1 - poni1,
//! d2 - poni2, L)` by the three detector rotations. The scattering angle is
//! the angle of that vector to the beam; the azimuth is its angle around
//! the beam.

use ndarray::Array2;
use rayon::prelude::*;

use crate::{PoniParameters, Result};

/// Laboratory-frame components `(t1, t2, t3)` of the ray through the
/// detector point `(d1, d2)` (metres from the detector origin).
#[must_use]
pub fn lab_vector(params: &PoniParameters, d1: f64, d2: f64) -> [f64; 3] {
    let (s1, c1) = params.rot1.sin_cos();
    let (s2, c2) = params.rot2.sin_cos();
    let (s3, c3) = params.rot3.sin_cos();
    let p1 = d1 - params.poni1;
    let p2 = d2 - params.poni2;
    let l = params.distance;

    let t1 = p1 * c2 * c3 + p2 * (c3 * s1 * s2 - c1 * s3) - l * (c1 * c3 * s2 + s1 * s3);
    let t2 = p1 * c2 * s3 + p2 * (c1 * c3 + s1 * s2 * s3) - l * (-(c3 * s1) + c1 * s2 * s3);
    let t3 = p1 * s2 - p2 * c2 * s1 + l * c1 * c2;
    [t1, t2, t3]
}

/// Scattering angle and azimuth (radians) at a fractional pixel position.
///
/// Pixel `(row, col)` has its centre at `((row + 0.5) * pixel1,
/// (col + 0.5) * pixel2)`.
#[must_use]
pub fn pixel_angles(params: &PoniParameters, row: f64, col: f64) -> (f64, f64) {
    let [t1, t2, t3] = lab_vector(
        params,
        (row + 0.5) * params.pixel1,
        (col + 0.5) * params.pixel2,
    );
    ((t1.hypot(t2)).atan2(t3), t1.atan2(t2))
}

/// Cosine of the incidence angle on the detector surface at a pixel.
#[must_use]
pub fn cos_incidence(params: &PoniParameters, row: f64, col: f64) -> f64 {
    let p1 = (row + 0.5) * params.pixel1 - params.poni1;
    let p2 = (col + 0.5) * params.pixel2 - params.poni2;
    let l = params.distance;
    l / (l * l + p1 * p1 + p2 * p2).sqrt()
}

/// Per-pixel geometry for one detector shape.
#[derive(Debug, Clone)]
pub struct GeometryArrays {
    shape: (usize, usize),
    tth: Array2<f64>,
    chi: Array2<f64>,
    cos_incidence: Array2<f64>,
}

impl GeometryArrays {
    /// Evaluates the geometry for every pixel of a `shape = (rows, cols)` image.
    ///
    /// # Errors
    /// Returns `Shape` if the per-pixel values cannot form a `shape` array.
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(params: &PoniParameters, shape: (usize, usize)) -> Result<Self> {
        let (rows, cols) = shape;
        let values: Vec<(f64, f64, f64)> = (0..rows * cols)
            .into_par_iter()
            .map(|idx| {
                let row = (idx / cols) as f64;
                let col = (idx % cols) as f64;
                let (tth, chi) = pixel_angles(params, row, col);
                (tth, chi, cos_incidence(params, row, col))
            })
            .collect();

        let mut tth = Vec::with_capacity(values.len());
        let mut chi = Vec::with_capacity(values.len());
        let mut cosa = Vec::with_capacity(values.len());
        for (t, c, a) in values {
            tth.push(t);
            chi.push(c);
            cosa.push(a);
        }
        Ok(Self {
            shape,
            tth: Array2::from_shape_vec(shape, tth)?,
            chi: Array2::from_shape_vec(shape, chi)?,
            cos_incidence: Array2::from_shape_vec(shape, cosa)?,
        })
    }

    /// Image shape these arrays describe.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Scattering angle per pixel, radians.
    #[must_use]
    pub fn tth(&self) -> &Array2<f64> {
        &self.tth
    }

    /// Azimuth per pixel, radians in `(-π, π]`.
    #[must_use]
    pub fn chi(&self) -> &Array2<f64> {
        &self.chi
    }

    /// Cosine of the incidence angle per pixel.
    #[must_use]
    pub fn cos_incidence(&self) -> &Array2<f64> {
        &self.cos_incidence
    }

    /// Relative solid angle `cos³(incidence)` per pixel.
    #[must_use]
    pub fn solid_angle(&self) -> Array2<f64> {
        self.cos_incidence.mapv(|c| c * c * c)
    }
}

/// Detector geometry with a per-shape cache of pixel arrays.
#[derive(Debug, Clone, Default)]
pub struct Geometry {
    params: PoniParameters,
    cache: Option<GeometryArrays>,
}

impl Geometry {
    /// Create a geometry from PONI parameters.
    #[must_use]
    pub fn new(params: PoniParameters) -> Self {
        Self {
            params,
            cache: None,
        }
    }

    /// Current parameters.
    #[must_use]
    pub fn params(&self) -> &PoniParameters {
        &self.params
    }

    /// Replace the parameters, invalidating cached arrays.
    pub fn set_params(&mut self, params: PoniParameters) {
        if params != self.params {
            self.params = params;
            self.cache = None;
        }
    }

    /// Pixel arrays for `shape`, computed on first use.
    ///
    /// # Errors
    /// See [`GeometryArrays::compute`].
    pub fn arrays(&mut self, shape: (usize, usize)) -> Result<&GeometryArrays> {
        let arrays = match self.cache.take() {
            Some(cached) if cached.shape == shape => cached,
            _ => {
                log::debug!("computing geometry arrays for {}x{} pixels", shape.0, shape.1);
                GeometryArrays::compute(&self.params, shape)?
            }
        };
        Ok(&*self.cache.insert(arrays))
    }

    /// Scattering angle (radians) at a fractional pixel position.
    #[must_use]
    pub fn tth_at(&self, row: f64, col: f64) -> f64 {
        pixel_angles(&self.params, row, col).0
    }

    /// Azimuth (radians) at a fractional pixel position.
    #[must_use]
    pub fn chi_at(&self, row: f64, col: f64) -> f64 {
        pixel_angles(&self.params, row, col).1
    }
}
