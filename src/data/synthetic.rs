//! Synthetic spectral rasters.
//!
//! Stand-in for real instrument files: a grid of pixels, each holding one
//! spectrum made of a flat continuum plus a Gaussian emission line on a shared
//! wavelength grid. Every pixel gets its own, slightly different, true line
//! parameters so that a fit which mixes pixels up is caught immediately.
//!
//! Generation is fully deterministic for a given seed.

use ndarray::{ArrayD, IxDyn};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::error::FitError;
use crate::fit::ravel_index;

/// Parameters of a synthetic raster.
#[derive(Debug, Clone)]
pub struct RasterSpec {
    /// Shape of the independent pixel axes.
    pub pixel_shape: Vec<usize>,
    /// Position of the wavelength axis in the generated cube.
    pub fitting_axis: usize,
    pub n_wave: usize,
    pub wave_start: f64,
    pub wave_step: f64,
    pub continuum: f64,
    pub amplitude: f64,
    pub mean: f64,
    pub stddev: f64,
    /// One-sigma Gaussian noise added to every sample (0 = exact model values).
    pub noise_sigma: f64,
    /// Uncertainty reported for every sample.
    pub uncertainty: f64,
    /// Pixels (multi-indices over `pixel_shape`) whose spectra are all NaN.
    pub nan_pixels: Vec<Vec<usize>>,
    /// Probability that a sample is flagged bad by calibration.
    pub flagged_fraction: f64,
    pub seed: u64,
}

impl Default for RasterSpec {
    fn default() -> Self {
        Self {
            pixel_shape: vec![3, 4],
            fitting_axis: 0,
            n_wave: 56,
            wave_start: 970.0,
            wave_step: 0.25,
            continuum: 1.0,
            amplitude: 4.0,
            mean: 976.8,
            stddev: 1.0,
            noise_sigma: 0.0,
            uncertainty: 1.0,
            nan_pixels: Vec::new(),
            flagged_fraction: 0.0,
            seed: 42,
        }
    }
}

/// A generated raster plus the truth it was generated from.
#[derive(Debug, Clone)]
pub struct SyntheticRaster {
    pub data: ArrayD<f64>,
    pub uncertainty: ArrayD<f64>,
    /// Calibration flags (`true` = bad sample).
    pub flags: ArrayD<bool>,
    pub wave: Vec<f64>,
    /// True `[continuum, amplitude, mean, stddev]` per pixel, in row-major
    /// order of the pixel axes.
    pub truth: Vec<[f64; 4]>,
}

impl RasterSpec {
    /// True line parameters of the pixel with row-major index `pixel`.
    pub fn truth_for(&self, pixel: usize) -> [f64; 4] {
        let a = (pixel % 7) as f64;
        let b = (pixel % 5) as f64;
        [
            self.continuum * (1.0 + 0.02 * b),
            self.amplitude * (1.0 + 0.05 * a),
            self.mean + 0.03 * (b - 2.0),
            self.stddev * (1.0 + 0.02 * (a - 3.0)),
        ]
    }

    pub fn wave_grid(&self) -> Vec<f64> {
        (0..self.n_wave)
            .map(|i| self.wave_start + self.wave_step * i as f64)
            .collect()
    }
}

/// Generate a raster according to `spec`.
pub fn generate_raster(spec: &RasterSpec) -> Result<SyntheticRaster, FitError> {
    let n_pix_axes = spec.pixel_shape.len();
    if spec.fitting_axis > n_pix_axes {
        return Err(FitError::config(format!(
            "fitting axis {} out of range for a {}-D cube",
            spec.fitting_axis,
            n_pix_axes + 1
        )));
    }
    if !(spec.noise_sigma.is_finite() && spec.noise_sigma >= 0.0) {
        return Err(FitError::config("noise sigma must be finite and >= 0"));
    }
    if !(0.0..=1.0).contains(&spec.flagged_fraction) {
        return Err(FitError::config("flagged fraction must lie in [0, 1]"));
    }
    for p in &spec.nan_pixels {
        if p.len() != n_pix_axes || p.iter().zip(&spec.pixel_shape).any(|(i, n)| i >= n) {
            return Err(FitError::config(format!("NaN pixel {p:?} is outside the raster")));
        }
    }

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let noise = Normal::new(0.0, spec.noise_sigma)
        .map_err(|e| FitError::config(format!("noise distribution error: {e}")))?;

    let wave = spec.wave_grid();
    let n_pixels: usize = spec.pixel_shape.iter().product();
    let n_wave = spec.n_wave;

    // Pixel-major layout first (wavelength last), permuted into place below.
    let mut values = Vec::with_capacity(n_pixels * n_wave);
    let mut flags = Vec::with_capacity(n_pixels * n_wave);
    let mut truth = Vec::with_capacity(n_pixels);

    for pixel in 0..n_pixels {
        let t = spec.truth_for(pixel);
        truth.push(t);
        let is_nan = spec
            .nan_pixels
            .iter()
            .any(|p| ravel_index(&spec.pixel_shape, p) == Some(pixel));

        for &x in &wave {
            let d = x - t[2];
            let clean = t[0] + t[1] * (-(d * d) / (2.0 * t[3] * t[3])).exp();
            let v = if is_nan {
                f64::NAN
            } else if spec.noise_sigma > 0.0 {
                clean + noise.sample(&mut rng)
            } else {
                clean
            };
            values.push(v);
            flags.push(spec.flagged_fraction > 0.0 && rng.gen_bool(spec.flagged_fraction));
        }
    }

    let mut pixel_major_shape = spec.pixel_shape.clone();
    pixel_major_shape.push(n_wave);
    let mut axes: Vec<usize> = (0..n_pix_axes).collect();
    axes.insert(spec.fitting_axis, n_pix_axes);

    let shape_err = |e: ndarray::ShapeError| FitError::config(format!("raster shape error: {e}"));
    let data = ArrayD::from_shape_vec(IxDyn(&pixel_major_shape), values)
        .map_err(shape_err)?
        .permuted_axes(axes.clone())
        .as_standard_layout()
        .into_owned();
    let flags = ArrayD::from_shape_vec(IxDyn(&pixel_major_shape), flags)
        .map_err(shape_err)?
        .permuted_axes(axes)
        .as_standard_layout()
        .into_owned();
    let uncertainty = ArrayD::from_elem(data.raw_dim(), spec.uncertainty);

    Ok(SyntheticRaster {
        data,
        uncertainty,
        flags,
        wave,
        truth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_places_wavelength_on_the_fitting_axis() {
        let spec = RasterSpec {
            pixel_shape: vec![2, 3],
            fitting_axis: 1,
            n_wave: 10,
            ..RasterSpec::default()
        };
        let raster = generate_raster(&spec).unwrap();
        assert_eq!(raster.data.shape(), &[2, 10, 3]);
        assert_eq!(raster.uncertainty.shape(), &[2, 10, 3]);
        assert_eq!(raster.wave.len(), 10);
        assert_eq!(raster.truth.len(), 6);

        // Pixel (1, 2) is row-major index 5.
        let t = raster.truth[5];
        let x = raster.wave[4];
        let d = x - t[2];
        let expected = t[0] + t[1] * (-(d * d) / (2.0 * t[3] * t[3])).exp();
        assert_eq!(raster.data[[1, 4, 2]], expected);
    }

    #[test]
    fn nan_pixels_are_entirely_nan() {
        let spec = RasterSpec {
            nan_pixels: vec![vec![1, 2]],
            ..RasterSpec::default()
        };
        let raster = generate_raster(&spec).unwrap();
        for k in 0..spec.n_wave {
            assert!(raster.data[[k, 1, 2]].is_nan());
            assert!(raster.data[[k, 0, 0]].is_finite());
        }
    }

    #[test]
    fn same_seed_same_raster() {
        let spec = RasterSpec {
            noise_sigma: 0.1,
            flagged_fraction: 0.2,
            ..RasterSpec::default()
        };
        let a = generate_raster(&spec).unwrap();
        let b = generate_raster(&spec).unwrap();
        assert_eq!(a.data, b.data);
        assert_eq!(a.flags, b.flags);
        assert!(a.flags.iter().any(|f| *f));
    }

    #[test]
    fn rejects_out_of_range_inputs() {
        let spec = RasterSpec {
            fitting_axis: 3,
            ..RasterSpec::default()
        };
        assert!(generate_raster(&spec).is_err());

        let spec = RasterSpec {
            nan_pixels: vec![vec![3, 0]],
            ..RasterSpec::default()
        };
        assert!(generate_raster(&spec).is_err());
    }
}
