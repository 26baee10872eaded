//! Shared "fit pipeline" logic used by the CLI subcommands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! raster generation -> template -> weights -> driver run -> summary
//!
//! The subcommands can then focus on presentation and exports.

use std::sync::Arc;

use log::info;

use crate::data::{build_weights, generate_raster, is_invalid_sigma, mean_spectrum, MeanSpectrum, RasterSpec, SyntheticRaster};
use crate::domain::{DriverConfig, PixelFit, Scheduler};
use crate::error::{AppError, FitError};
use crate::fit::{fit_pixel, ravel_index, LevenbergMarquardt, LogProgress, ParallelFitDriver, ParameterCube, WallClockProfiler};
use crate::models::{Component, ModelTemplate};

/// Everything a `pixfit fit` run needs.
#[derive(Debug, Clone)]
pub struct FitRequest {
    pub raster: RasterSpec,
    pub driver: DriverConfig,
    /// Parameter names held at their initial values.
    pub fixed: Vec<String>,
    pub profile: bool,
}

/// All computed outputs of a single `pixfit fit` run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub raster: SyntheticRaster,
    pub template: ModelTemplate,
    pub cube: ParameterCube,
    pub profile: Option<String>,
}

/// Continuum plus Gaussian line, started from the raster's nominal values.
pub fn line_template(spec: &RasterSpec, fixed: &[String]) -> Result<ModelTemplate, FitError> {
    let model = Component::const1d(spec.continuum) + Component::gaussian1d(spec.amplitude, spec.mean, spec.stddev);
    let mut template = ModelTemplate::from_compound(model)?;
    for name in fixed {
        template = template.fix(name)?;
    }
    Ok(template)
}

/// Generate the raster and fit every pixel.
pub fn run_fit(request: &FitRequest) -> Result<RunOutput, AppError> {
    let raster = generate_raster(&request.raster)?;
    let template = line_template(&request.raster, &request.fixed)?;

    let profiler = Arc::new(WallClockProfiler::new());
    let mut driver = ParallelFitDriver::new(LevenbergMarquardt, request.driver.clone());
    driver = if request.profile {
        driver.with_progress(profiler.clone()).with_profiler(profiler.clone())
    } else {
        driver.with_progress(Arc::new(LogProgress))
    };

    let cube = driver.run_with_uncertainty(
        &template,
        &raster.data,
        &raster.wave,
        &raster.uncertainty,
        Some(&raster.flags),
    )?;

    Ok(RunOutput {
        raster,
        template,
        cube,
        profile: request.profile.then(|| profiler.report()),
    })
}

/// Re-fit `output` synchronously and report whether both cubes match bit for bit.
pub fn compare_with_synchronous(request: &FitRequest, output: &RunOutput) -> Result<bool, AppError> {
    let config = DriverConfig {
        scheduler: Scheduler::Synchronous,
        ..request.driver.clone()
    };
    let reference = ParallelFitDriver::new(LevenbergMarquardt, config).run_with_uncertainty(
        &output.template,
        &output.raster.data,
        &output.raster.wave,
        &output.raster.uncertainty,
        Some(&output.raster.flags),
    )?;
    let identical = reference.identical(&output.cube);
    info!("synchronous re-run identical: {identical}");
    Ok(identical)
}

/// Fit one pixel of the raster exactly as the driver would.
pub fn run_pixel(
    raster_spec: &RasterSpec,
    fixed: &[String],
    index: &[usize],
    config: &DriverConfig,
) -> Result<(ModelTemplate, PixelFit), AppError> {
    let raster = generate_raster(raster_spec)?;
    let template = line_template(raster_spec, fixed)?;
    let weights = build_weights(&raster.data, &raster.uncertainty, Some(&raster.flags))?;

    let pixel_shape = &raster_spec.pixel_shape;
    if ravel_index(pixel_shape, index).is_none() {
        return Err(AppError::new(
            2,
            format!("pixel index {index:?} is outside the raster {pixel_shape:?}"),
        ));
    }

    // Full cube index with the fitting axis slot filled per sample.
    let mut at = index.to_vec();
    at.insert(raster_spec.fitting_axis, 0);
    let mut y = Vec::with_capacity(raster.wave.len());
    let mut w = Vec::with_capacity(raster.wave.len());
    for k in 0..raster.wave.len() {
        at[raster_spec.fitting_axis] = k;
        y.push(raster.data[at.as_slice()]);
        w.push(weights.weights[at.as_slice()]);
    }

    let fit = fit_pixel(&LevenbergMarquardt, &template, &raster.wave, &y, &w, config);
    Ok((template, fit))
}

/// Fit the raster's spatially averaged spectrum.
pub fn run_average(
    raster_spec: &RasterSpec,
    fixed: &[String],
    config: &DriverConfig,
) -> Result<(ModelTemplate, MeanSpectrum, PixelFit), AppError> {
    let raster = generate_raster(raster_spec)?;
    let template = line_template(raster_spec, fixed)?;
    let weights = build_weights(&raster.data, &raster.uncertainty, Some(&raster.flags))?;
    let mean = mean_spectrum(&raster.data, &weights, raster_spec.fitting_axis)?;
    info!(
        "averaged {} pixels into one spectrum",
        raster_spec.pixel_shape.iter().product::<usize>()
    );

    let w: Vec<f64> = mean
        .uncertainty
        .iter()
        .map(|&sigma| if is_invalid_sigma(sigma) { 0.0 } else { 1.0 / sigma })
        .collect();
    let fit = fit_pixel(&LevenbergMarquardt, &template, &raster.wave, &mean.values, &w, config);
    Ok((template, mean, fit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PixelStatus;

    fn request() -> FitRequest {
        FitRequest {
            raster: RasterSpec {
                noise_sigma: 0.02,
                flagged_fraction: 0.05,
                nan_pixels: vec![vec![2, 1]],
                ..RasterSpec::default()
            },
            driver: DriverConfig {
                chunk_size: Some(2),
                ..DriverConfig::default()
            },
            fixed: Vec::new(),
            profile: true,
        }
    }

    #[test]
    fn pipeline_fits_and_compares() {
        let req = request();
        let out = run_fit(&req).unwrap();
        let summary = out.cube.summary();
        assert_eq!(summary.n_pixels, 12);
        assert_eq!(summary.failed(), 1);
        assert!(out.profile.as_deref().unwrap().contains("Units: 6"));
        assert!(compare_with_synchronous(&req, &out).unwrap());
    }

    #[test]
    fn pixel_debug_fit_matches_the_cube() {
        let req = request();
        let out = run_fit(&req).unwrap();
        let (_, fit) = run_pixel(&req.raster, &req.fixed, &[1, 3], &req.driver).unwrap();

        let bits = |v: &[f64]| v.iter().map(|p| p.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(fit.params().unwrap()), bits(&out.cube.params_at(&[1, 3]).unwrap()));

        let (_, nan_fit) = run_pixel(&req.raster, &req.fixed, &[2, 1], &req.driver).unwrap();
        assert_eq!(nan_fit.status(), out.cube.status_at(&[2, 1]).unwrap());
        assert!(matches!(nan_fit.status(), PixelStatus::Failed(_)));
    }

    #[test]
    fn average_spectrum_skips_bad_pixels_and_fits() {
        let req = request();
        let (template, mean, fit) = run_average(&req.raster, &req.fixed, &req.driver).unwrap();

        assert_eq!(mean.values.len(), req.raster.n_wave);
        assert!(mean.values.iter().all(|v| v.is_finite()));
        assert!(mean.counts.iter().all(|&c| c > 0 && c <= 11));

        assert!(fit.status().has_params());
        let params = fit.params().unwrap();
        let at = |name: &str| params[template.param_names().iter().position(|n| n == name).unwrap()];
        assert!((at("mean_1") - 976.8).abs() < 0.05);
        assert!((4.0..5.0).contains(&at("amplitude_1")));
        assert!((1.0..1.1).contains(&at("amplitude_0")));
    }

    #[test]
    fn unknown_fixed_parameter_is_a_configuration_error() {
        let err = line_template(&RasterSpec::default(), &["sigma".to_string()]).unwrap_err();
        assert!(matches!(err, FitError::Configuration(_)));
        assert!(run_pixel(&RasterSpec::default(), &[], &[3, 0], &DriverConfig::default()).is_err());
    }
}
