//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and sets up logging
//! - parses CLI arguments and sizes the worker pool
//! - runs the fit pipeline
//! - prints reports and writes optional exports

use std::time::Duration;

use clap::Parser;
use log::{info, warn};

use crate::cli::{Command, FitArgs, PixelArgs, RasterArgs};
use crate::data::RasterSpec;
use crate::domain::{DriverConfig, SolverOptions};
use crate::error::AppError;

pub mod pipeline;

/// Entry point for the `pixfit` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = crate::cli::Cli::parse();

    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| AppError::new(2, format!("Failed to size the worker pool: {e}")))?;
    }
    info!("worker pool: {} threads", rayon::current_num_threads());

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Pixel(args) => handle_pixel(args),
    }
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let request = fit_request_from_args(&args)?;
    let output = pipeline::run_fit(&request)?;

    println!(
        "{}",
        crate::report::format_run_summary(&output.cube, &output.template, &request.driver)
    );
    if let Some(profile) = &output.profile {
        println!("{profile}");
    }

    if args.compare {
        if pipeline::compare_with_synchronous(&request, &output)? {
            println!("Synchronous re-run: bit-identical");
        } else {
            warn!("synchronous re-run differs from the parallel result");
            return Err(AppError::new(
                5,
                "Synchronous and parallel results differ.".to_string(),
            ));
        }
    }

    if let Some(path) = &args.export_json {
        crate::io::write_cube_json(path, &output.cube, &output.template, &request.driver)?;
        info!("wrote {}", path.display());
    }
    if let Some(path) = &args.export_csv {
        crate::io::write_pixels_csv(path, &output.cube)?;
        info!("wrote {}", path.display());
    }

    Ok(())
}

fn handle_pixel(args: PixelArgs) -> Result<(), AppError> {
    let spec = raster_spec_from_args(&args.raster)?;
    let config = DriverConfig {
        fitting_axis: spec.fitting_axis,
        ..DriverConfig::default()
    };
    if args.average {
        let (template, mean, fit) = pipeline::run_average(&spec, &args.raster.fixed, &config)?;
        let used: usize = mean.counts.iter().sum();
        info!("mean spectrum built from {used} samples");
        println!("{}", crate::report::format_pixel_fit(&template, "Mean spectrum", &fit));
        return Ok(());
    }

    let (template, fit) = pipeline::run_pixel(&spec, &args.raster.fixed, &args.index, &config)?;
    let title = format!("Pixel {:?}", args.index);
    println!("{}", crate::report::format_pixel_fit(&template, &title, &fit));
    Ok(())
}

pub fn raster_spec_from_args(args: &RasterArgs) -> Result<RasterSpec, AppError> {
    let nan_pixels = args
        .nan_pixels
        .iter()
        .map(|text| crate::cli::parse_index(text))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::new(2, e))?;

    Ok(RasterSpec {
        pixel_shape: args.pixels.clone(),
        fitting_axis: args.fitting_axis,
        n_wave: args.n_wave,
        noise_sigma: args.noise,
        uncertainty: args.uncertainty,
        nan_pixels,
        flagged_fraction: args.flagged,
        seed: args.seed,
        ..RasterSpec::default()
    })
}

pub fn fit_request_from_args(args: &FitArgs) -> Result<pipeline::FitRequest, AppError> {
    let raster = raster_spec_from_args(&args.raster)?;
    let driver = DriverConfig {
        fitting_axis: raster.fitting_axis,
        scheduler: args.scheduler,
        chunk_size: args.chunk_size,
        filter_non_finite: !args.no_filter,
        fitter_options: SolverOptions {
            max_iterations: args.max_iterations,
            ..SolverOptions::default()
        },
        unit_timeout: args.unit_timeout_ms.map(Duration::from_millis),
        fatal_on_worker_fault: args.fatal_on_worker_fault,
        worker_retries: args.worker_retries,
    };

    Ok(pipeline::FitRequest {
        raster,
        driver,
        fixed: args.raster.fixed.clone(),
        profile: args.profile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::domain::Scheduler;

    fn fit_args(argv: &[&str]) -> FitArgs {
        let mut full = vec!["pixfit", "fit"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Fit(args) => args,
            Command::Pixel(_) => panic!("expected fit"),
        }
    }

    #[test]
    fn request_carries_driver_options() {
        let args = fit_args(&[
            "--pixels",
            "2,2,3",
            "--fitting-axis",
            "1",
            "--chunk-size",
            "4",
            "--no-filter",
            "--unit-timeout-ms",
            "250",
            "--nan-pixel",
            "1,0,2",
        ]);
        let req = fit_request_from_args(&args).unwrap();

        assert_eq!(req.raster.pixel_shape, vec![2, 2, 3]);
        assert_eq!(req.raster.nan_pixels, vec![vec![1, 0, 2]]);
        assert_eq!(req.driver.fitting_axis, 1);
        assert_eq!(req.driver.scheduler, Scheduler::Parallel);
        assert_eq!(req.driver.chunk_size, Some(4));
        assert!(!req.driver.filter_non_finite);
        assert_eq!(req.driver.unit_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn malformed_nan_pixel_is_rejected() {
        let args = fit_args(&["--nan-pixel", "one,two"]);
        let err = fit_request_from_args(&args).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
