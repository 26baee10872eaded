//! Export fitted parameter cubes.
//!
//! JSON is the portable representation of a run: model, driver configuration,
//! per-parameter arrays flattened in row-major pixel order, per-pixel status
//! and the summary. Failed pixels are written as `null`.
//!
//! The CSV has one row per pixel and is meant for spreadsheets or downstream
//! scripts.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::DriverConfig;
use crate::error::AppError;
use crate::fit::{unravel_index, FitSummary, ParameterCube};
use crate::models::ModelTemplate;

/// One parameter array, flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterColumn {
    pub name: String,
    pub fixed: bool,
    pub initial: f64,
    pub values: Vec<Option<f64>>,
}

/// Schema of a cube JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeFile {
    pub tool: String,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub config: DriverConfig,
    pub pixel_shape: Vec<usize>,
    pub parameters: Vec<ParameterColumn>,
    pub status: Vec<String>,
    pub rss: Vec<Option<f64>>,
    pub summary: FitSummary,
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

impl CubeFile {
    pub fn from_cube(cube: &ParameterCube, template: &ModelTemplate, config: &DriverConfig) -> Self {
        let parameters = cube
            .parameters()
            .enumerate()
            .map(|(i, (name, values))| ParameterColumn {
                name: name.to_string(),
                fixed: template.is_fixed(i),
                initial: template.initial()[i],
                values: values.iter().copied().map(finite).collect(),
            })
            .collect();

        Self {
            tool: "pixfit".to_string(),
            created_at: Utc::now(),
            model: template.label().to_string(),
            config: config.clone(),
            pixel_shape: cube.pixel_shape().to_vec(),
            parameters,
            status: cube.status().iter().map(|s| s.label().to_string()).collect(),
            rss: cube.rss().iter().copied().map(finite).collect(),
            summary: cube.summary(),
        }
    }
}

/// Write a cube JSON file.
pub fn write_cube_json(
    path: &Path,
    cube: &ParameterCube,
    template: &ModelTemplate,
    config: &DriverConfig,
) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create cube JSON '{}': {e}", path.display())))?;

    let doc = CubeFile::from_cube(cube, template, config);
    serde_json::to_writer_pretty(BufWriter::new(file), &doc)
        .map_err(|e| AppError::new(2, format!("Failed to write cube JSON: {e}")))?;

    Ok(())
}

/// Read a cube JSON file.
pub fn read_cube_json(path: &Path) -> Result<CubeFile, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open cube JSON '{}': {e}", path.display())))?;
    let doc: CubeFile =
        serde_json::from_reader(file).map_err(|e| AppError::new(2, format!("Invalid cube JSON: {e}")))?;
    Ok(doc)
}

/// Write one CSV row per pixel: index, status, parameters, rss, iterations.
pub fn write_pixels_csv(path: &Path, cube: &ParameterCube) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create export CSV '{}': {e}", path.display())))?;
    let mut out = BufWriter::new(file);
    let write_err = |e: std::io::Error| AppError::new(2, format!("Failed to write export CSV: {e}"));

    writeln!(out, "pixel,index,status,{},rss,iterations", cube.names().join(",")).map_err(write_err)?;

    let columns: Vec<Vec<f64>> = cube.parameters().map(|(_, v)| v.iter().copied().collect()).collect();
    let status: Vec<_> = cube.status().iter().copied().collect();
    let rss: Vec<f64> = cube.rss().iter().copied().collect();
    let iterations: Vec<usize> = cube.iterations().iter().copied().collect();

    for (pixel, ((state, r), n_iter)) in status.iter().zip(&rss).zip(&iterations).enumerate() {
        let index = unravel_index(cube.pixel_shape(), pixel)
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(":");
        let values = columns
            .iter()
            .map(|c| fmt_value(c[pixel]))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(
            out,
            "{pixel},{index},{},{values},{},{n_iter}",
            state.label(),
            fmt_value(*r)
        )
        .map_err(write_err)?;
    }
    out.flush().map_err(write_err)?;

    Ok(())
}

fn fmt_value(v: f64) -> String {
    if v.is_finite() {
        format!("{v:.10}")
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::domain::{FailureKind, FitDiagnostics, PixelFit};
    use crate::models::Component;

    fn template() -> ModelTemplate {
        ModelTemplate::from_compound(Component::const1d(1.0) + Component::gaussian1d(4.0, 976.8, 1.0))
            .unwrap()
            .fix("stddev_1")
            .unwrap()
    }

    fn cube() -> ParameterCube {
        let fitted = |p: Vec<f64>| PixelFit::Fitted {
            params: p,
            diagnostics: FitDiagnostics {
                rss: 0.25,
                iterations: 9,
                n_effective: 56,
                converged: true,
            },
        };
        ParameterCube::assemble(
            template().param_names().to_vec(),
            vec![1, 3],
            vec![
                (0, fitted(vec![1.0, 4.0, 976.8, 1.0])),
                (1, PixelFit::failed(FailureKind::Degenerate, template().initial())),
                (2, fitted(vec![1.5, 3.5, 976.7, 1.0])),
            ],
        )
        .unwrap()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pixfit-{}-{name}", std::process::id()))
    }

    #[test]
    fn json_round_trips_with_nulls_for_failed_pixels() {
        let path = temp_path("cube.json");
        let config = DriverConfig::default();
        write_cube_json(&path, &cube(), &template(), &config).unwrap();

        let doc = read_cube_json(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(doc.tool, "pixfit");
        assert_eq!(doc.pixel_shape, vec![1, 3]);
        assert_eq!(doc.config.scheduler, config.scheduler);
        assert_eq!(doc.config.worker_retries, config.worker_retries);
        assert_eq!(doc.parameters[1].name, "amplitude_1");
        assert_eq!(doc.parameters[1].values, vec![Some(4.0), None, Some(3.5)]);
        assert!(doc.parameters[3].fixed);
        assert_eq!(doc.status, vec!["fitted", "degenerate", "fitted"]);
        assert_eq!(doc.rss[1], None);
        assert_eq!(doc.summary.count(FailureKind::Degenerate), 1);
    }

    #[test]
    fn csv_has_one_row_per_pixel() {
        let path = temp_path("pixels.csv");
        write_pixels_csv(&path, &cube()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "pixel,index,status,amplitude_0,amplitude_1,mean_1,stddev_1,rss,iterations"
        );
        assert!(lines[2].starts_with("1,0:1,degenerate,,,,,"));
        assert!(lines[3].starts_with("2,0:2,fitted,1.5000000000,"));
        assert!(lines[3].ends_with(",9"));
    }
}
