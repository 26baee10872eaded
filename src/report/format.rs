//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use crate::domain::{DriverConfig, FailureKind, PixelFit};
use crate::fit::ParameterCube;
use crate::models::ModelTemplate;

/// Robust location/spread of one parameter over the pixels that have values.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterStats {
    pub name: String,
    pub n: usize,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

/// Per-parameter statistics over all pixels with finite values.
pub fn parameter_stats(cube: &ParameterCube) -> Vec<ParameterStats> {
    cube.parameters()
        .map(|(name, values)| {
            let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
            finite.sort_by(f64::total_cmp);
            ParameterStats {
                name: name.to_string(),
                n: finite.len(),
                median: median_sorted(&finite),
                min: finite.first().copied().unwrap_or(f64::NAN),
                max: finite.last().copied().unwrap_or(f64::NAN),
            }
        })
        .collect()
}

fn median_sorted(v: &[f64]) -> f64 {
    match v.len() {
        0 => f64::NAN,
        n if n % 2 == 1 => v[n / 2],
        n => 0.5 * (v[n / 2 - 1] + v[n / 2]),
    }
}

/// Format the full run summary (configuration, status counts, parameters).
pub fn format_run_summary(cube: &ParameterCube, template: &ModelTemplate, config: &DriverConfig) -> String {
    let mut out = String::new();

    out.push_str("=== pixfit - per-pixel model fit ===\n");
    out.push_str(&format!("Model: {}\n", template.label()));
    out.push_str(&format!(
        "Free parameters: {} of {}\n",
        template.n_free(),
        template.n_params()
    ));
    out.push_str(&format!(
        "Pixels: {} {:?} | fitting axis {} | {}\n",
        cube.n_pixels(),
        cube.pixel_shape(),
        config.fitting_axis,
        config.scheduler
    ));

    let summary = cube.summary();
    out.push_str("\nStatus:\n");
    out.push_str(&format!("  {:<18} {:>8}\n", "fitted", summary.fitted));
    out.push_str(&format!("  {:<18} {:>8}\n", "not_converged", summary.not_converged));
    for kind in FailureKind::ALL {
        let n = summary.count(kind);
        if n > 0 {
            out.push_str(&format!("  {:<18} {:>8}\n", kind.label(), n));
        }
    }
    out.push_str(&format!("  success rate {:.1}%\n", 100.0 * summary.success_rate()));

    out.push_str("\nParameters (over fitted pixels):\n");
    out.push_str(format!("{:<14} {:>6} {:>14} {:>14} {:>14}", "name", "n", "median", "min", "max").trim_end());
    out.push('\n');
    out.push_str(format!("{:-<14} {:-<6} {:-<14} {:-<14} {:-<14}", "", "", "", "", "").trim_end());
    out.push('\n');
    for s in parameter_stats(cube) {
        out.push_str(&format!(
            "{:<14} {:>6} {:>14.6} {:>14.6} {:>14.6}\n",
            truncate(&s.name, 14),
            s.n,
            s.median,
            s.min,
            s.max
        ));
    }

    out
}

/// Format one spectrum fit under `title`.
pub fn format_pixel_fit(template: &ModelTemplate, title: &str, fit: &PixelFit) -> String {
    let mut out = String::new();
    out.push_str(&format!("{title}: {}\n", fit.status().label()));

    match fit {
        PixelFit::Fitted { params, diagnostics } => {
            for (i, (name, value)) in template.param_names().iter().zip(params).enumerate() {
                let tag = if template.is_fixed(i) { " (fixed)" } else { "" };
                out.push_str(&format!("  {name:<14} {value:>14.6}{tag}\n"));
            }
            out.push_str(&format!(
                "  rss={:.6e} iterations={} samples={}\n",
                diagnostics.rss, diagnostics.iterations, diagnostics.n_effective
            ));
        }
        PixelFit::Failed { fallback, .. } => {
            out.push_str(&format!("  initial guess: {}\n", fmt_vec(fallback)));
        }
    }
    out
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.6}")).collect();
    format!("[{}]", parts.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FitDiagnostics;
    use crate::models::Component;

    fn template() -> ModelTemplate {
        ModelTemplate::from_compound(Component::const1d(1.0) + Component::gaussian1d(4.0, 976.8, 1.0))
            .unwrap()
    }

    fn fitted(params: Vec<f64>) -> PixelFit {
        PixelFit::Fitted {
            params,
            diagnostics: FitDiagnostics {
                rss: 1e-3,
                iterations: 12,
                n_effective: 56,
                converged: true,
            },
        }
    }

    fn cube() -> ParameterCube {
        ParameterCube::assemble(
            template().param_names().to_vec(),
            vec![2, 2],
            vec![
                (0, fitted(vec![1.0, 4.0, 976.0, 1.0])),
                (1, fitted(vec![2.0, 5.0, 977.0, 1.2])),
                (2, fitted(vec![3.0, 6.0, 978.0, 1.4])),
                (3, PixelFit::failed(FailureKind::Degenerate, template().initial())),
            ],
        )
        .unwrap()
    }

    #[test]
    fn stats_skip_failed_pixels() {
        let stats = parameter_stats(&cube());
        assert_eq!(stats.len(), 4);
        assert_eq!(stats[0].name, "amplitude_0");
        assert_eq!(stats[0].n, 3);
        assert_eq!(stats[0].median, 2.0);
        assert_eq!(stats[0].min, 1.0);
        assert_eq!(stats[0].max, 3.0);
    }

    #[test]
    fn median_of_even_count_is_midpoint() {
        assert_eq!(median_sorted(&[1.0, 2.0, 4.0, 8.0]), 3.0);
        assert!(median_sorted(&[]).is_nan());
    }

    #[test]
    fn summary_lists_failure_kinds_that_occurred() {
        let text = format_run_summary(&cube(), &template(), &DriverConfig::default());
        assert!(text.contains("degenerate"));
        assert!(!text.contains("timed_out"));
        assert!(text.contains("success rate 75.0%"));
        assert!(text.contains("mean_1"));
    }

    #[test]
    fn pixel_report_marks_fixed_parameters() {
        let t = template().fix("stddev_1").unwrap();
        let text = format_pixel_fit(&t, "Pixel [0, 1]", &fitted(vec![1.0, 4.0, 976.8, 1.0]));
        assert!(text.starts_with("Pixel [0, 1]: fitted"));
        assert!(text.contains("(fixed)"));

        let failed = PixelFit::failed(FailureKind::NonFiniteInput, t.initial());
        let text = format_pixel_fit(&t, "Mean spectrum", &failed);
        assert!(text.contains("non_finite_input"));
        assert!(text.contains("initial guess"));
    }

    #[test]
    fn truncate_marks_cut_names() {
        assert_eq!(truncate("amplitude", 14), "amplitude");
        assert_eq!(truncate("a_very_long_parameter", 6), "a_ver.");
    }
}
