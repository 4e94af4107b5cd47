//! Plain-text summary table for a finished batch

use crate::analyze::BatchReport;
use image_analysis::{ImageAnalysis, Recommendation};
use std::fmt::Write;

const NAME_WIDTH: usize = 28;

pub fn render(report: &BatchReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<NAME_WIDTH$} {:>7} {:<11} {:<11} {:>5} {:>5} {:>5} {:>5}",
        "IMAGE", "OVERALL", "GENERAL", "RECONSTRUCT", "BLUR", "EXPO", "NOISE", "DESC"
    );

    for analysis in &report.analyses {
        let _ = writeln!(out, "{}", row(analysis));
    }
    for (path, reason) in &report.failures {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let _ = writeln!(out, "{:<NAME_WIDTH$} failed: {}", truncate(&name), reason);
    }

    let analyzed = report.analyses.len() + report.failures.len();
    let _ = writeln!(
        out,
        "\n{} analyzed, {} failed{}",
        analyzed,
        report.failed_count(),
        band_counts(&report.analyses)
    );
    out
}

fn row(analysis: &ImageAnalysis) -> String {
    let name = truncate(&analysis.name);
    if let Some(error) = &analysis.error {
        return format!("{name:<NAME_WIDTH$} failed: {error}");
    }

    let descriptor = analysis.descriptor_analysis.as_ref().map(|d| d.descriptor_score);
    let exposure = analysis.exposure_analysis.as_ref().map(|e| e.exposure_score);
    let noise = analysis.noise_analysis.as_ref().map(|n| n.noise_score);
    format!(
        "{:<NAME_WIDTH$} {:>7} {:<11} {:<11} {:>5} {:>5} {:>5} {:>5}",
        name,
        analysis.overall().map(|o| o.to_string()).unwrap_or_else(|| "-".into()),
        band(analysis.recommendation()),
        band(analysis.reconstruction_suitability()),
        score(analysis.blur_score),
        score(exposure),
        score(noise),
        score(descriptor),
    )
}

fn band(recommendation: Option<Recommendation>) -> &'static str {
    recommendation.map(|r| r.as_str()).unwrap_or("-")
}

fn score(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.0}")).unwrap_or_else(|| "-".into())
}

fn truncate(name: &str) -> String {
    if name.chars().count() <= NAME_WIDTH {
        name.to_string()
    } else {
        let skip = name.chars().count() - (NAME_WIDTH - 3);
        format!("...{}", name.chars().skip(skip).collect::<String>())
    }
}

/// ", 3 excellent, 1 poor" for the bands that occur
fn band_counts(analyses: &[ImageAnalysis]) -> String {
    let mut counts = [0usize; 5];
    for rec in analyses.iter().filter_map(ImageAnalysis::recommendation) {
        counts[4 - rec.rank() as usize] += 1;
    }
    [
        Recommendation::Excellent,
        Recommendation::Good,
        Recommendation::Acceptable,
        Recommendation::Poor,
        Recommendation::Unsuitable,
    ]
    .iter()
    .zip(counts)
    .filter(|(_, n)| *n > 0)
    .map(|(rec, n)| format!(", {} {}", n, rec.as_str()))
    .collect()
}
