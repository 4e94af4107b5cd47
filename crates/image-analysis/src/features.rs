//! Keypoint detection and matchability estimate
//!
//! Detection runs on a downsampled grid (long edge `detection_edge`) with three detector
//! variants, each capped at `max_per_detector`:
//!
//! 1. Harris corners at full grid resolution
//! 2. Harris corners at half resolution (coarser structure)
//! 3. Blobs from the Laplacian of the box-smoothed half-resolution grid
//!
//! Keypoints are classified from the eigenvalues of the local structure tensor, then the
//! spatial distribution over an N x N grid and the response statistics are combined into
//! `descriptor_score`.

use crate::analyzer::PixelAnalyzer;
use crate::config::FeatureConfig;
use crate::error::{AnalysisError, Result};
use crate::model::{
    DescriptorAnalysis, DescriptorQuality, Detector, FeatureType, FeatureTypeCounts, Keypoint,
    KeypointDistribution, Stage,
};
use crate::pixels::DecodedImage;
use compute_dispatch::{ComputeDispatcher, Gradients, Plane};
use tracing::debug;

/// Smallest detection grid edge worth searching
const MIN_DETECTION_EDGE: usize = 8;
/// Eigenvalue ratio above which a point is a corner
const CORNER_RATIO: f32 = 0.3;
/// Eigenvalue ratio below which a point is an edge
const EDGE_RATIO: f32 = 0.05;

/// A keypoint before classification, in detection-grid coordinates
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x: usize,
    y: usize,
    response: f32,
    strength: f32,
    detector: Detector,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureAnalyzer {
    config: FeatureConfig,
}

impl FeatureAnalyzer {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    /// Analyze a luminance plane at analysis resolution
    pub fn analyze_plane(&self, luma: &Plane, dispatcher: &ComputeDispatcher) -> Result<DescriptorAnalysis> {
        let cfg = &self.config;
        let grid = detection_grid(luma, cfg.detection_edge as usize);
        if grid.width() < MIN_DETECTION_EDGE || grid.height() < MIN_DETECTION_EDGE {
            return Err(AnalysisError::stage(
                Stage::Features,
                format!("detection grid {}x{} is too small", grid.width(), grid.height()),
            ));
        }

        let gradients = dispatcher.sobel(&grid);
        let mut candidates = Vec::new();

        // Full-resolution Harris
        let response = dispatcher.harris_response(&gradients, cfg.harris_k);
        candidates.extend(detect(&response, cfg.harris_floor, cfg, Detector::Harris, 1, 0));

        let half = grid.downsample(2);
        if half.width() >= MIN_DETECTION_EDGE && half.height() >= MIN_DETECTION_EDGE {
            // Half-resolution Harris
            let half_gradients = dispatcher.sobel(&half);
            let half_response = dispatcher.harris_response(&half_gradients, cfg.harris_k);
            candidates.extend(detect(&half_response, cfg.harris_floor, cfg, Detector::HarrisHalf, 2, 0));

            // Laplacian output is offset by its 1-pixel border
            let blob_response = dispatcher.laplacian(&half);
            candidates.extend(detect(&blob_response, cfg.blob_floor, cfg, Detector::Blob, 2, 1));
        }
        candidates.truncate(cfg.max_keypoints);

        // Keypoints are reported in analysis-image coordinates
        let sx = luma.width() as f32 / grid.width() as f32;
        let sy = luma.height() as f32 / grid.height() as f32;

        let mut feature_types = FeatureTypeCounts::default();
        let keypoints: Vec<Keypoint> = candidates
            .iter()
            .map(|c| {
                let kind = classify(&gradients, c);
                feature_types.add(kind);
                Keypoint {
                    x: (c.x as f32 + 0.5) * sx,
                    y: (c.y as f32 + 0.5) * sy,
                    response: c.response,
                    strength: c.strength,
                    detector: c.detector,
                    kind,
                }
            })
            .collect();

        let pixel_count = luma.len();
        let keypoint_density = if pixel_count == 0 {
            0.0
        } else {
            keypoints.len() as f64 / (pixel_count as f64 / 1000.0)
        };

        let keypoint_distribution = distribution(&candidates, grid.width(), grid.height(), cfg.grid_size);
        let descriptor_quality = descriptor_quality(&candidates, keypoint_density);

        let descriptor_score = if keypoints.is_empty() {
            0.0
        } else {
            (0.4 * descriptor_quality.matchability
                + 0.25 * keypoint_distribution.uniformity
                + 0.25 * keypoint_distribution.coverage
                + 0.1 * (100.0 - keypoint_distribution.clustering))
                .clamp(0.0, 100.0)
        };

        debug!(
            keypoints = keypoints.len(),
            density = keypoint_density,
            descriptor_score,
            grid_width = grid.width(),
            grid_height = grid.height(),
            "Features detected"
        );

        Ok(DescriptorAnalysis {
            keypoint_count: keypoints.len(),
            keypoint_density,
            feature_types,
            keypoint_distribution,
            descriptor_quality,
            descriptor_score,
            keypoints,
        })
    }
}

impl PixelAnalyzer for FeatureAnalyzer {
    type Output = DescriptorAnalysis;

    fn stage(&self) -> Stage {
        Stage::Features
    }

    fn analyze(&self, image: &DecodedImage, dispatcher: &ComputeDispatcher) -> Result<DescriptorAnalysis> {
        self.analyze_plane(image.luminance(), dispatcher)
    }
}

fn detection_grid(luma: &Plane, max_edge: usize) -> Plane {
    let long = luma.width().max(luma.height());
    if long <= max_edge {
        return luma.clone();
    }
    let ratio = max_edge as f64 / long as f64;
    let w = ((luma.width() as f64 * ratio).round() as usize).max(1);
    let h = ((luma.height() as f64 * ratio).round() as usize).max(1);
    luma.resize_area(w, h)
}

/// Threshold, suppress non-maxima and keep the strongest `max_per_detector` responses.
/// `scale` and `offset` map response coordinates back to the detection grid.
fn detect(
    response: &Plane,
    floor: f32,
    cfg: &FeatureConfig,
    detector: Detector,
    scale: usize,
    offset: usize,
) -> Vec<Candidate> {
    if response.is_empty() {
        return Vec::new();
    }
    let max = response.max();
    let threshold = floor.max(max * cfg.response_fraction);
    if max <= threshold {
        return Vec::new();
    }

    let mut found = non_max_suppression(response, threshold);
    found.sort_by(|a, b| b.2.total_cmp(&a.2));
    found.truncate(cfg.max_per_detector);

    found
        .into_iter()
        .map(|(x, y, value)| Candidate {
            x: (x + offset) * scale,
            y: (y + offset) * scale,
            response: value,
            strength: value / max,
            detector,
        })
        .collect()
}

/// Local maxima of `response` above `threshold` over a 3x3 neighbourhood. Plateaus keep
/// only their first sample in raster order.
fn non_max_suppression(response: &Plane, threshold: f32) -> Vec<(usize, usize, f32)> {
    let (w, h) = (response.width(), response.height());
    let mut maxima = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let value = response.get(x, y);
            if value <= threshold {
                continue;
            }
            let mut is_max = true;
            'window: for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as isize + dx;
                    let ny = y as isize + dy;
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let neighbour = response.get(nx as usize, ny as usize);
                    let earlier = dy < 0 || (dy == 0 && dx < 0);
                    if neighbour > value || (earlier && neighbour == value) {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                maxima.push((x, y, value));
            }
        }
    }
    maxima
}

/// Classify from the structure tensor eigenvalues at the keypoint
fn classify(gradients: &Gradients, candidate: &Candidate) -> FeatureType {
    if candidate.detector == Detector::Blob {
        return FeatureType::Blob;
    }
    let (w, h) = (gradients.width(), gradients.height());
    if w == 0 || h == 0 {
        return FeatureType::Textured;
    }
    let cx = candidate.x.min(w - 1) as isize;
    let cy = candidate.y.min(h - 1) as isize;

    let (mut sxx, mut syy, mut sxy) = (0.0f32, 0.0f32, 0.0f32);
    for dy in -1..=1 {
        for dx in -1..=1 {
            let gx = gradients.gx.get_clamped(cx + dx, cy + dy);
            let gy = gradients.gy.get_clamped(cx + dx, cy + dy);
            sxx += gx * gx;
            syy += gy * gy;
            sxy += gx * gy;
        }
    }

    let trace = sxx + syy;
    let det = sxx * syy - sxy * sxy;
    let disc = (trace * trace / 4.0 - det).max(0.0).sqrt();
    let major = trace / 2.0 + disc;
    let minor = (trace / 2.0 - disc).max(0.0);
    if major <= f32::EPSILON {
        return FeatureType::Textured;
    }

    let ratio = minor / major;
    if ratio > CORNER_RATIO {
        FeatureType::Corner
    } else if ratio < EDGE_RATIO {
        FeatureType::Edge
    } else {
        FeatureType::Textured
    }
}

/// Uniformity, coverage and clustering of keypoints over an `n x n` grid
fn distribution(candidates: &[Candidate], width: usize, height: usize, n: usize) -> KeypointDistribution {
    let cells = n * n;
    let mut counts = vec![0f64; cells];
    for c in candidates {
        let cx = (c.x * n / width.max(1)).min(n - 1);
        let cy = (c.y * n / height.max(1)).min(n - 1);
        counts[cy * n + cx] += 1.0;
    }

    let mean = counts.iter().sum::<f64>() / cells as f64;
    let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / cells as f64;

    let uniformity = if mean <= 0.0 {
        0.0
    } else {
        (100.0 * (1.0 - variance / (mean * mean * (cells as f64 - 1.0)))).clamp(0.0, 100.0)
    };
    let coverage = counts.iter().filter(|&&c| c > 0.0).count() as f64 * 100.0 / cells as f64;
    let clustering = (morans_i(&counts, n).max(0.0) * 100.0).min(100.0);

    KeypointDistribution {
        grid_size: n,
        uniformity,
        coverage,
        clustering,
    }
}

/// Moran's I of cell counts with rook adjacency
fn morans_i(counts: &[f64], n: usize) -> f64 {
    let cells = counts.len() as f64;
    let mean = counts.iter().sum::<f64>() / cells;
    let denominator: f64 = counts.iter().map(|c| (c - mean).powi(2)).sum();
    if denominator < 1e-12 {
        return 0.0;
    }

    let mut numerator = 0.0;
    let mut weight_sum = 0.0;
    for y in 0..n {
        for x in 0..n {
            let i = y * n + x;
            let neighbours = [
                (x > 0).then(|| i - 1),
                (x + 1 < n).then(|| i + 1),
                (y > 0).then(|| i - n),
                (y + 1 < n).then(|| i + n),
            ];
            for j in neighbours.into_iter().flatten() {
                numerator += (counts[i] - mean) * (counts[j] - mean);
                weight_sum += 1.0;
            }
        }
    }
    if weight_sum == 0.0 {
        return 0.0;
    }
    (cells / weight_sum) * (numerator / denominator)
}

/// Map keypoint density (per thousand pixels) onto 0..100 against reference bands
fn density_score(density: f64) -> f64 {
    if density <= 0.05 {
        0.0
    } else if density <= 0.5 {
        (density - 0.05) / 0.45 * 70.0
    } else if density <= 2.0 {
        70.0 + (density - 0.5) / 1.5 * 30.0
    } else {
        100.0
    }
}

fn descriptor_quality(candidates: &[Candidate], density: f64) -> DescriptorQuality {
    if candidates.is_empty() {
        return DescriptorQuality {
            mean_strength: 0.0,
            strength_std_dev: 0.0,
            matchability: 0.0,
        };
    }
    let n = candidates.len() as f64;
    let mean_strength = candidates.iter().map(|c| c.strength as f64).sum::<f64>() / n;
    let strength_std_dev = (candidates
        .iter()
        .map(|c| (c.strength as f64 - mean_strength).powi(2))
        .sum::<f64>()
        / n)
        .sqrt();

    let strength_score = (mean_strength * 150.0).min(100.0);
    let consistency = if mean_strength > 0.0 {
        100.0 * (1.0 - (strength_std_dev / mean_strength).min(1.0))
    } else {
        0.0
    };
    let matchability =
        (0.5 * density_score(density) + 0.3 * strength_score + 0.2 * consistency).clamp(0.0, 100.0);

    DescriptorQuality {
        mean_strength,
        strength_std_dev,
        matchability,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_dispatch::DispatchConfig;

    fn dispatcher() -> ComputeDispatcher {
        ComputeDispatcher::cpu_only(DispatchConfig::default()).unwrap()
    }

    /// Grid of bright squares on a dark background: strong corners everywhere
    fn squares(size: usize) -> Plane {
        Plane::from_fn(size, size, |x, y| {
            if (x % 40) < 20 && (y % 40) < 20 {
                220.0
            } else {
                30.0
            }
        })
    }

    #[test]
    fn test_flat_gray_has_few_keypoints() {
        let analysis = FeatureAnalyzer::default()
            .analyze_plane(&Plane::filled(400, 400, 128.0), &dispatcher())
            .unwrap();
        assert!(analysis.keypoint_count < 50);
        assert_eq!(analysis.descriptor_score, 0.0);
    }

    #[test]
    fn test_textured_scene_finds_corners() {
        let analysis = FeatureAnalyzer::default()
            .analyze_plane(&squares(400), &dispatcher())
            .unwrap();
        assert!(analysis.keypoint_count > 50, "found {}", analysis.keypoint_count);
        assert!(analysis.feature_types.corners > 0);
        assert_eq!(analysis.keypoint_distribution.coverage, 100.0);
        assert!(analysis.keypoint_distribution.uniformity > 80.0);
        assert!(analysis.descriptor_score > 50.0);
        assert!(analysis.keypoints.iter().all(|k| k.x < 400.0 && k.y < 400.0));
    }

    #[test]
    fn test_detector_caps() {
        let config = FeatureConfig {
            max_per_detector: 5,
            max_keypoints: 12,
            ..FeatureConfig::default()
        };
        let analysis = FeatureAnalyzer::new(config)
            .analyze_plane(&squares(400), &dispatcher())
            .unwrap();
        assert!(analysis.keypoint_count <= 12);
        let harris = analysis.keypoints.iter().filter(|k| k.detector == Detector::Harris).count();
        assert!(harris <= 5);
    }

    #[test]
    fn test_large_input_is_downsampled_for_detection() {
        let plane = squares(1200);
        let analysis = FeatureAnalyzer::default().analyze_plane(&plane, &dispatcher()).unwrap();
        // Coordinates come back in input space
        assert!(analysis.keypoints.iter().any(|k| k.x > 600.0));
        assert!(analysis.keypoints.iter().all(|k| k.x <= 1200.0 && k.y <= 1200.0));
    }

    #[test]
    fn test_too_small_is_stage_error() {
        let result = FeatureAnalyzer::default().analyze_plane(&Plane::filled(6, 6, 0.0), &dispatcher());
        assert!(matches!(result, Err(AnalysisError::Stage { stage: Stage::Features, .. })));
    }

    #[test]
    fn test_non_max_suppression_plateau() {
        let plane = Plane::from_fn(5, 5, |x, y| if (1..=2).contains(&x) && y == 2 { 9.0 } else { 0.0 });
        let maxima = non_max_suppression(&plane, 1.0);
        assert_eq!(maxima, vec![(1, 2, 9.0)]);
    }

    #[test]
    fn test_distribution_extremes() {
        let at = |x, y| Candidate {
            x,
            y,
            response: 1.0,
            strength: 1.0,
            detector: Detector::Harris,
        };

        // One keypoint per cell of a 4x4 grid over 100x100
        let spread: Vec<Candidate> = (0..4)
            .flat_map(|cy| (0..4).map(move |cx| at(cx * 25 + 10, cy * 25 + 10)))
            .collect();
        let even = distribution(&spread, 100, 100, 4);
        assert_eq!(even.uniformity, 100.0);
        assert_eq!(even.coverage, 100.0);
        assert_eq!(even.clustering, 0.0);

        // Everything in one corner cell
        let clumped: Vec<Candidate> = (0..16).map(|_| at(5, 5)).collect();
        let corner = distribution(&clumped, 100, 100, 4);
        assert!(corner.uniformity.abs() < 1e-9);
        assert_eq!(corner.coverage, 6.25);
    }

    #[test]
    fn test_morans_i_detects_clumping() {
        // Left half full, right half empty on a 4x4 grid
        let counts: Vec<f64> = (0..16).map(|i| if i % 4 < 2 { 10.0 } else { 0.0 }).collect();
        assert!(morans_i(&counts, 4) > 0.5);

        // Checkerboard counts are negatively autocorrelated
        let checker: Vec<f64> = (0..16).map(|i| if (i % 4 + i / 4) % 2 == 0 { 10.0 } else { 0.0 }).collect();
        assert!(morans_i(&checker, 4) < 0.0);
    }

    #[test]
    fn test_density_bands_are_monotonic() {
        let mut previous = density_score(0.0);
        for i in 1..300 {
            let score = density_score(i as f64 * 0.01);
            assert!(score >= previous);
            previous = score;
        }
        assert_eq!(density_score(5.0), 100.0);
    }
}
