//! Sharpness from Laplacian variance
//!
//! `blur_score = clamp(ln(variance + 1) * scale, 0, 100)` over the absolute 3x3
//! Laplacian response of the luminance plane. Multi-scale mode repeats the measurement
//! at 1/2 and 1/4 resolution to reduce sensitivity to capture resolution.

use crate::analyzer::PixelAnalyzer;
use crate::config::{BlurConfig, ScaleCombine};
use crate::error::{AnalysisError, Result};
use crate::model::Stage;
use crate::pixels::DecodedImage;
use compute_dispatch::{ComputeDispatcher, Plane};
use tracing::debug;

/// Downsample factors for multi-scale mode (1.0, 0.5, 0.25)
const SCALE_FACTORS: [usize; 3] = [1, 2, 4];

#[derive(Debug, Clone, Default)]
pub struct BlurAnalyzer {
    config: BlurConfig,
}

impl BlurAnalyzer {
    pub fn new(config: BlurConfig) -> Self {
        Self { config }
    }

    /// Score a luminance plane
    pub fn score_plane(&self, luma: &Plane, dispatcher: &ComputeDispatcher) -> Result<f64> {
        let factors: &[usize] = if self.config.multi_scale {
            &SCALE_FACTORS
        } else {
            &SCALE_FACTORS[..1]
        };

        let mut scores = Vec::with_capacity(factors.len());
        for &factor in factors {
            let scaled;
            let plane = if factor == 1 {
                luma
            } else {
                scaled = luma.downsample(factor);
                &scaled
            };

            let response = dispatcher.laplacian(plane);
            if response.is_empty() {
                // Plane smaller than 3x3 at this scale
                continue;
            }
            let variance = response.variance();
            let score = laplacian_score(variance, self.config.scale);
            debug!(factor, variance, score, "Blur scale measured");
            scores.push(score);
        }

        if scores.is_empty() {
            return Err(AnalysisError::stage(
                Stage::Blur,
                format!("image too small for a Laplacian ({}x{})", luma.width(), luma.height()),
            ));
        }

        let combined = match self.config.combine {
            ScaleCombine::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
            ScaleCombine::Min => scores.iter().copied().fold(f64::INFINITY, f64::min),
        };
        Ok(combined)
    }
}

impl PixelAnalyzer for BlurAnalyzer {
    type Output = f64;

    fn stage(&self) -> Stage {
        Stage::Blur
    }

    fn analyze(&self, image: &DecodedImage, dispatcher: &ComputeDispatcher) -> Result<f64> {
        self.score_plane(image.luminance(), dispatcher)
    }
}

/// Map Laplacian variance onto 0..100
pub fn laplacian_score(variance: f64, scale: f64) -> f64 {
    ((variance + 1.0).ln() * scale).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_dispatch::DispatchConfig;

    fn dispatcher() -> ComputeDispatcher {
        ComputeDispatcher::cpu_only(DispatchConfig::default()).unwrap()
    }

    /// 4-px squares alternating black and white
    fn checkerboard(size: usize) -> Plane {
        Plane::from_fn(size, size, |x, y| if (x / 4 + y / 4) % 2 == 0 { 0.0 } else { 255.0 })
    }

    /// Box blur with the given radius, border samples replicated
    fn box_blur(plane: &Plane, radius: isize) -> Plane {
        let n = ((2 * radius + 1) * (2 * radius + 1)) as f32;
        Plane::from_fn(plane.width(), plane.height(), |x, y| {
            let mut sum = 0.0;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    sum += plane.get_clamped(x as isize + dx, y as isize + dy);
                }
            }
            sum / n
        })
    }

    #[test]
    fn test_checkerboard_is_sharp() {
        let score = BlurAnalyzer::default().score_plane(&checkerboard(64), &dispatcher()).unwrap();
        assert!(score > 70.0, "checkerboard scored {score}");
    }

    #[test]
    fn test_box_blur_lowers_score() {
        let analyzer = BlurAnalyzer::default();
        let dispatcher = dispatcher();
        let sharp = checkerboard(64);
        let blurred = box_blur(&sharp, 5);

        let sharp_score = analyzer.score_plane(&sharp, &dispatcher).unwrap();
        let blurred_score = analyzer.score_plane(&blurred, &dispatcher).unwrap();
        assert!(blurred_score < sharp_score, "{blurred_score} !< {sharp_score}");
    }

    #[test]
    fn test_two_px_squares_have_uniform_response() {
        let plane = Plane::from_fn(64, 64, |x, y| if (x / 2 + y / 2) % 2 == 0 { 0.0 } else { 255.0 });
        let score = BlurAnalyzer::default().score_plane(&plane, &dispatcher()).unwrap();
        assert!(score < 1.0, "2-px checkerboard scored {score}");
    }

    #[test]
    fn test_flat_plane_scores_zero() {
        let score = BlurAnalyzer::default()
            .score_plane(&Plane::filled(32, 32, 90.0), &dispatcher())
            .unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_multi_scale_combines() {
        let dispatcher = dispatcher();
        let plane = checkerboard(64);
        let single = BlurAnalyzer::default().score_plane(&plane, &dispatcher).unwrap();

        let min = BlurAnalyzer::new(BlurConfig {
            multi_scale: true,
            combine: ScaleCombine::Min,
            ..BlurConfig::default()
        })
        .score_plane(&plane, &dispatcher)
        .unwrap();
        let mean = BlurAnalyzer::new(BlurConfig {
            multi_scale: true,
            ..BlurConfig::default()
        })
        .score_plane(&plane, &dispatcher)
        .unwrap();

        // Downsampled copies shrink the squares until every pixel sits on an edge and the
        // response becomes uniform
        assert!(min < single);
        assert!(min <= mean);
        assert!(mean <= single);
    }

    #[test]
    fn test_too_small_is_stage_error() {
        let result = BlurAnalyzer::default().score_plane(&Plane::filled(2, 2, 1.0), &dispatcher());
        assert!(matches!(result, Err(AnalysisError::Stage { stage: Stage::Blur, .. })));
    }

    #[test]
    fn test_score_is_clamped() {
        assert_eq!(laplacian_score(0.0, 15.0), 0.0);
        assert_eq!(laplacian_score(1.0e12, 15.0), 100.0);
    }
}
