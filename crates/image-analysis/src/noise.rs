//! Noise and artifact analysis
//!
//! - Sensor noise: mean standard deviation of non-overlapping blocks
//! - Compression: gradient jumps aligned to the codec block grid
//! - Chromatic aberration: red/blue edge offsets around strong green edges
//! - Vignetting: `a + b r^2` least-squares fit of the radial brightness profile

use crate::analyzer::PixelAnalyzer;
use crate::config::NoiseConfig;
use crate::error::{AnalysisError, Result};
use crate::model::{ChromaticAberration, NoiseAnalysis, Stage};
use crate::pixels::DecodedImage;
use compute_dispatch::{ComputeDispatcher, Gradients, Plane};

/// Block std dev at which the noise level reaches ~63
const NOISE_SCALE: f64 = 18.0;
const SNR_CAP_DB: f64 = 100.0;

#[derive(Debug, Clone, Default)]
pub struct NoiseAnalyzer {
    config: NoiseConfig,
}

impl NoiseAnalyzer {
    pub fn new(config: NoiseConfig) -> Self {
        Self { config }
    }
}

impl PixelAnalyzer for NoiseAnalyzer {
    type Output = NoiseAnalysis;

    fn stage(&self) -> Stage {
        Stage::Noise
    }

    fn analyze(&self, image: &DecodedImage, dispatcher: &ComputeDispatcher) -> Result<NoiseAnalysis> {
        let cfg = &self.config;
        let luma = image.luminance();

        let blocks = dispatcher.block_std_dev(luma, cfg.block_size);
        if blocks.is_empty() {
            return Err(AnalysisError::stage(
                Stage::Noise,
                format!(
                    "image {}x{} smaller than one {}px block",
                    luma.width(),
                    luma.height(),
                    cfg.block_size
                ),
            ));
        }
        let raw_standard_deviation = blocks.mean();
        let noise_level = noise_level(raw_standard_deviation);
        let snr_ratio = snr_db(luma.mean(), raw_standard_deviation);

        let blockiness_ratio = blockiness_ratio(luma, cfg.compression_grid);
        let compression_artifacts = ((blockiness_ratio - 1.0) * 100.0).clamp(0.0, 100.0);

        let red = dispatcher.sobel(&image.channel(0));
        let green = dispatcher.sobel(&image.channel(1));
        let blue = dispatcher.sobel(&image.channel(2));
        let mean_shift = channel_misalignment(
            &red,
            &green,
            &blue,
            cfg.edge_threshold,
            cfg.aberration_radius,
            cfg.max_edge_samples,
        );
        let chromatic_aberration = ChromaticAberration {
            mean_shift,
            level: (mean_shift * 50.0).min(100.0),
        };

        let vignetting = vignetting_falloff(luma);

        let overall_artifact_score = (100.0
            - (0.5 * compression_artifacts + 0.3 * chromatic_aberration.level + 0.2 * vignetting * 100.0))
            .clamp(0.0, 100.0);
        let noise_score = (0.8 * (100.0 - noise_level) + 0.2 * overall_artifact_score).clamp(0.0, 100.0);

        Ok(NoiseAnalysis {
            noise_level,
            snr_ratio,
            raw_standard_deviation,
            compression_artifacts,
            blockiness_ratio,
            chromatic_aberration,
            vignetting,
            noise_score,
            overall_artifact_score,
        })
    }
}

/// 0 for a perfectly clean image, approaching 100 as block spread grows
pub fn noise_level(raw_std: f64) -> f64 {
    (100.0 * (1.0 - (-raw_std / NOISE_SCALE).exp())).clamp(0.0, 100.0)
}

/// Signal-to-noise ratio in dB, capped for noiseless input
pub fn snr_db(signal: f64, noise: f64) -> f64 {
    if noise < 1e-9 {
        return SNR_CAP_DB;
    }
    if signal <= 0.0 {
        return 0.0;
    }
    (20.0 * (signal / noise).log10()).clamp(0.0, SNR_CAP_DB)
}

/// Mean absolute neighbour difference across grid boundaries divided by the mean inside
/// blocks. 1.0 means no grid structure.
pub fn blockiness_ratio(luma: &Plane, grid: usize) -> f64 {
    let (w, h) = (luma.width(), luma.height());
    let mut boundary = (0.0f64, 0u64);
    let mut interior = (0.0f64, 0u64);

    let mut add = |position: usize, diff: f32| {
        let slot = if position % grid == 0 { &mut boundary } else { &mut interior };
        slot.0 += diff.abs() as f64;
        slot.1 += 1;
    };

    for y in 0..h {
        let row = luma.row(y);
        for x in 1..w {
            add(x, row[x] - row[x - 1]);
        }
    }
    for y in 1..h {
        let above = luma.row(y - 1);
        let row = luma.row(y);
        for x in 0..w {
            add(y, row[x] - above[x]);
        }
    }

    let boundary_mean = if boundary.1 > 0 { boundary.0 / boundary.1 as f64 } else { 0.0 };
    let interior_mean = if interior.1 > 0 { interior.0 / interior.1 as f64 } else { 0.0 };
    if interior_mean < 1e-6 {
        // Flat interiors: any boundary step at all is pure blocking
        return if boundary_mean < 1e-6 { 1.0 } else { 2.0 };
    }
    boundary_mean / interior_mean
}

/// Mean offset (pixels) between the green edge peak and the red/blue edge peaks, searched
/// along the dominant gradient direction around strong green edges.
fn channel_misalignment(
    red: &Gradients,
    green: &Gradients,
    blue: &Gradients,
    threshold: f32,
    radius: usize,
    max_samples: usize,
) -> f64 {
    let (w, h) = (green.width(), green.height());
    if w <= 2 * radius || h <= 2 * radius {
        return 0.0;
    }

    let candidates = (w - 2 * radius) * (h - 2 * radius);
    let stride = (candidates / max_samples).max(1);
    let r = radius as isize;

    let mut total_shift = 0.0f64;
    let mut samples = 0u64;
    let mut index = 0usize;

    for y in radius..h - radius {
        for x in radius..w - radius {
            index += 1;
            if index % stride != 0 || green.magnitude(x, y) <= threshold {
                continue;
            }
            let horizontal = green.gx.get(x, y).abs() >= green.gy.get(x, y).abs();
            let (dx, dy) = if horizontal { (1, 0) } else { (0, 1) };

            let peak = |g: &Gradients| -> isize {
                let mut best = 0isize;
                let mut best_value = f32::MIN;
                for offset in -r..=r {
                    let sx = (x as isize + offset * dx) as usize;
                    let sy = (y as isize + offset * dy) as usize;
                    let value = g.magnitude(sx, sy);
                    // Ties resolve toward the center
                    if value > best_value || (value == best_value && offset.abs() < best.abs()) {
                        best_value = value;
                        best = offset;
                    }
                }
                best
            };

            let green_peak = peak(green);
            total_shift += (peak(red) - green_peak).unsigned_abs() as f64;
            total_shift += (peak(blue) - green_peak).unsigned_abs() as f64;
            samples += 2;
        }
    }

    if samples == 0 {
        0.0
    } else {
        total_shift / samples as f64
    }
}

/// Fractional brightness falloff from center to corner, from a least-squares fit of
/// `a + b r^2` with `r` normalized to 1 at the corners.
pub fn vignetting_falloff(luma: &Plane) -> f64 {
    let (w, h) = (luma.width(), luma.height());
    if w < 2 || h < 2 {
        return 0.0;
    }
    let cx = (w as f64 - 1.0) / 2.0;
    let cy = (h as f64 - 1.0) / 2.0;
    let max_r2 = cx * cx + cy * cy;
    let step = ((w * h) as f64 / 250_000.0).sqrt().ceil().max(1.0) as usize;

    let (mut n, mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for y in (0..h).step_by(step) {
        for x in (0..w).step_by(step) {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let r2 = (dx * dx + dy * dy) / max_r2;
            let v = luma.get(x, y) as f64;
            n += 1.0;
            sx += r2;
            sy += v;
            sxx += r2 * r2;
            sxy += r2 * v;
        }
    }

    let denom = n * sxx - sx * sx;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    let b = (n * sxy - sx * sy) / denom;
    let a = (sy - b * sx) / n;
    if a <= 1e-6 {
        return 0.0;
    }
    (-b / a).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_dispatch::DispatchConfig;
    use image::{ImageBuffer, Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn dispatcher() -> ComputeDispatcher {
        ComputeDispatcher::cpu_only(DispatchConfig::default()).unwrap()
    }

    fn gray(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> DecodedImage {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            let v = f(x, y);
            Rgb([v, v, v])
        });
        DecodedImage::from_rgb(img)
    }

    /// Standard normal sample (Box-Muller)
    fn gaussian(rng: &mut StdRng) -> f64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    #[test]
    fn test_flat_image_is_clean() {
        let analysis = NoiseAnalyzer::default()
            .analyze(&gray(128, 128, |_, _| 128), &dispatcher())
            .unwrap();
        assert_eq!(analysis.raw_standard_deviation, 0.0);
        assert_eq!(analysis.noise_level, 0.0);
        assert_eq!(analysis.snr_ratio, SNR_CAP_DB);
        assert_eq!(analysis.compression_artifacts, 0.0);
        assert!(analysis.vignetting < 1e-6);
        assert!(analysis.noise_score > 95.0);
    }

    #[test]
    fn test_injected_noise_is_measured() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise: Vec<u8> = (0..256 * 256)
            .map(|_| (128.0 + 40.0 * gaussian(&mut rng)).round().clamp(0.0, 255.0) as u8)
            .collect();
        let image = gray(256, 256, |x, y| noise[(y * 256 + x) as usize]);

        let analysis = NoiseAnalyzer::default().analyze(&image, &dispatcher()).unwrap();
        assert!(
            (35.0..=45.0).contains(&analysis.raw_standard_deviation),
            "raw std {}",
            analysis.raw_standard_deviation
        );
        assert!(analysis.noise_score < 40.0, "noise score {}", analysis.noise_score);
        assert!(analysis.snr_ratio < 20.0);
    }

    #[test]
    fn test_noise_transforms_are_monotonic() {
        let mut previous_level = noise_level(0.0);
        let mut previous_snr = snr_db(128.0, 0.5);
        for i in 1..100 {
            let sigma = i as f64;
            let level = noise_level(sigma);
            let snr = snr_db(128.0, sigma);
            assert!(level > previous_level);
            assert!(snr <= previous_snr);
            previous_level = level;
            previous_snr = snr;
        }
    }

    #[test]
    fn test_block_grid_is_detected() {
        // 8x8 tiles of different flat values, like heavy JPEG blocking
        let plane = Plane::from_fn(64, 64, |x, y| (((x / 8) * 37 + (y / 8) * 53) % 200) as f32);
        assert!(blockiness_ratio(&plane, 8) > 1.5);

        let smooth = Plane::from_fn(64, 64, |x, y| (x + y) as f32);
        assert!((blockiness_ratio(&smooth, 8) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_vignetting_fit() {
        let w = 200usize;
        let h = 100usize;
        let cx = (w as f32 - 1.0) / 2.0;
        let cy = (h as f32 - 1.0) / 2.0;
        let max_r2 = cx * cx + cy * cy;
        // 40% darker at the corners
        let plane = Plane::from_fn(w, h, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            200.0 * (1.0 - 0.4 * (dx * dx + dy * dy) / max_r2)
        });
        let falloff = vignetting_falloff(&plane);
        assert!((falloff - 0.4).abs() < 0.01, "falloff {falloff}");
    }

    #[test]
    fn test_aligned_channels_have_no_aberration() {
        let image = gray(64, 64, |x, _| if x < 32 { 20 } else { 220 });
        let analysis = NoiseAnalyzer::default().analyze(&image, &dispatcher()).unwrap();
        assert_eq!(analysis.chromatic_aberration.mean_shift, 0.0);
    }

    #[test]
    fn test_shifted_red_channel_is_detected() {
        let img: RgbImage = ImageBuffer::from_fn(64, 64, |x, _| {
            let r = if x < 34 { 20 } else { 220 };
            let gb = if x < 32 { 20 } else { 220 };
            Rgb([r, gb, gb])
        });
        let analysis = NoiseAnalyzer::default()
            .analyze(&DecodedImage::from_rgb(img), &dispatcher())
            .unwrap();
        // Red is 2 px off, blue aligned: mean of the two is 1 px
        assert!(analysis.chromatic_aberration.mean_shift > 0.5);
        assert!(analysis.chromatic_aberration.level > 0.0);
    }

    #[test]
    fn test_too_small_is_stage_error() {
        let result = NoiseAnalyzer::default().analyze(&gray(6, 6, |_, _| 0), &dispatcher());
        assert!(matches!(result, Err(AnalysisError::Stage { stage: Stage::Noise, .. })));
    }
}
