//! Exposure analysis
//!
//! Combines three groups of measurements into `exposure_score`:
//!
//! - **Basic** (40%): clipping, mean placement and usable dynamic range from the
//!   256-bin luminance histogram
//! - **Spatial** (35%): local contrast from block statistics plus how much texture
//!   survives in near-clipped highlights and shadows
//! - **Perceptual** (25%): CIE lightness of the mean and midtone population

use crate::analyzer::PixelAnalyzer;
use crate::config::ExposureConfig;
use crate::error::{AnalysisError, Result};
use crate::model::{ExposureAnalysis, HistogramBalance, Stage};
use crate::pixels::DecodedImage;
use compute_dispatch::{ComputeDispatcher, Plane};

const BASIC_WEIGHT: f64 = 0.40;
const SPATIAL_WEIGHT: f64 = 0.35;
const PERCEPTUAL_WEIGHT: f64 = 0.25;

/// Local contrast (mean block std dev) treated as fully textured
const CONTRAST_REFERENCE: f64 = 25.0;
/// Dynamic range (levels) treated as full range
const RANGE_REFERENCE: f64 = 200.0;

/// 256-bin histogram of luminance values
#[derive(Debug, Clone)]
pub struct Histogram {
    bins: [u64; 256],
    total: u64,
}

impl Histogram {
    pub fn from_plane(plane: &Plane) -> Self {
        let mut bins = [0u64; 256];
        for &v in plane.data() {
            bins[v.round().clamp(0.0, 255.0) as usize] += 1;
        }
        let total = bins.iter().sum();
        Self { bins, total }
    }

    pub fn bins(&self) -> &[u64; 256] {
        &self.bins
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Luminance level at quantile `p` (0.0-1.0)
    pub fn percentile(&self, p: f64) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (i, &count) in self.bins.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return i as u8;
            }
        }
        255
    }

    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let sum: u64 = self.bins.iter().enumerate().map(|(i, &c)| i as u64 * c).sum();
        sum as f64 / self.total as f64
    }

    /// Central moment of order `k`
    fn moment(&self, k: i32) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let mean = self.mean();
        self.bins
            .iter()
            .enumerate()
            .map(|(i, &c)| (i as f64 - mean).powi(k) * c as f64)
            .sum::<f64>()
            / self.total as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.moment(2).sqrt()
    }

    /// Third standardized moment; positive when the mass sits in the shadows
    pub fn skewness(&self) -> f64 {
        let sd = self.std_dev();
        if sd < 1e-9 {
            return 0.0;
        }
        self.moment(3) / sd.powi(3)
    }

    /// Percent of pixels strictly brighter than `level`
    pub fn percent_above(&self, level: u8) -> f64 {
        self.percent_of(self.bins[level as usize + 1..].iter().sum())
    }

    /// Percent of pixels strictly darker than `level`
    pub fn percent_below(&self, level: u8) -> f64 {
        self.percent_of(self.bins[..level as usize].iter().sum())
    }

    /// Percent of pixels within `lo..=hi`
    pub fn percent_within(&self, lo: u8, hi: u8) -> f64 {
        self.percent_of(self.bins[lo as usize..=hi as usize].iter().sum())
    }

    fn percent_of(&self, count: u64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        count as f64 * 100.0 / self.total as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExposureAnalyzer {
    config: ExposureConfig,
}

impl ExposureAnalyzer {
    pub fn new(config: ExposureConfig) -> Self {
        Self { config }
    }

    pub fn analyze_plane(&self, luma: &Plane, dispatcher: &ComputeDispatcher) -> Result<ExposureAnalysis> {
        if luma.is_empty() {
            return Err(AnalysisError::stage(Stage::Exposure, "empty luminance plane"));
        }
        let cfg = &self.config;
        let histogram = Histogram::from_plane(luma);

        let over = histogram.percent_above(cfg.over_threshold);
        let under = histogram.percent_below(cfg.under_threshold);
        let low = histogram.percentile(cfg.tail_fraction);
        let high = histogram.percentile(1.0 - cfg.tail_fraction);
        let dynamic_range = high.saturating_sub(low) as f64;
        let mean = histogram.mean();

        let blocks = dispatcher.block_std_dev(luma, cfg.block_size);
        // Images smaller than one block use their global spread
        let local_contrast = if blocks.is_empty() {
            histogram.std_dev()
        } else {
            blocks.mean()
        };

        let gradients = dispatcher.sobel(luma);
        let magnitude = gradients.magnitude_plane();
        let highlight_recovery = textured_percent(luma, &magnitude, cfg.flat_gradient, |v| {
            v >= cfg.highlight_level as f32
        });
        let shadow_detail = textured_percent(luma, &magnitude, cfg.flat_gradient, |v| {
            v <= cfg.shadow_level as f32
        });

        let clipping_score = (100.0 - 5.0 * (over + under)).clamp(0.0, 100.0);
        let placement_score = (100.0 - (mean - 128.0).abs() / 128.0 * 100.0).clamp(0.0, 100.0);
        let range_score = (dynamic_range / RANGE_REFERENCE * 100.0).min(100.0);
        let basic = 0.4 * clipping_score + 0.3 * placement_score + 0.3 * range_score;

        let contrast_score = (local_contrast / CONTRAST_REFERENCE * 100.0).min(100.0);
        let spatial = 0.6 * contrast_score + 0.4 * (highlight_recovery + shadow_detail) / 2.0;

        let perceptual = perceptual_score(&histogram);

        let exposure_score =
            (BASIC_WEIGHT * basic + SPATIAL_WEIGHT * spatial + PERCEPTUAL_WEIGHT * perceptual).clamp(0.0, 100.0);

        let histogram_balance = classify_balance(&histogram, over, under, dynamic_range);

        Ok(ExposureAnalysis {
            overexposure_percentage: over,
            underexposure_percentage: under,
            dynamic_range,
            local_contrast,
            highlight_recovery,
            shadow_detail,
            mean_luminance: mean,
            perceptual_score: perceptual,
            exposure_score,
            histogram_balance,
            histogram: histogram.bins().to_vec(),
        })
    }
}

impl PixelAnalyzer for ExposureAnalyzer {
    type Output = ExposureAnalysis;

    fn stage(&self) -> Stage {
        Stage::Exposure
    }

    fn analyze(&self, image: &DecodedImage, dispatcher: &ComputeDispatcher) -> Result<ExposureAnalysis> {
        self.analyze_plane(image.luminance(), dispatcher)
    }
}

/// Percent of selected pixels whose gradient exceeds `flat`; 100 when none are selected
fn textured_percent(luma: &Plane, magnitude: &Plane, flat: f32, select: impl Fn(f32) -> bool) -> f64 {
    let mut selected = 0u64;
    let mut textured = 0u64;
    for (&v, &m) in luma.data().iter().zip(magnitude.data()) {
        if select(v) {
            selected += 1;
            if m > flat {
                textured += 1;
            }
        }
    }
    if selected == 0 {
        100.0
    } else {
        textured as f64 * 100.0 / selected as f64
    }
}

/// Human-vision weighted score: CIE L* of the mean near 50 and a populated midtone band
fn perceptual_score(histogram: &Histogram) -> f64 {
    let y = (histogram.mean() / 255.0).powf(2.2);
    let lightness = if y > 0.008856 {
        116.0 * y.cbrt() - 16.0
    } else {
        903.3 * y
    };
    let lightness_score = (100.0 - (lightness - 50.0).abs() * 2.0).clamp(0.0, 100.0);
    let midtones = histogram.percent_within(64, 192);
    0.5 * lightness_score + 0.5 * midtones
}

fn classify_balance(histogram: &Histogram, over: f64, under: f64, dynamic_range: f64) -> HistogramBalance {
    let mean = histogram.mean();
    let spread = histogram.std_dev();
    let skew = histogram.skewness();

    if (over > 2.0 && under > 2.0) || spread > 80.0 {
        HistogramBalance::HighContrast
    } else if under > 5.0 || (mean < 70.0 && skew > 0.5) {
        HistogramBalance::Underexposed
    } else if over > 5.0 || (mean > 185.0 && skew < -0.5) {
        HistogramBalance::Overexposed
    } else if spread < 25.0 || dynamic_range < 80.0 {
        HistogramBalance::LowContrast
    } else {
        HistogramBalance::Balanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_dispatch::DispatchConfig;

    fn dispatcher() -> ComputeDispatcher {
        ComputeDispatcher::cpu_only(DispatchConfig::default()).unwrap()
    }

    fn gradient_plane(lo: f32, hi: f32) -> Plane {
        Plane::from_fn(256, 128, |x, _| lo + (hi - lo) * x as f32 / 255.0)
    }

    #[test]
    fn test_histogram_percentiles() {
        let plane = Plane::from_fn(100, 1, |x, _| x as f32);
        let histogram = Histogram::from_plane(&plane);
        assert_eq!(histogram.total(), 100);
        assert_eq!(histogram.percentile(0.5), 49);
        assert_eq!(histogram.percentile(1.0), 99);
        assert!((histogram.mean() - 49.5).abs() < 1e-9);
    }

    #[test]
    fn test_clipping_percentages() {
        // Left half black, right half white
        let plane = Plane::from_fn(100, 10, |x, _| if x < 50 { 0.0 } else { 255.0 });
        let histogram = Histogram::from_plane(&plane);
        assert_eq!(histogram.percent_above(250), 50.0);
        assert_eq!(histogram.percent_below(5), 50.0);
        assert_eq!(histogram.percent_within(64, 192), 0.0);
    }

    #[test]
    fn test_well_exposed_gradient() {
        let analysis = ExposureAnalyzer::default()
            .analyze_plane(&gradient_plane(20.0, 235.0), &dispatcher())
            .unwrap();
        assert_eq!(analysis.overexposure_percentage, 0.0);
        assert_eq!(analysis.underexposure_percentage, 0.0);
        assert!(analysis.dynamic_range > 200.0);
        assert_eq!(analysis.histogram_balance, HistogramBalance::Balanced);
        assert!((0.0..=100.0).contains(&analysis.exposure_score));
    }

    #[test]
    fn test_dark_image_is_underexposed() {
        let dark = ExposureAnalyzer::default()
            .analyze_plane(&gradient_plane(0.0, 40.0), &dispatcher())
            .unwrap();
        let good = ExposureAnalyzer::default()
            .analyze_plane(&gradient_plane(20.0, 235.0), &dispatcher())
            .unwrap();
        assert!(dark.underexposure_percentage > 5.0);
        assert_eq!(dark.histogram_balance, HistogramBalance::Underexposed);
        assert!(dark.exposure_score < good.exposure_score);
    }

    #[test]
    fn test_bright_image_is_overexposed() {
        let analysis = ExposureAnalyzer::default()
            .analyze_plane(&gradient_plane(215.0, 255.0), &dispatcher())
            .unwrap();
        assert!(analysis.overexposure_percentage > 5.0);
        assert_eq!(analysis.histogram_balance, HistogramBalance::Overexposed);
    }

    #[test]
    fn test_flat_gray_is_low_contrast() {
        let analysis = ExposureAnalyzer::default()
            .analyze_plane(&Plane::filled(64, 64, 128.0), &dispatcher())
            .unwrap();
        assert_eq!(analysis.histogram_balance, HistogramBalance::LowContrast);
        assert_eq!(analysis.local_contrast, 0.0);
        // No near-clipped pixels at all
        assert_eq!(analysis.highlight_recovery, 100.0);
        assert_eq!(analysis.shadow_detail, 100.0);
    }

    #[test]
    fn test_flat_clipped_highlights_have_no_recovery() {
        let plane = Plane::from_fn(64, 64, |x, _| if x < 32 { 120.0 } else { 255.0 });
        let analysis = ExposureAnalyzer::default().analyze_plane(&plane, &dispatcher()).unwrap();
        // Only the boundary column of the white half carries gradient
        assert!(analysis.highlight_recovery < 10.0);
    }

    #[test]
    fn test_black_and_white_is_high_contrast() {
        let plane = Plane::from_fn(100, 10, |x, _| if x < 50 { 0.0 } else { 255.0 });
        let analysis = ExposureAnalyzer::default().analyze_plane(&plane, &dispatcher()).unwrap();
        assert_eq!(analysis.histogram_balance, HistogramBalance::HighContrast);
    }
}
