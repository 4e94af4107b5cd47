//! Analysis configuration
//!
//! One serde structure carries every tunable the analyzers read. All sections default to
//! the calibrated constants, so a partial TOML file only needs the values it overrides.
//! [`AnalysisConfig::validate`] rejects inconsistent settings instead of repairing them.

use crate::error::{AnalysisError, Result};
use crate::model::{Component, Recommendation, UseCase};
use compute_dispatch::DispatchConfig;
use image::ImageFormat;
use serde::{Deserialize, Serialize};

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub resolution: ResolutionConfig,
    pub limits: LimitsConfig,
    pub blur: BlurConfig,
    pub exposure: ExposureConfig,
    pub noise: NoiseConfig,
    pub features: FeatureConfig,
    pub scoring: ScoringConfig,
    pub dispatch: DispatchConfig,
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        self.resolution.validate()?;
        self.limits.validate()?;
        self.blur.validate()?;
        self.exposure.validate()?;
        self.noise.validate()?;
        self.features.validate()?;
        self.scoring.validate()?;
        self.dispatch
            .validate()
            .map_err(|e| AnalysisError::config(e.0))?;
        Ok(())
    }
}

/// Processing resolution caps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Long edge of the analysis image
    pub max_edge: u32,
    /// Long edge used instead when GPU compute is available for large sources
    pub gpu_max_edge: u32,
    /// Source pixel count above which `gpu_max_edge` applies
    pub gpu_source_pixels: u64,
    pub thumbnail_edge: u32,
    pub thumbnail_quality: u8,
    /// Images with a shorter edge are rejected as degenerate
    pub min_edge: u32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            max_edge: 800,
            gpu_max_edge: 1600,
            gpu_source_pixels: 4_000_000,
            thumbnail_edge: 150,
            thumbnail_quality: 80,
            min_edge: 10,
        }
    }
}

impl ResolutionConfig {
    fn validate(&self) -> Result<()> {
        if self.min_edge == 0 {
            return Err(AnalysisError::config("resolution.min_edge must be positive"));
        }
        if self.max_edge < self.min_edge {
            return Err(AnalysisError::config("resolution.max_edge must be at least min_edge"));
        }
        if self.gpu_max_edge < self.max_edge {
            return Err(AnalysisError::config("resolution.gpu_max_edge must be at least max_edge"));
        }
        if self.thumbnail_edge == 0 {
            return Err(AnalysisError::config("resolution.thumbnail_edge must be positive"));
        }
        if !(1..=100).contains(&self.thumbnail_quality) {
            return Err(AnalysisError::config("resolution.thumbnail_quality must be within 1..=100"));
        }
        Ok(())
    }
}

/// Per-format byte-size limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub jpeg_bytes: u64,
    pub png_bytes: u64,
    pub tiff_bytes: u64,
    pub webp_bytes: u64,
    /// Any other decodable format
    pub other_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        const MB: u64 = 1024 * 1024;
        Self {
            jpeg_bytes: 50 * MB,
            png_bytes: 100 * MB,
            tiff_bytes: 200 * MB,
            webp_bytes: 50 * MB,
            other_bytes: 100 * MB,
        }
    }
}

impl LimitsConfig {
    pub fn limit_for(&self, format: ImageFormat) -> u64 {
        match format {
            ImageFormat::Jpeg => self.jpeg_bytes,
            ImageFormat::Png => self.png_bytes,
            ImageFormat::Tiff => self.tiff_bytes,
            ImageFormat::WebP => self.webp_bytes,
            _ => self.other_bytes,
        }
    }

    fn validate(&self) -> Result<()> {
        let limits = [self.jpeg_bytes, self.png_bytes, self.tiff_bytes, self.webp_bytes, self.other_bytes];
        if limits.iter().any(|&l| l == 0) {
            return Err(AnalysisError::config("limits must all be positive"));
        }
        Ok(())
    }
}

/// How per-scale blur scores are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleCombine {
    #[default]
    Mean,
    Min,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    /// Multiplier applied to `ln(variance + 1)`
    pub scale: f64,
    pub multi_scale: bool,
    pub combine: ScaleCombine,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            scale: 15.0,
            multi_scale: false,
            combine: ScaleCombine::Mean,
        }
    }
}

impl BlurConfig {
    fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(AnalysisError::config("blur.scale must be a positive number"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Block edge for local contrast
    pub block_size: usize,
    /// Luminance above this counts as overexposed
    pub over_threshold: u8,
    /// Luminance below this counts as underexposed
    pub under_threshold: u8,
    /// Near-clipped highlight boundary (inclusive)
    pub highlight_level: u8,
    /// Near-clipped shadow boundary (inclusive)
    pub shadow_level: u8,
    /// Sobel magnitude at or below which a pixel counts as flat
    pub flat_gradient: f32,
    /// Fraction trimmed from each histogram tail for dynamic range
    pub tail_fraction: f64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            over_threshold: 250,
            under_threshold: 5,
            highlight_level: 240,
            shadow_level: 15,
            flat_gradient: 20.0,
            tail_fraction: 0.001,
        }
    }
}

impl ExposureConfig {
    fn validate(&self) -> Result<()> {
        if self.block_size < 2 {
            return Err(AnalysisError::config("exposure.block_size must be at least 2"));
        }
        if self.under_threshold >= self.over_threshold || self.shadow_level >= self.highlight_level {
            return Err(AnalysisError::config("exposure thresholds must be ordered dark < bright"));
        }
        if !(0.0..0.5).contains(&self.tail_fraction) {
            return Err(AnalysisError::config("exposure.tail_fraction must be within [0, 0.5)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub block_size: usize,
    /// Block grid of the compression codec being detected
    pub compression_grid: usize,
    /// Green Sobel magnitude that qualifies an edge for aberration sampling
    pub edge_threshold: f32,
    /// Search radius for red/blue edge offsets
    pub aberration_radius: usize,
    pub max_edge_samples: usize,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            block_size: 8,
            compression_grid: 8,
            edge_threshold: 100.0,
            aberration_radius: 3,
            max_edge_samples: 5000,
        }
    }
}

impl NoiseConfig {
    fn validate(&self) -> Result<()> {
        if self.block_size < 2 || self.compression_grid < 2 {
            return Err(AnalysisError::config("noise block sizes must be at least 2"));
        }
        if self.aberration_radius == 0 || self.max_edge_samples == 0 {
            return Err(AnalysisError::config("noise aberration sampling must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Long edge of the detection grid
    pub detection_edge: u32,
    pub max_keypoints: usize,
    pub max_per_detector: usize,
    /// N for the N x N distribution grid
    pub grid_size: usize,
    pub harris_k: f32,
    /// Absolute Harris response floor
    pub harris_floor: f32,
    /// Absolute Laplacian response floor for blobs
    pub blob_floor: f32,
    /// Responses below this fraction of the detector maximum are dropped
    pub response_fraction: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            detection_edge: 512,
            max_keypoints: 2000,
            max_per_detector: 500,
            grid_size: 4,
            harris_k: 0.04,
            harris_floor: 1.0e8,
            blob_floor: 60.0,
            response_fraction: 0.01,
        }
    }
}

impl FeatureConfig {
    fn validate(&self) -> Result<()> {
        if self.detection_edge < 16 {
            return Err(AnalysisError::config("features.detection_edge must be at least 16"));
        }
        if self.grid_size < 2 {
            return Err(AnalysisError::config("features.grid_size must be at least 2"));
        }
        if self.max_per_detector == 0 || self.max_per_detector > self.max_keypoints {
            return Err(AnalysisError::config(
                "features.max_per_detector must be between 1 and max_keypoints",
            ));
        }
        if !(0.0..1.0).contains(&self.response_fraction) {
            return Err(AnalysisError::config("features.response_fraction must be within [0, 1)"));
        }
        Ok(())
    }
}

/// Composite weights for one use case
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    pub blur: f64,
    pub exposure: f64,
    pub noise: f64,
    pub technical: f64,
    pub descriptor: f64,
}

impl WeightTable {
    pub fn general() -> Self {
        Self {
            blur: 0.30,
            exposure: 0.25,
            noise: 0.20,
            technical: 0.10,
            descriptor: 0.15,
        }
    }

    pub fn photogrammetric() -> Self {
        Self {
            blur: 0.30,
            exposure: 0.20,
            noise: 0.10,
            technical: 0.0,
            descriptor: 0.40,
        }
    }

    pub fn weight(&self, component: Component) -> f64 {
        match component {
            Component::Blur => self.blur,
            Component::Exposure => self.exposure,
            Component::Noise => self.noise,
            Component::Technical => self.technical,
            Component::Descriptor => self.descriptor,
        }
    }

    pub fn sum(&self) -> f64 {
        Component::ALL.iter().map(|&c| self.weight(c)).sum()
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if Component::ALL
            .iter()
            .any(|&c| !self.weight(c).is_finite() || self.weight(c) < 0.0)
        {
            return Err(AnalysisError::config(format!("{name} weights must be non-negative")));
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(AnalysisError::config(format!("{name} weights sum to {sum}, expected 1.0")));
        }
        Ok(())
    }
}

/// Lower bounds of each band, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandThresholds {
    pub excellent: u8,
    pub good: u8,
    pub acceptable: u8,
    pub poor: u8,
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            excellent: 85,
            good: 70,
            acceptable: 55,
            poor: 40,
        }
    }
}

impl BandThresholds {
    pub fn classify(&self, overall: u8) -> Recommendation {
        match overall {
            x if x >= self.excellent => Recommendation::Excellent,
            x if x >= self.good => Recommendation::Good,
            x if x >= self.acceptable => Recommendation::Acceptable,
            x if x >= self.poor => Recommendation::Poor,
            _ => Recommendation::Unsuitable,
        }
    }

    fn validate(&self) -> Result<()> {
        let ordered = self.excellent <= 100
            && self.excellent > self.good
            && self.good > self.acceptable
            && self.acceptable > self.poor;
        if !ordered {
            return Err(AnalysisError::config(
                "band thresholds must be strictly descending and at most 100",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub general: WeightTable,
    pub photogrammetric: WeightTable,
    pub bands: BandThresholds,
    /// Components with at least this weight are critical for downgrades
    pub critical_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            general: WeightTable::general(),
            photogrammetric: WeightTable::photogrammetric(),
            bands: BandThresholds::default(),
            critical_weight: 0.2,
        }
    }
}

impl ScoringConfig {
    pub fn weights(&self, use_case: UseCase) -> &WeightTable {
        match use_case {
            UseCase::General => &self.general,
            UseCase::Photogrammetric => &self.photogrammetric,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.general.validate("general")?;
        self.photogrammetric.validate("photogrammetric")?;
        self.bands.validate()?;
        if !(self.critical_weight > 0.0 && self.critical_weight <= 1.0) {
            return Err(AnalysisError::config("scoring.critical_weight must be within (0, 1]"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AnalysisConfig::default().validate().is_ok());
    }

    #[test]
    fn test_weight_tables_sum_to_one() {
        assert!((WeightTable::general().sum() - 1.0).abs() < 1e-6);
        assert!((WeightTable::photogrammetric().sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unbalanced_weights_rejected() {
        let mut config = AnalysisConfig::default();
        config.scoring.general.blur = 0.5;
        assert!(matches!(config.validate(), Err(AnalysisError::Configuration(_))));
    }

    #[test]
    fn test_band_order_rejected() {
        let mut config = AnalysisConfig::default();
        config.scoring.bands.good = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dispatch_errors_surface_as_configuration() {
        let mut config = AnalysisConfig::default();
        config.dispatch.pool_size = 0;
        assert!(matches!(config.validate(), Err(AnalysisError::Configuration(_))));
    }

    #[test]
    fn test_band_classification_is_monotonic() {
        let bands = BandThresholds::default();
        let mut previous = bands.classify(0).rank();
        for overall in 1..=100u8 {
            let rank = bands.classify(overall).rank();
            assert!(rank >= previous, "band dropped at {overall}");
            previous = rank;
        }
        assert_eq!(bands.classify(85), Recommendation::Excellent);
        assert_eq!(bands.classify(84), Recommendation::Good);
        assert_eq!(bands.classify(39), Recommendation::Unsuitable);
    }

    #[test]
    fn test_limits_per_format() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.limit_for(ImageFormat::Jpeg), limits.jpeg_bytes);
        assert_eq!(limits.limit_for(ImageFormat::Bmp), limits.other_bytes);
    }

    #[test]
    fn test_partial_json_uses_defaults() -> anyhow::Result<()> {
        let config: AnalysisConfig = serde_json::from_str(r#"{"blur": {"multi_scale": true}}"#)?;
        assert!(config.blur.multi_scale);
        assert_eq!(config.blur.scale, 15.0);
        assert_eq!(config.resolution.max_edge, 800);
        Ok(())
    }
}
