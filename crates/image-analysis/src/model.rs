//! Records produced by the analysis pipeline
//!
//! [`ImageAnalysis`] is the single output of the core. Each analyzer stage fills exactly
//! one of its fields; presentation and persistence layers consume it (or the reduced
//! [`AnalysisSnapshot`]) and never hand it back.

use crate::metadata::{CaptureMetadata, TechnicalAssessment};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Weight table selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    #[default]
    General,
    Photogrammetric,
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UseCase::General => write!(f, "general"),
            UseCase::Photogrammetric => write!(f, "photogrammetric"),
        }
    }
}

impl FromStr for UseCase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "general" => Ok(UseCase::General),
            "photogrammetric" | "photogrammetry" => Ok(UseCase::Photogrammetric),
            _ => bail!("Invalid use case: {}. Valid options: general, photogrammetric", s),
        }
    }
}

/// Capture context used for confidence adjustments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneType {
    #[default]
    General,
    AerialSky,
    GroundDetail,
}

impl fmt::Display for SceneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneType::General => write!(f, "general"),
            SceneType::AerialSky => write!(f, "aerial_sky"),
            SceneType::GroundDetail => write!(f, "ground_detail"),
        }
    }
}

impl FromStr for SceneType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "general" => Ok(SceneType::General),
            "aerial_sky" | "sky" => Ok(SceneType::AerialSky),
            "ground_detail" | "ground" => Ok(SceneType::GroundDetail),
            _ => bail!("Invalid scene type: {}. Valid options: general, aerial_sky, ground_detail", s),
        }
    }
}

/// Discrete quality band, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Unsuitable,
}

impl Recommendation {
    /// 4 for excellent down to 0 for unsuitable
    pub fn rank(&self) -> u8 {
        match self {
            Recommendation::Excellent => 4,
            Recommendation::Good => 3,
            Recommendation::Acceptable => 2,
            Recommendation::Poor => 1,
            Recommendation::Unsuitable => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Excellent => "excellent",
            Recommendation::Good => "good",
            Recommendation::Acceptable => "acceptable",
            Recommendation::Poor => "poor",
            Recommendation::Unsuitable => "unsuitable",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite score inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Blur,
    Exposure,
    Noise,
    Technical,
    Descriptor,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Blur,
        Component::Exposure,
        Component::Noise,
        Component::Technical,
        Component::Descriptor,
    ];
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Blur => write!(f, "blur"),
            Component::Exposure => write!(f, "exposure"),
            Component::Noise => write!(f, "noise"),
            Component::Technical => write!(f, "technical"),
            Component::Descriptor => write!(f, "descriptor"),
        }
    }
}

/// Pipeline stages, in the order progress is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Blur,
    Exposure,
    Noise,
    Features,
    Metadata,
    Scoring,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decode => "decode",
            Stage::Blur => "blur",
            Stage::Exposure => "exposure",
            Stage::Noise => "noise",
            Stage::Features => "features",
            Stage::Metadata => "metadata",
            Stage::Scoring => "scoring",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramBalance {
    Balanced,
    Underexposed,
    Overexposed,
    HighContrast,
    LowContrast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Reference back to the submitted file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: Option<PathBuf>,
    pub mime: String,
}

/// One file submitted for analysis
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub path: Option<PathBuf>,
    pub metadata: Option<CaptureMetadata>,
    pub scene: SceneType,
}

impl ImageInput {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes,
            path: None,
            metadata: None,
            scene: SceneType::General,
        }
    }

    /// Read a file from disk, taking the MIME type from its extension
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let mime = crate::pixels::mime_for_path(path);
        Ok(Self::new(name, mime, bytes).with_path(path.to_path_buf()))
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_metadata(mut self, metadata: CaptureMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_scene(mut self, scene: SceneType) -> Self {
        self.scene = scene;
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Histogram, clipping and tonal metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureAnalysis {
    /// Percent of pixels brighter than the overexposure threshold
    pub overexposure_percentage: f64,
    /// Percent of pixels darker than the underexposure threshold
    pub underexposure_percentage: f64,
    /// Levels between the 0.1th and 99.9th percentiles
    pub dynamic_range: f64,
    /// Mean per-block standard deviation
    pub local_contrast: f64,
    /// Percent of near-white pixels that still carry gradient
    pub highlight_recovery: f64,
    /// Percent of near-black pixels that still carry gradient
    pub shadow_detail: f64,
    pub mean_luminance: f64,
    pub perceptual_score: f64,
    pub exposure_score: f64,
    pub histogram_balance: HistogramBalance,
    pub histogram: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChromaticAberration {
    /// Mean red/blue edge offset from the green edge, in pixels
    pub mean_shift: f64,
    pub level: f64,
}

/// Noise and artifact metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseAnalysis {
    /// 0..100, lower is cleaner
    pub noise_level: f64,
    /// Decibels
    pub snr_ratio: f64,
    /// Mean per-block standard deviation
    pub raw_standard_deviation: f64,
    /// 0..100 blockiness level derived from `blockiness_ratio`
    pub compression_artifacts: f64,
    /// Mean gradient across grid boundaries over mean gradient inside blocks
    pub blockiness_ratio: f64,
    pub chromatic_aberration: ChromaticAberration,
    /// Fractional corner brightness falloff, 0..1
    pub vignetting: f64,
    pub noise_score: f64,
    /// Higher means fewer artifacts
    pub overall_artifact_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Corner,
    Edge,
    Blob,
    Textured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    Harris,
    HarrisHalf,
    Blob,
}

/// A detected keypoint in analysis-image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub response: f32,
    /// Response relative to the strongest response of the same detector
    pub strength: f32,
    pub detector: Detector,
    pub kind: FeatureType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTypeCounts {
    pub corners: usize,
    pub edges: usize,
    pub blobs: usize,
    pub textured: usize,
}

impl FeatureTypeCounts {
    pub fn add(&mut self, kind: FeatureType) {
        match kind {
            FeatureType::Corner => self.corners += 1,
            FeatureType::Edge => self.edges += 1,
            FeatureType::Blob => self.blobs += 1,
            FeatureType::Textured => self.textured += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeypointDistribution {
    pub grid_size: usize,
    pub uniformity: f64,
    pub coverage: f64,
    /// Spatial autocorrelation of cell counts mapped to 0..100; lower is better
    pub clustering: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DescriptorQuality {
    pub mean_strength: f64,
    pub strength_std_dev: f64,
    pub matchability: f64,
}

/// Keypoint-based matchability assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorAnalysis {
    pub keypoint_count: usize,
    /// Keypoints per thousand analysis pixels
    pub keypoint_density: f64,
    pub feature_types: FeatureTypeCounts,
    pub keypoint_distribution: KeypointDistribution,
    pub descriptor_quality: DescriptorQuality,
    pub descriptor_score: f64,
    pub keypoints: Vec<Keypoint>,
}

/// Fused score with band, confidence and rationale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeQualityScore {
    pub blur: Option<f64>,
    pub exposure: Option<f64>,
    pub noise: Option<f64>,
    pub technical: Option<f64>,
    pub descriptor: Option<f64>,
    /// Integer in 0..=100
    pub overall: u8,
    /// Classification of `overall` alone
    pub band: Recommendation,
    /// `band` after confidence downgrades
    pub recommendation: Recommendation,
    /// 0..=100
    pub confidence: u8,
    pub reasoning: Vec<String>,
    pub use_case: UseCase,
    pub scene: SceneType,
    /// Weighted components that were absent and renormalized away
    pub missing_components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

/// Everything the pipeline learned about one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
    pub source: SourceRef,
    pub source_dimensions: Option<Dimensions>,
    pub analysis_dimensions: Option<Dimensions>,
    pub blur_score: Option<f64>,
    pub exposure_analysis: Option<ExposureAnalysis>,
    pub noise_analysis: Option<NoiseAnalysis>,
    pub descriptor_analysis: Option<DescriptorAnalysis>,
    pub metadata: Option<TechnicalAssessment>,
    pub composite_score: Option<CompositeQualityScore>,
    pub photogrammetric_score: Option<CompositeQualityScore>,
    pub processing_duration: Duration,
    pub error: Option<String>,
    pub stage_errors: Vec<StageError>,
    pub analyzed_at: DateTime<Utc>,
}

impl ImageAnalysis {
    /// Empty record for a file entering the pipeline
    pub fn pending(input: &ImageInput) -> Self {
        Self {
            id: crate::fingerprint(&input.name, &input.bytes),
            name: input.name.clone(),
            size: input.size(),
            thumbnail: None,
            source: SourceRef {
                path: input.path.clone(),
                mime: input.mime.clone(),
            },
            source_dimensions: None,
            analysis_dimensions: None,
            blur_score: None,
            exposure_analysis: None,
            noise_analysis: None,
            descriptor_analysis: None,
            metadata: None,
            composite_score: None,
            photogrammetric_score: None,
            processing_duration: Duration::ZERO,
            error: None,
            stage_errors: Vec::new(),
            analyzed_at: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn overall(&self) -> Option<u8> {
        self.composite_score.as_ref().map(|c| c.overall)
    }

    pub fn recommendation(&self) -> Option<Recommendation> {
        self.composite_score.as_ref().map(|c| c.recommendation)
    }

    /// Band of the photogrammetric composite
    pub fn reconstruction_suitability(&self) -> Option<Recommendation> {
        self.photogrammetric_score.as_ref().map(|c| c.recommendation)
    }

    /// Reduced view for persistence: no thumbnail, keypoints or raw bytes
    pub fn snapshot(&self) -> AnalysisSnapshot {
        AnalysisSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            source: self.source.clone(),
            source_dimensions: self.source_dimensions,
            analysis_dimensions: self.analysis_dimensions,
            blur_score: self.blur_score,
            exposure: self.exposure_analysis.as_ref().map(|e| ExposureAnalysis {
                histogram: Vec::new(),
                ..e.clone()
            }),
            noise: self.noise_analysis.clone(),
            descriptor: self.descriptor_analysis.as_ref().map(|d| DescriptorSummary {
                keypoint_count: d.keypoint_count,
                keypoint_density: d.keypoint_density,
                feature_types: d.feature_types,
                keypoint_distribution: d.keypoint_distribution,
                descriptor_quality: d.descriptor_quality,
                descriptor_score: d.descriptor_score,
            }),
            technical: self.metadata.clone(),
            composite: self.composite_score.clone(),
            photogrammetric: self.photogrammetric_score.clone(),
            processing_ms: self.processing_duration.as_secs_f64() * 1000.0,
            error: self.error.clone(),
            stage_errors: self.stage_errors.clone(),
            analyzed_at: self.analyzed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSummary {
    pub keypoint_count: usize,
    pub keypoint_density: f64,
    pub feature_types: FeatureTypeCounts,
    pub keypoint_distribution: KeypointDistribution,
    pub descriptor_quality: DescriptorQuality,
    pub descriptor_score: f64,
}

/// Serializable, reduced copy of an [`ImageAnalysis`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub source: SourceRef,
    pub source_dimensions: Option<Dimensions>,
    pub analysis_dimensions: Option<Dimensions>,
    pub blur_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure: Option<ExposureAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise: Option<NoiseAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<DescriptorSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical: Option<TechnicalAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeQualityScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photogrammetric: Option<CompositeQualityScore>,
    pub processing_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_errors: Vec<StageError>,
    pub analyzed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_use_case_parsing() {
        assert_eq!("general".parse::<UseCase>().unwrap(), UseCase::General);
        assert_eq!("Photogrammetric".parse::<UseCase>().unwrap(), UseCase::Photogrammetric);
        assert!("mapping".parse::<UseCase>().is_err());
    }

    #[test]
    fn test_scene_parsing() {
        assert_eq!("aerial-sky".parse::<SceneType>().unwrap(), SceneType::AerialSky);
        assert_eq!("ground_detail".parse::<SceneType>().unwrap(), SceneType::GroundDetail);
        assert_eq!(SceneType::AerialSky.to_string(), "aerial_sky");
    }

    #[test]
    fn test_recommendation_rank_order() {
        let bands = [
            Recommendation::Unsuitable,
            Recommendation::Poor,
            Recommendation::Acceptable,
            Recommendation::Good,
            Recommendation::Excellent,
        ];
        assert!(bands.windows(2).all(|w| w[0].rank() < w[1].rank()));
    }

    #[test]
    fn test_pending_record_is_empty() {
        let input = ImageInput::new("a.jpg", "image/jpeg", vec![1, 2, 3]);
        let analysis = ImageAnalysis::pending(&input);
        assert_eq!(analysis.size, 3);
        assert_eq!(analysis.id.len(), 32);
        assert!(analysis.blur_score.is_none());
        assert!(analysis.composite_score.is_none());
        assert!(!analysis.is_failed());
    }

    #[test]
    fn test_snapshot_serializes_without_thumbnail() -> anyhow::Result<()> {
        let input = ImageInput::new("a.jpg", "image/jpeg", vec![1, 2, 3]);
        let mut analysis = ImageAnalysis::pending(&input);
        analysis.thumbnail = Some(vec![0xFF; 64]);
        analysis.error = Some("Decode error: truncated".into());

        let json = serde_json::to_value(analysis.snapshot())?;
        assert!(json.get("thumbnail").is_none());
        assert_eq!(json["error"], "Decode error: truncated");
        assert_eq!(json["name"], "a.jpg");
        Ok(())
    }
}
