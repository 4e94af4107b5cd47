//! Per-image quality analysis for Aerial QA
//!
//! This crate turns one drone photograph into an [`ImageAnalysis`]: decoded pixels are
//! measured by independent analyzers (blur, exposure, noise, keypoint features), capture
//! metadata is scored, and a composite scorer fuses everything into a recommendation for
//! general use and for photogrammetric reconstruction.
//!
//! # Features
//!
//! - **Isolated stages**: a failing analyzer only removes its own component; the composite
//!   renormalizes over what remains
//! - **Concurrent analyzers**: the four pixel analyzers run in parallel with rayon
//! - **Offloadable kernels**: every heavy kernel goes through a [`ComputeDispatcher`]
//! - **Typed tables**: weights and scene adjustments are selected by [`UseCase`] and
//!   [`SceneType`]
//! - **Snapshots**: [`AnalysisSnapshot`] is a reduced serde view for persistence

pub mod analyzer;
pub mod blur;
pub mod composite;
pub mod config;
pub mod error;
pub mod exposure;
pub mod features;
pub mod metadata;
pub mod model;
pub mod noise;
pub mod pipeline;
pub mod pixels;

pub use analyzer::PixelAnalyzer;
pub use blur::BlurAnalyzer;
pub use composite::{ComponentScores, CompositeScorer};
pub use config::{
    AnalysisConfig, BandThresholds, BlurConfig, ExposureConfig, FeatureConfig, LimitsConfig, NoiseConfig,
    ResolutionConfig, ScaleCombine, ScoringConfig, WeightTable,
};
pub use error::{AnalysisError, Result};
pub use exposure::{ExposureAnalyzer, Histogram};
pub use features::FeatureAnalyzer;
pub use metadata::{assess, parse_exiftool_output, CaptureMetadata, GpsPosition, TechnicalAssessment};
pub use model::{
    AnalysisSnapshot, Component, CompositeQualityScore, DescriptorAnalysis, Dimensions, ExposureAnalysis,
    FeatureType, HistogramBalance, ImageAnalysis, ImageInput, NoiseAnalysis, Recommendation, SceneType,
    Stage, StageError, UseCase,
};
pub use noise::NoiseAnalyzer;
pub use pipeline::{AnalysisPipeline, ImageProcessor, ProgressFn};
pub use pixels::DecodedImage;

pub use compute_dispatch::ComputeDispatcher;

/// Content fingerprint used as the analysis id.
///
/// Hashes the name, byte length and content so the same file always gets the same id.
pub fn fingerprint(name: &str, bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);

    let result = hasher.finalize();
    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        let a = fingerprint("DJI_0001.JPG", b"abc");
        assert_eq!(a, fingerprint("DJI_0001.JPG", b"abc"));
        assert_eq!(a.len(), 32);
        assert_ne!(a, fingerprint("DJI_0002.JPG", b"abc"));
        assert_ne!(a, fingerprint("DJI_0001.JPG", b"abd"));
    }
}
