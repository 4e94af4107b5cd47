//! Per-image analysis pipeline
//!
//! Decode runs first. The four pixel analyzers then run concurrently on the rayon pool,
//! each isolated so a failure (or panic) only drops its own component. Metadata
//! assessment and composite scoring run last.
//!
//! Progress is reported as `(stage, percent)` and never decreases for one image:
//!
//! | step              | percent          |
//! |-------------------|------------------|
//! | decode start/end  | 5 / 20           |
//! | each analyzer     | +15 (up to 80)   |
//! | metadata          | 85               |
//! | scoring / done    | 95 / 100         |

use crate::analyzer::PixelAnalyzer;
use crate::blur::BlurAnalyzer;
use crate::composite::{ComponentScores, CompositeScorer};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::exposure::ExposureAnalyzer;
use crate::features::FeatureAnalyzer;
use crate::metadata;
use crate::model::{ImageAnalysis, ImageInput, Stage, StageError, UseCase};
use crate::noise::NoiseAnalyzer;
use crate::pixels::{self, DecodedImage};
use compute_dispatch::ComputeDispatcher;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Progress callback: `(stage, percent)`
pub type ProgressFn<'a> = &'a (dyn Fn(Stage, u8) + Sync);

/// Something that can turn one input into a finished analysis.
///
/// The task scheduler runs implementors on its worker threads.
pub trait ImageProcessor: Send + Sync {
    fn process(&self, input: &ImageInput, progress: ProgressFn<'_>) -> anyhow::Result<ImageAnalysis>;
}

/// Non-decreasing progress reporting shared by concurrently finishing analyzers
struct ProgressTracker<'a> {
    callback: ProgressFn<'a>,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    last: u8,
    analyzers_done: u8,
}

impl<'a> ProgressTracker<'a> {
    fn new(callback: ProgressFn<'a>) -> Self {
        Self {
            callback,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn report(&self, stage: Stage, percent: u8) {
        let mut state = self.state.lock();
        if percent > state.last {
            state.last = percent;
            (self.callback)(stage, percent);
        }
    }

    fn analyzer_done(&self, stage: Stage) {
        let mut state = self.state.lock();
        state.analyzers_done += 1;
        let percent = 20 + 15 * state.analyzers_done;
        if percent > state.last {
            state.last = percent;
            (self.callback)(stage, percent);
        }
    }
}

pub struct AnalysisPipeline {
    config: AnalysisConfig,
    dispatcher: Arc<ComputeDispatcher>,
    blur: BlurAnalyzer,
    exposure: ExposureAnalyzer,
    noise: NoiseAnalyzer,
    features: FeatureAnalyzer,
    scorer: CompositeScorer,
    use_case: UseCase,
}

impl AnalysisPipeline {
    /// Pipeline with a CPU-only dispatcher
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        let dispatcher =
            ComputeDispatcher::cpu_only(config.dispatch.clone()).map_err(|e| AnalysisError::config(e.0))?;
        Self::with_dispatcher(config, Arc::new(dispatcher))
    }

    /// Pipeline sharing an existing dispatcher (and its GPU context pool)
    pub fn with_dispatcher(config: AnalysisConfig, dispatcher: Arc<ComputeDispatcher>) -> Result<Self> {
        config.validate()?;
        let scorer = CompositeScorer::new(config.scoring.clone())?;
        Ok(Self {
            blur: BlurAnalyzer::new(config.blur.clone()),
            exposure: ExposureAnalyzer::new(config.exposure.clone()),
            noise: NoiseAnalyzer::new(config.noise.clone()),
            features: FeatureAnalyzer::new(config.features.clone()),
            scorer,
            dispatcher,
            config,
            use_case: UseCase::default(),
        })
    }

    /// Use case selecting the weight table for `composite_score`
    pub fn with_use_case(mut self, use_case: UseCase) -> Self {
        self.use_case = use_case;
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<ComputeDispatcher> {
        &self.dispatcher
    }

    pub fn use_case(&self) -> UseCase {
        self.use_case
    }

    pub fn analyze(&self, input: &ImageInput) -> ImageAnalysis {
        self.analyze_with_progress(input, &|_, _| {})
    }

    /// Run every stage for one image. Never fails: decode errors are recorded in
    /// `error`, stage errors in `stage_errors`.
    pub fn analyze_with_progress(&self, input: &ImageInput, progress: ProgressFn<'_>) -> ImageAnalysis {
        let started = Instant::now();
        let tracker = ProgressTracker::new(progress);
        let mut analysis = ImageAnalysis::pending(input);

        tracker.report(Stage::Decode, 5);
        let decoded = match pixels::decode(
            &input.bytes,
            &input.mime,
            &self.config.resolution,
            &self.config.limits,
            self.dispatcher.gpu_available(),
        ) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(name = %input.name, error = %e, "Failed to decode image");
                analysis.error = Some(e.to_string());
                analysis.processing_duration = started.elapsed();
                tracker.report(Stage::Decode, 100);
                return analysis;
            }
        };
        analysis.source_dimensions = Some(decoded.source_dimensions());
        analysis.analysis_dimensions = Some(decoded.dimensions());
        tracker.report(Stage::Decode, 20);

        let ((blur, exposure), (noise, features)) = rayon::join(
            || {
                rayon::join(
                    || self.run_analyzer(&self.blur, &decoded, &tracker),
                    || self.run_analyzer(&self.exposure, &decoded, &tracker),
                )
            },
            || {
                rayon::join(
                    || self.run_analyzer(&self.noise, &decoded, &tracker),
                    || self.run_analyzer(&self.features, &decoded, &tracker),
                )
            },
        );

        match blur {
            Ok(score) => analysis.blur_score = Some(score),
            Err(e) => record_failure(&mut analysis, Stage::Blur, e),
        }
        match exposure {
            Ok(result) => analysis.exposure_analysis = Some(result),
            Err(e) => record_failure(&mut analysis, Stage::Exposure, e),
        }
        match noise {
            Ok(result) => analysis.noise_analysis = Some(result),
            Err(e) => record_failure(&mut analysis, Stage::Noise, e),
        }
        match features {
            Ok(result) => analysis.descriptor_analysis = Some(result),
            Err(e) => record_failure(&mut analysis, Stage::Features, e),
        }

        let technical = metadata::assess(input.metadata.as_ref());
        let technical_score = technical.technical_score;
        analysis.metadata = Some(technical);
        tracker.report(Stage::Metadata, 85);

        let scores = ComponentScores {
            blur: analysis.blur_score,
            exposure: analysis.exposure_analysis.as_ref().map(|e| e.exposure_score),
            noise: analysis.noise_analysis.as_ref().map(|n| n.noise_score),
            technical: Some(technical_score),
            descriptor: analysis.descriptor_analysis.as_ref().map(|d| d.descriptor_score),
        };
        match self.scorer.score(&scores, self.use_case, input.scene) {
            Ok(composite) => analysis.composite_score = Some(composite),
            Err(e) => record_failure(&mut analysis, Stage::Scoring, e),
        }
        match self.scorer.score(&scores, UseCase::Photogrammetric, input.scene) {
            Ok(composite) => analysis.photogrammetric_score = Some(composite),
            Err(e) => debug!(name = %input.name, error = %e, "No photogrammetric score"),
        }
        tracker.report(Stage::Scoring, 95);

        analysis.thumbnail = Some(decoded.into_thumbnail());
        analysis.processing_duration = started.elapsed();

        info!(
            name = %input.name,
            overall = ?analysis.overall(),
            recommendation = ?analysis.recommendation(),
            failed_stages = analysis.stage_errors.len(),
            duration_ms = analysis.processing_duration.as_millis() as u64,
            "Image analyzed"
        );
        tracker.report(Stage::Scoring, 100);
        analysis
    }

    fn run_analyzer<A: PixelAnalyzer>(
        &self,
        analyzer: &A,
        image: &DecodedImage,
        tracker: &ProgressTracker<'_>,
    ) -> Result<A::Output> {
        let stage = analyzer.stage();
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(image, &self.dispatcher)))
            .unwrap_or_else(|payload| {
                Err(AnalysisError::stage(
                    stage,
                    format!("analyzer panicked: {}", panic_message(payload.as_ref())),
                ))
            });
        debug!(%stage, elapsed_ms = started.elapsed().as_secs_f64() * 1000.0, ok = outcome.is_ok(), "Stage finished");
        tracker.analyzer_done(stage);
        outcome
    }
}

impl ImageProcessor for AnalysisPipeline {
    fn process(&self, input: &ImageInput, progress: ProgressFn<'_>) -> anyhow::Result<ImageAnalysis> {
        Ok(self.analyze_with_progress(input, progress))
    }
}

fn record_failure(analysis: &mut ImageAnalysis, stage: Stage, error: AnalysisError) {
    warn!(name = %analysis.name, %stage, error = %error, "Analysis stage failed");
    let message = match error {
        AnalysisError::Stage { message, .. } => message,
        other => other.to_string(),
    };
    analysis.stage_errors.push(StageError { stage, message });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let v = if (x / 8 + y / 8) % 2 == 0 { 40u8 } else { 210u8 };
            Rgb([v, v.saturating_add(10), v.saturating_sub(10)])
        });
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    struct PanickingAnalyzer;

    impl PixelAnalyzer for PanickingAnalyzer {
        type Output = f64;

        fn stage(&self) -> Stage {
            Stage::Noise
        }

        fn analyze(&self, _: &DecodedImage, _: &ComputeDispatcher) -> Result<f64> {
            panic!("kernel blew up");
        }
    }

    #[test]
    fn test_full_pipeline_fills_every_field() {
        let pipeline = AnalysisPipeline::new(AnalysisConfig::default()).unwrap();
        let input = ImageInput::new("tiles.png", "image/png", png_bytes(256, 192));

        let events = Mutex::new(Vec::new());
        let analysis = pipeline.analyze_with_progress(&input, &|stage, percent| {
            events.lock().push((stage, percent));
        });

        assert!(analysis.error.is_none());
        assert!(analysis.stage_errors.is_empty(), "{:?}", analysis.stage_errors);
        assert!(analysis.blur_score.is_some());
        assert!(analysis.exposure_analysis.is_some());
        assert!(analysis.noise_analysis.is_some());
        assert!(analysis.descriptor_analysis.is_some());
        assert!(analysis.metadata.is_some());
        assert!(analysis.photogrammetric_score.is_some());
        assert!(analysis.thumbnail.as_ref().is_some_and(|t| !t.is_empty()));

        let composite = analysis.composite_score.unwrap();
        assert!(composite.overall <= 100);
        assert_eq!(composite.use_case, UseCase::General);

        let events = events.into_inner();
        assert!(events.windows(2).all(|w| w[0].1 < w[1].1), "{:?}", events);
        assert_eq!(events.first().map(|e| e.1), Some(5));
        assert_eq!(events.last().map(|e| e.1), Some(100));
    }

    #[test]
    fn test_decode_failure_leaves_scores_empty() {
        let pipeline = AnalysisPipeline::new(AnalysisConfig::default()).unwrap();
        let input = ImageInput::new("broken.png", "image/png", b"definitely not a png".to_vec());
        let analysis = pipeline.analyze(&input);

        assert!(analysis.is_failed());
        assert!(analysis.blur_score.is_none());
        assert!(analysis.exposure_analysis.is_none());
        assert!(analysis.composite_score.is_none());
        assert!(analysis.metadata.is_none());
    }

    #[test]
    fn test_panicking_analyzer_becomes_stage_error() {
        let pipeline = AnalysisPipeline::new(AnalysisConfig::default()).unwrap();
        let decoded = DecodedImage::from_rgb(ImageBuffer::from_pixel(16, 16, Rgb([9u8, 9, 9])));
        let tracker = ProgressTracker::new(&|_, _| {});

        let result = pipeline.run_analyzer(&PanickingAnalyzer, &decoded, &tracker);
        match result {
            Err(AnalysisError::Stage { stage, message }) => {
                assert_eq!(stage, Stage::Noise);
                assert!(message.contains("kernel blew up"));
            }
            other => panic!("expected stage error, got {:?}", other),
        }
    }

    #[test]
    fn test_use_case_selects_weights() {
        let pipeline = AnalysisPipeline::new(AnalysisConfig::default())
            .unwrap()
            .with_use_case(UseCase::Photogrammetric);
        let analysis = pipeline.analyze(&ImageInput::new("tiles.png", "image/png", png_bytes(128, 128)));
        let composite = analysis.composite_score.unwrap();
        assert_eq!(composite.use_case, UseCase::Photogrammetric);
        assert_eq!(Some(composite), analysis.photogrammetric_score);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AnalysisConfig::default();
        config.scoring.general.blur = 0.9;
        assert!(matches!(
            AnalysisPipeline::new(config),
            Err(AnalysisError::Configuration(_))
        ));
    }
}
