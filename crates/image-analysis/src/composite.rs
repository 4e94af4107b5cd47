//! Weighted fusion of component scores into a recommendation
//!
//! Missing components are dropped and the remaining positive weights renormalized. The
//! scorer is a pure function of its inputs and configuration.

use crate::config::{BandThresholds, ScoringConfig};
use crate::error::{AnalysisError, Result};
use crate::model::{Component, CompositeQualityScore, Recommendation, SceneType, UseCase};

/// Confidence before any adjustment
pub const BASE_CONFIDENCE: i32 = 100;

/// Component scores on 0..100; `None` when the stage failed or did not run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComponentScores {
    pub blur: Option<f64>,
    pub exposure: Option<f64>,
    pub noise: Option<f64>,
    pub technical: Option<f64>,
    pub descriptor: Option<f64>,
}

impl ComponentScores {
    pub fn get(&self, component: Component) -> Option<f64> {
        match component {
            Component::Blur => self.blur,
            Component::Exposure => self.exposure,
            Component::Noise => self.noise,
            Component::Technical => self.technical,
            Component::Descriptor => self.descriptor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompositeScorer {
    config: ScoringConfig,
}

impl CompositeScorer {
    /// Create a scorer; invalid weight tables or bands are rejected here
    pub fn new(config: ScoringConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, scores: &ComponentScores, use_case: UseCase, scene: SceneType) -> Result<CompositeQualityScore> {
        let weights = self.config.weights(use_case);

        let weighted: Vec<Component> = Component::ALL
            .iter()
            .copied()
            .filter(|&c| weights.weight(c) > 0.0)
            .collect();
        let present: Vec<(Component, f64, f64)> = weighted
            .iter()
            .filter_map(|&c| scores.get(c).map(|s| (c, s.clamp(0.0, 100.0), weights.weight(c))))
            .collect();
        let missing: Vec<Component> = weighted
            .iter()
            .copied()
            .filter(|&c| scores.get(c).is_none())
            .collect();

        let weight_sum: f64 = present.iter().map(|(_, _, w)| w).sum();
        if present.is_empty() || weight_sum <= 0.0 {
            return Err(AnalysisError::NoComponents);
        }

        let raw = present.iter().map(|(_, s, w)| s * w).sum::<f64>() / weight_sum;
        let overall = raw.round().clamp(0.0, 100.0) as u8;
        let bands = &self.config.bands;
        let band = bands.classify(overall);

        let mut recommendation = band;
        let mut confidence = BASE_CONFIDENCE;
        let mut reasoning = vec![band_reason(overall, band, bands)];

        let lowest_critical = |below: f64| {
            present
                .iter()
                .filter(|(_, s, w)| *w >= self.config.critical_weight && *s < below)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .copied()
        };

        if recommendation == Recommendation::Excellent {
            if let Some((component, value, _)) = lowest_critical(30.0) {
                confidence -= 20;
                recommendation = Recommendation::Good;
                reasoning.push(format!(
                    "Critical component {} scored {:.0}; downgraded from excellent to good",
                    component, value
                ));
            }
        }
        if recommendation == Recommendation::Good {
            if let Some((component, value, _)) = lowest_critical(20.0) {
                confidence -= 25;
                recommendation = Recommendation::Acceptable;
                reasoning.push(format!(
                    "Critical component {} scored {:.0}; downgraded from good to acceptable",
                    component, value
                ));
            }
        }

        let strong: Vec<Component> = present
            .iter()
            .filter(|(_, s, w)| *w >= 0.15 && *s >= 90.0)
            .map(|(c, _, _)| *c)
            .collect();
        if strong.len() >= 2 {
            confidence += 10;
            reasoning.push(format!("{} major components score 90 or above", strong.len()));
        }

        let values: Vec<f64> = present.iter().map(|(_, s, _)| *s).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        if variance > 1000.0 {
            confidence -= 15;
            reasoning.push(format!("Component scores disagree strongly (variance {:.0})", variance));
        } else if variance < 200.0 {
            confidence += 5;
            reasoning.push("Component scores are consistent".to_string());
        }

        match scene {
            SceneType::AerialSky => {
                let exposure = scores.exposure.unwrap_or(100.0);
                let blur = scores.blur.unwrap_or(0.0);
                if exposure < 60.0 && blur > 70.0 {
                    confidence += 5;
                    reasoning.push("Sky-dominated frame: exposure shortfall expected for a sharp aerial".to_string());
                }
            }
            SceneType::GroundDetail => {
                if let Some(descriptor) = scores.descriptor.filter(|&d| d < 50.0) {
                    confidence -= 10;
                    reasoning.push(format!("Ground detail frame with weak features ({:.0})", descriptor));
                }
            }
            SceneType::General => {}
        }

        for component in &missing {
            confidence -= 10;
            reasoning.push(format!("{} score unavailable; weights renormalized", component));
        }

        Ok(CompositeQualityScore {
            blur: scores.blur,
            exposure: scores.exposure,
            noise: scores.noise,
            technical: scores.technical,
            descriptor: scores.descriptor,
            overall,
            band,
            recommendation,
            confidence: confidence.clamp(0, 100) as u8,
            reasoning,
            use_case,
            scene,
            missing_components: missing,
        })
    }
}

fn band_reason(overall: u8, band: Recommendation, bands: &BandThresholds) -> String {
    let bound = match band {
        Recommendation::Excellent => format!(">= {}", bands.excellent),
        Recommendation::Good => format!(">= {}", bands.good),
        Recommendation::Acceptable => format!(">= {}", bands.acceptable),
        Recommendation::Poor => format!(">= {}", bands.poor),
        Recommendation::Unsuitable => format!("< {}", bands.poor),
    };
    format!("Overall score {} is {} ({})", overall, band, bound)
}
