use crate::model::Stage;
use thiserror::Error;

/// Errors produced while analyzing a single image
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    /// The bytes could not be turned into pixels; fatal for the image
    #[error("Decode error: {0}")]
    Decode(String),
    /// One metric stage failed; the other stages still run
    #[error("{stage} stage failed: {message}")]
    Stage { stage: Stage, message: String },
    /// Invalid weight table, thresholds or sizes
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("No weighted component scores available")]
    NoComponents,
}

impl AnalysisError {
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        AnalysisError::Stage {
            stage,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        AnalysisError::Configuration(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AnalysisError::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
