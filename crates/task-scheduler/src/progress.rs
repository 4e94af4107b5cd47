//! Batch-wide progress and the observer hook for UI integration

use crate::error::TaskError;
use crate::protocol::TaskId;
use chrono::{DateTime, Utc};
use image_analysis::{ImageAnalysis, Stage};
use serde::{Deserialize, Serialize};

/// Coarse step of the batch, driven by the stage of the most recent progress event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    #[default]
    Upload,
    Extract,
    Process,
    Analyze,
    Export,
}

impl From<Stage> for ProcessingStep {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Decode => ProcessingStep::Extract,
            Stage::Blur | Stage::Exposure | Stage::Noise | Stage::Features => ProcessingStep::Process,
            Stage::Metadata | Stage::Scoring => ProcessingStep::Analyze,
        }
    }
}

/// Snapshot of batch progress. Only the scheduler coordinator mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingProgress {
    /// Tasks finished in this batch (success or failure)
    pub current: usize,
    /// Tasks submitted in this batch and not cleared
    pub total: usize,
    pub is_processing: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub current_step: ProcessingStep,
}

impl ProcessingProgress {
    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.current as f64 / self.total as f64) * 100.0
        }
    }

    pub(crate) fn task_submitted(&mut self) {
        if !self.is_processing {
            *self = ProcessingProgress {
                is_processing: true,
                start_time: Some(Utc::now()),
                ..ProcessingProgress::default()
            };
        }
        self.total += 1;
    }

    pub(crate) fn task_finished(&mut self) {
        self.current = (self.current + 1).min(self.total);
        self.settle();
    }

    /// Drop cleared tasks from the batch
    pub(crate) fn tasks_cleared(&mut self) {
        self.total = self.current;
        self.settle();
    }

    fn settle(&mut self) {
        if self.current >= self.total {
            self.is_processing = false;
            self.current_step = ProcessingStep::Export;
        }
    }
}

/// Callbacks invoked on the scheduler's coordinator thread.
///
/// `on_complete` is never called for tasks rejected by `clear_queue`.
pub trait SchedulerObserver: Send + Sync {
    fn on_progress(&self, _task: TaskId, _stage: Stage, _percent: u8) {}

    fn on_complete(&self, _task: TaskId, _result: &Result<ImageAnalysis, TaskError>) {}

    fn on_batch_progress(&self, _progress: &ProcessingProgress) {}
}

/// Observer that ignores every event
pub struct NoopObserver;

impl SchedulerObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_lifecycle() {
        let mut progress = ProcessingProgress::default();
        assert_eq!(progress.completion_percentage(), 100.0);

        progress.task_submitted();
        progress.task_submitted();
        assert!(progress.is_processing);
        assert!(progress.start_time.is_some());
        assert_eq!(progress.completion_percentage(), 0.0);

        progress.task_finished();
        assert_eq!(progress.completion_percentage(), 50.0);
        progress.task_finished();
        assert!(!progress.is_processing);
        assert_eq!(progress.current_step, ProcessingStep::Export);

        // Next submission starts a fresh batch
        progress.task_submitted();
        assert_eq!((progress.current, progress.total), (0, 1));
    }

    #[test]
    fn test_clear_truncates_batch() {
        let mut progress = ProcessingProgress::default();
        for _ in 0..4 {
            progress.task_submitted();
        }
        progress.task_finished();
        progress.tasks_cleared();
        assert_eq!((progress.current, progress.total), (1, 1));
        assert!(!progress.is_processing);
    }

    #[test]
    fn test_step_from_stage() {
        assert_eq!(ProcessingStep::from(Stage::Decode), ProcessingStep::Extract);
        assert_eq!(ProcessingStep::from(Stage::Features), ProcessingStep::Process);
        assert_eq!(ProcessingStep::from(Stage::Scoring), ProcessingStep::Analyze);
    }
}
