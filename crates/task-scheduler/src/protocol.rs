//! Messages exchanged between the coordinator and worker threads
//!
//! Every message carries the task id it belongs to, so late or stale replies can be
//! matched (or discarded) without any shared state.

use image_analysis::{ImageAnalysis, ImageInput, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique per scheduler instance, assigned at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Coordinator -> worker
#[derive(Debug)]
pub enum WorkerRequest {
    Analyze { task_id: TaskId, input: ImageInput },
}

/// Worker -> coordinator. A task produces zero or more `Progress` messages with
/// non-decreasing percent, then exactly one `Done` or `Error`.
#[derive(Debug)]
pub enum WorkerResponse {
    Progress { task_id: TaskId, stage: Stage, percent: u8 },
    Done { task_id: TaskId, analysis: Box<ImageAnalysis> },
    Error { task_id: TaskId, message: String },
}

impl WorkerResponse {
    pub fn task_id(&self) -> TaskId {
        match self {
            WorkerResponse::Progress { task_id, .. }
            | WorkerResponse::Done { task_id, .. }
            | WorkerResponse::Error { task_id, .. } => *task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerResponse::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_messages() {
        let progress = WorkerResponse::Progress {
            task_id: TaskId(3),
            stage: Stage::Blur,
            percent: 35,
        };
        let error = WorkerResponse::Error {
            task_id: TaskId(3),
            message: "boom".into(),
        };
        assert!(!progress.is_terminal());
        assert!(error.is_terminal());
        assert_eq!(progress.task_id(), error.task_id());
        assert_eq!(TaskId(3).to_string(), "task-3");
    }
}
