use thiserror::Error;

/// Why a task handle was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("Worker crashed while processing the task")]
    WorkerCrashed,
    #[error("Task was cleared from the queue")]
    Cleared,
    #[error("Task failed: {0}")]
    Failed(String),
    #[error("Scheduler shut down before the task finished")]
    Shutdown,
    #[error("Scheduler disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Scheduler is no longer running")]
    Stopped,
}
