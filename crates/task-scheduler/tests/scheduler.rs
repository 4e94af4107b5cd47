//! Scheduler behaviour under crashes, cancellation and real pipelines

use image::{ImageBuffer, ImageFormat, Rgb};
use image_analysis::{AnalysisConfig, AnalysisPipeline, ImageAnalysis, ImageInput, ImageProcessor, ProgressFn, Stage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use task_scheduler::{
    SchedulerConfig, SchedulerObserver, SlotState, TaskError, TaskId, TaskScheduler,
};

/// Sleeps, reports a few progress steps and panics on inputs named `boom*`
struct FakeProcessor {
    delay: Duration,
}

impl ImageProcessor for FakeProcessor {
    fn process(&self, input: &ImageInput, progress: ProgressFn<'_>) -> anyhow::Result<ImageAnalysis> {
        progress(Stage::Decode, 10);
        if input.name.starts_with("boom") {
            panic!("simulated worker fault");
        }
        thread::sleep(self.delay);
        progress(Stage::Blur, 50);
        if input.name.starts_with("fail") {
            anyhow::bail!("simulated processing error");
        }
        progress(Stage::Scoring, 100);
        Ok(ImageAnalysis::pending(input))
    }
}

#[derive(Default)]
struct RecordingObserver {
    progress: Mutex<HashMap<TaskId, Vec<u8>>>,
    completed: AtomicUsize,
}

impl SchedulerObserver for RecordingObserver {
    fn on_progress(&self, task: TaskId, _stage: Stage, percent: u8) {
        self.progress.lock().entry(task).or_default().push(percent);
    }

    fn on_complete(&self, _task: TaskId, _result: &Result<ImageAnalysis, TaskError>) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

fn input(name: &str) -> ImageInput {
    ImageInput::new(name, "image/png", vec![0u8; 16])
}

fn scheduler(workers: usize, delay_ms: u64) -> TaskScheduler {
    let config = SchedulerConfig {
        workers,
        respawn_backoff_ms: 20,
    };
    TaskScheduler::new(
        config,
        Arc::new(FakeProcessor {
            delay: Duration::from_millis(delay_ms),
        }),
    )
    .unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_all_tasks_complete() {
    let scheduler = scheduler(2, 5);
    let handles: Vec<_> = (0..6)
        .map(|i| scheduler.submit(input(&format!("img-{i}"))).unwrap())
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let analysis = handle.wait().unwrap();
        assert_eq!(analysis.name, format!("img-{i}"));
    }

    let progress = scheduler.progress();
    assert_eq!(progress.current, 6);
    assert_eq!(progress.total, 6);
    assert!(!progress.is_processing);
    assert_eq!(progress.completion_percentage(), 100.0);
}

#[test]
fn test_processing_error_rejects_only_that_task() {
    let scheduler = scheduler(1, 1);
    let failing = scheduler.submit(input("fail-1")).unwrap();
    let fine = scheduler.submit(input("ok-1")).unwrap();

    match failing.wait() {
        Err(TaskError::Failed(message)) => assert!(message.contains("simulated processing error")),
        other => panic!("expected failure, got {:?}", other.map(|a| a.name)),
    }
    assert!(fine.wait().is_ok());
}

#[test]
fn test_crashed_worker_is_replaced() {
    let scheduler = scheduler(2, 10);
    let crashing = scheduler.submit(input("boom-1")).unwrap();
    let survivor = scheduler.submit(input("ok-1")).unwrap();

    assert_eq!(crashing.wait().unwrap_err(), TaskError::WorkerCrashed);
    assert!(survivor.wait().is_ok());

    wait_for(|| {
        scheduler
            .worker_states()
            .unwrap()
            .iter()
            .all(|s| *s == SlotState::Idle)
    });

    // Work submitted after recovery still completes
    let later: Vec<_> = (0..4)
        .map(|i| scheduler.submit(input(&format!("after-{i}"))).unwrap())
        .collect();
    for handle in later {
        assert!(handle.wait().is_ok());
    }
}

#[test]
fn test_every_worker_crashing_recovers() {
    let scheduler = scheduler(2, 1);
    let crashes: Vec<_> = (0..3)
        .map(|i| scheduler.submit(input(&format!("boom-{i}"))).unwrap())
        .collect();
    for handle in crashes {
        assert_eq!(handle.wait().unwrap_err(), TaskError::WorkerCrashed);
    }
    assert!(scheduler.submit(input("ok")).unwrap().wait().is_ok());
}

#[test]
fn test_clear_queue_rejects_pending_and_suppresses_completion() {
    let observer = Arc::new(RecordingObserver::default());
    let scheduler = TaskScheduler::with_observer(
        SchedulerConfig {
            workers: 1,
            respawn_backoff_ms: 20,
        },
        Arc::new(FakeProcessor {
            delay: Duration::from_millis(200),
        }),
        observer.clone(),
    )
    .unwrap();

    let handles: Vec<_> = (0..3)
        .map(|i| scheduler.submit(input(&format!("slow-{i}"))).unwrap())
        .collect();
    // First task is in flight once the worker reports busy
    wait_for(|| matches!(scheduler.worker_states().unwrap()[0], SlotState::Busy(_)));

    assert_eq!(scheduler.clear_queue().unwrap(), 3);
    for handle in handles {
        assert_eq!(handle.wait().unwrap_err(), TaskError::Cleared);
    }

    // A fresh task runs once the discarded in-flight task has drained
    let after = scheduler.submit(input("after-clear")).unwrap();
    assert!(after.wait().is_ok());
    assert_eq!(observer.completed.load(Ordering::SeqCst), 1);

    let progress = scheduler.progress();
    assert_eq!((progress.current, progress.total), (1, 1));
}

#[test]
fn test_progress_is_non_decreasing_per_task() {
    let observer = Arc::new(RecordingObserver::default());
    let scheduler = TaskScheduler::with_observer(
        SchedulerConfig {
            workers: 3,
            respawn_backoff_ms: 20,
        },
        Arc::new(FakeProcessor {
            delay: Duration::from_millis(2),
        }),
        observer.clone(),
    )
    .unwrap();

    let handles: Vec<_> = (0..9)
        .map(|i| scheduler.submit(input(&format!("p-{i}"))).unwrap())
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }

    let progress = observer.progress.lock();
    assert_eq!(progress.len(), 9);
    for percents in progress.values() {
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert_eq!(percents.last(), Some(&100));
    }
}

#[test]
fn test_real_pipeline_through_scheduler() {
    let pipeline = AnalysisPipeline::new(AnalysisConfig::default()).unwrap();
    let scheduler = TaskScheduler::new(SchedulerConfig::default().with_workers(2), Arc::new(pipeline)).unwrap();

    let img = ImageBuffer::from_fn(160, 120, |x, y| {
        let v = ((x * 7 + y * 13) % 256) as u8;
        Rgb([v, v, v])
    });
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();

    let good = scheduler.submit(ImageInput::new("gradient.png", "image/png", bytes)).unwrap();
    let bad = scheduler
        .submit(ImageInput::new("garbage.png", "image/png", b"not an image".to_vec()))
        .unwrap();

    let good = good.wait().unwrap();
    assert!(good.composite_score.is_some());

    // Decode failures are part of the analysis, not a task error
    let bad = bad.wait().unwrap();
    assert!(bad.is_failed());
}
