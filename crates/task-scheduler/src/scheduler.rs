//! Coordinator thread and worker pool
//!
//! One coordinator thread owns every piece of mutable scheduling state: the FIFO queue,
//! the pending-handle map and the worker slot table. Callers and workers only talk to it
//! through an event channel. Each worker slot runs one OS thread with its own request
//! channel; a panic on that thread is reported by a drop guard and the slot is replaced
//! after a backoff.
//!
//! Slot lifecycle: `Idle -> Busy -> Idle`, or `Busy -> Crashed -> Replacing -> Idle`.

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};
use crate::progress::{NoopObserver, ProcessingProgress, ProcessingStep, SchedulerObserver};
use crate::protocol::{TaskId, WorkerRequest, WorkerResponse};
use image_analysis::{ImageAnalysis, ImageInput, ImageProcessor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

type TaskResult = Result<ImageAnalysis, TaskError>;

/// State of one worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "task")]
pub enum SlotState {
    Idle,
    Busy(TaskId),
    Crashed,
    Replacing,
}

enum Event {
    Submit {
        task_id: TaskId,
        input: ImageInput,
        reply: Sender<TaskResult>,
    },
    Clear {
        done: Sender<usize>,
    },
    States {
        reply: Sender<Vec<SlotState>>,
    },
    Worker {
        slot: usize,
        generation: u64,
        response: WorkerResponse,
    },
    Crashed {
        slot: usize,
        generation: u64,
    },
    Respawn {
        slot: usize,
    },
    Shutdown,
}

/// Receiving side of one submitted task
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    receiver: Receiver<TaskResult>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block until the task resolves
    pub fn wait(self) -> TaskResult {
        self.receiver.recv().unwrap_or(Err(TaskError::Disconnected))
    }

    /// `None` if the task is still running after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(TaskError::Disconnected)),
        }
    }

    pub fn try_result(&self) -> Option<TaskResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Disconnected)),
        }
    }
}

/// Fixed pool of analysis workers with crash isolation
pub struct TaskScheduler {
    config: SchedulerConfig,
    events: Sender<Event>,
    progress: Arc<Mutex<ProcessingProgress>>,
    next_id: AtomicU64,
    coordinator: Option<JoinHandle<()>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, processor: Arc<dyn ImageProcessor>) -> Result<Self, SchedulerError> {
        Self::with_observer(config, processor, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: SchedulerConfig,
        processor: Arc<dyn ImageProcessor>,
        observer: Arc<dyn SchedulerObserver>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let (events, inbox) = mpsc::channel();
        let progress = Arc::new(Mutex::new(ProcessingProgress::default()));

        let mut coordinator = Coordinator {
            config: config.clone(),
            processor,
            observer,
            events: events.clone(),
            progress: Arc::clone(&progress),
            slots: Vec::with_capacity(config.workers),
            queue: VecDeque::new(),
            pending: HashMap::new(),
        };
        for slot in 0..config.workers {
            let worker = coordinator.spawn_worker(slot, 0)?;
            coordinator.slots.push(worker);
        }

        let handle = thread::Builder::new()
            .name("task-coordinator".into())
            .spawn(move || coordinator.run(inbox))?;

        info!(workers = config.workers, "Task scheduler started");
        Ok(Self {
            config,
            events,
            progress,
            next_id: AtomicU64::new(1),
            coordinator: Some(handle),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue an image. Tasks start in submission order as workers free up.
    pub fn submit(&self, input: ImageInput) -> Result<TaskHandle, SchedulerError> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply, receiver) = mpsc::channel();
        self.events
            .send(Event::Submit {
                task_id: id,
                input,
                reply,
            })
            .map_err(|_| SchedulerError::Stopped)?;
        Ok(TaskHandle { id, receiver })
    }

    /// Reject every pending handle (queued or in flight) with [`TaskError::Cleared`].
    /// In-flight work is not interrupted; its result is discarded. Returns how many
    /// handles were rejected.
    pub fn clear_queue(&self) -> Result<usize, SchedulerError> {
        let (done, receiver) = mpsc::channel();
        self.events
            .send(Event::Clear { done })
            .map_err(|_| SchedulerError::Stopped)?;
        receiver.recv().map_err(|_| SchedulerError::Stopped)
    }

    pub fn progress(&self) -> ProcessingProgress {
        self.progress.lock().clone()
    }

    pub fn worker_states(&self) -> Result<Vec<SlotState>, SchedulerError> {
        let (reply, receiver) = mpsc::channel();
        self.events
            .send(Event::States { reply })
            .map_err(|_| SchedulerError::Stopped)?;
        receiver.recv().map_err(|_| SchedulerError::Stopped)
    }

    /// Stop accepting work, reject anything unfinished and join all threads
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.coordinator.take() {
            let _ = self.events.send(Event::Shutdown);
            if handle.join().is_err() {
                warn!("Task coordinator panicked during shutdown");
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerSlot {
    generation: u64,
    state: SlotState,
    requests: Option<Sender<WorkerRequest>>,
    thread: Option<JoinHandle<()>>,
}

struct PendingTask {
    reply: Sender<TaskResult>,
    last_percent: u8,
}

struct Coordinator {
    config: SchedulerConfig,
    processor: Arc<dyn ImageProcessor>,
    observer: Arc<dyn SchedulerObserver>,
    events: Sender<Event>,
    progress: Arc<Mutex<ProcessingProgress>>,
    slots: Vec<WorkerSlot>,
    queue: VecDeque<(TaskId, ImageInput)>,
    pending: HashMap<TaskId, PendingTask>,
}

impl Coordinator {
    fn run(mut self, inbox: Receiver<Event>) {
        while let Ok(event) = inbox.recv() {
            match event {
                Event::Submit { task_id, input, reply } => {
                    debug!(%task_id, name = %input.name, "Task queued");
                    self.pending.insert(task_id, PendingTask { reply, last_percent: 0 });
                    self.queue.push_back((task_id, input));
                    self.update_progress(|p| p.task_submitted());
                }
                Event::Clear { done } => {
                    let cleared = self.clear();
                    let _ = done.send(cleared);
                }
                Event::States { reply } => {
                    let _ = reply.send(self.slots.iter().map(|s| s.state).collect());
                }
                Event::Worker { slot, generation, response } => self.on_response(slot, generation, response),
                Event::Crashed { slot, generation } => self.on_crash(slot, generation),
                Event::Respawn { slot } => self.respawn(slot),
                Event::Shutdown => break,
            }
            self.dispatch();
        }
        self.shutdown();
    }

    fn spawn_worker(&self, slot: usize, generation: u64) -> Result<WorkerSlot, SchedulerError> {
        let (requests, inbox) = mpsc::channel();
        let processor = Arc::clone(&self.processor);
        let events = self.events.clone();

        let thread = thread::Builder::new()
            .name(format!("analysis-worker-{}", slot))
            .spawn(move || worker_loop(slot, generation, processor, inbox, events))?;

        debug!(slot, generation, "Worker spawned");
        Ok(WorkerSlot {
            generation,
            state: SlotState::Idle,
            requests: Some(requests),
            thread: Some(thread),
        })
    }

    /// Hand queued tasks to idle workers, oldest first
    fn dispatch(&mut self) {
        for index in 0..self.slots.len() {
            if self.queue.is_empty() {
                return;
            }
            if self.slots[index].state != SlotState::Idle {
                continue;
            }
            let Some(tx) = self.slots[index].requests.as_ref() else {
                continue;
            };
            let Some((task_id, input)) = self.queue.pop_front() else {
                return;
            };

            match tx.send(WorkerRequest::Analyze { task_id, input }) {
                Ok(()) => {
                    debug!(%task_id, slot = index, "Task dispatched");
                    self.slots[index].state = SlotState::Busy(task_id);
                }
                Err(mpsc::SendError(WorkerRequest::Analyze { task_id, input })) => {
                    // Worker thread is gone; keep the task and replace the worker
                    warn!(slot = index, "Worker channel closed, replacing worker");
                    self.queue.push_front((task_id, input));
                    let generation = self.slots[index].generation;
                    self.on_crash(index, generation);
                }
            }
        }
    }

    fn on_response(&mut self, slot: usize, generation: u64, response: WorkerResponse) {
        let current = self.slots.get(slot).is_some_and(|s| s.generation == generation);
        if !current {
            debug!(slot, generation, "Ignoring message from a replaced worker");
            return;
        }
        let task_id = response.task_id();

        if response.is_terminal() && self.slots[slot].state == SlotState::Busy(task_id) {
            self.slots[slot].state = SlotState::Idle;
        }

        match response {
            WorkerResponse::Progress { task_id, stage, percent } => {
                let Some(pending) = self.pending.get_mut(&task_id) else {
                    return;
                };
                if percent < pending.last_percent {
                    return;
                }
                pending.last_percent = percent;
                self.update_progress(|p| p.current_step = ProcessingStep::from(stage));
                self.observer.on_progress(task_id, stage, percent);
            }
            WorkerResponse::Done { task_id, analysis } => self.resolve(task_id, Ok(*analysis)),
            WorkerResponse::Error { task_id, message } => self.resolve(task_id, Err(TaskError::Failed(message))),
        }
    }

    fn resolve(&mut self, task_id: TaskId, result: TaskResult) {
        let Some(pending) = self.pending.remove(&task_id) else {
            debug!(%task_id, "Discarding result of a cleared task");
            return;
        };
        if let Err(e) = &result {
            warn!(%task_id, error = %e, "Task failed");
        }
        self.update_progress(|p| p.task_finished());
        self.observer.on_complete(task_id, &result);
        // The caller may have dropped its handle
        let _ = pending.reply.send(result);
    }

    fn on_crash(&mut self, slot: usize, generation: u64) {
        let Some(worker) = self.slots.get_mut(slot) else {
            return;
        };
        if worker.generation != generation || matches!(worker.state, SlotState::Crashed | SlotState::Replacing) {
            return;
        }

        let lost = match worker.state {
            SlotState::Busy(task_id) => Some(task_id),
            _ => None,
        };
        worker.state = SlotState::Crashed;
        worker.requests = None;
        if let Some(thread) = worker.thread.take() {
            // Thread is unwinding or already finished
            let _ = thread.join();
        }
        warn!(slot, generation, task = ?lost, "Worker crashed");

        if let Some(task_id) = lost {
            self.resolve(task_id, Err(TaskError::WorkerCrashed));
        }
        self.schedule_respawn(slot);
    }

    fn schedule_respawn(&mut self, slot: usize) {
        if let Some(worker) = self.slots.get_mut(slot) {
            worker.state = SlotState::Replacing;
        }
        let events = self.events.clone();
        let backoff = self.config.respawn_backoff();
        let timer = thread::Builder::new()
            .name("worker-respawn".into())
            .spawn(move || {
                thread::sleep(backoff);
                let _ = events.send(Event::Respawn { slot });
            });
        if let Err(e) = timer {
            warn!(slot, error = %e, "Failed to start respawn timer, respawning immediately");
            self.respawn(slot);
        }
    }

    fn respawn(&mut self, slot: usize) {
        let Some(generation) = self.slots.get(slot).map(|s| s.generation + 1) else {
            return;
        };
        if self.slots[slot].state != SlotState::Replacing {
            return;
        }
        match self.spawn_worker(slot, generation) {
            Ok(worker) => {
                info!(slot, generation, "Worker replaced");
                self.slots[slot] = worker;
            }
            Err(e) => {
                warn!(slot, error = %e, "Failed to respawn worker, retrying after backoff");
                self.slots[slot].generation = generation;
                self.schedule_respawn(slot);
            }
        }
    }

    fn clear(&mut self) -> usize {
        self.queue.clear();
        let cleared = self.pending.len();
        for (task_id, pending) in self.pending.drain() {
            debug!(%task_id, "Task cleared");
            let _ = pending.reply.send(Err(TaskError::Cleared));
        }
        self.update_progress(|p| p.tasks_cleared());
        if cleared > 0 {
            info!(cleared, "Queue cleared");
        }
        cleared
    }

    fn update_progress(&self, update: impl FnOnce(&mut ProcessingProgress)) {
        let snapshot = {
            let mut progress = self.progress.lock();
            update(&mut progress);
            progress.clone()
        };
        self.observer.on_batch_progress(&snapshot);
    }

    fn shutdown(&mut self) {
        self.queue.clear();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(TaskError::Shutdown));
        }
        for worker in &mut self.slots {
            worker.requests = None;
        }
        for worker in &mut self.slots {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        info!("Task scheduler stopped");
    }
}

/// Reports a panic on the worker thread to the coordinator
struct CrashGuard {
    slot: usize,
    generation: u64,
    events: Sender<Event>,
}

impl Drop for CrashGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            let _ = self.events.send(Event::Crashed {
                slot: self.slot,
                generation: self.generation,
            });
        }
    }
}

fn worker_loop(
    slot: usize,
    generation: u64,
    processor: Arc<dyn ImageProcessor>,
    inbox: Receiver<WorkerRequest>,
    events: Sender<Event>,
) {
    let _guard = CrashGuard {
        slot,
        generation,
        events: events.clone(),
    };
    let send = |response: WorkerResponse| {
        let _ = events.send(Event::Worker {
            slot,
            generation,
            response,
        });
    };

    for request in inbox {
        match request {
            WorkerRequest::Analyze { task_id, input } => {
                let progress = |stage, percent| send(WorkerResponse::Progress { task_id, stage, percent });
                let response = match processor.process(&input, &progress) {
                    Ok(analysis) => WorkerResponse::Done {
                        task_id,
                        analysis: Box::new(analysis),
                    },
                    Err(e) => WorkerResponse::Error {
                        task_id,
                        message: format!("{:#}", e),
                    },
                };
                send(response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProcessor;

    impl ImageProcessor for EchoProcessor {
        fn process(&self, input: &ImageInput, _: image_analysis::ProgressFn<'_>) -> anyhow::Result<ImageAnalysis> {
            Ok(ImageAnalysis::pending(input))
        }
    }

    #[test]
    fn test_handle_resolves_with_analysis() {
        let scheduler = TaskScheduler::new(SchedulerConfig::default().with_workers(1), Arc::new(EchoProcessor)).unwrap();
        let handle = scheduler.submit(ImageInput::new("one.png", "image/png", vec![1, 2, 3])).unwrap();
        let analysis = handle.wait().unwrap();
        assert_eq!(analysis.name, "one.png");
    }

    /// Records the order in which inputs reach a worker
    #[derive(Default)]
    struct OrderProcessor {
        seen: Mutex<Vec<String>>,
    }

    impl ImageProcessor for OrderProcessor {
        fn process(&self, input: &ImageInput, _: image_analysis::ProgressFn<'_>) -> anyhow::Result<ImageAnalysis> {
            self.seen.lock().push(input.name.clone());
            Ok(ImageAnalysis::pending(input))
        }
    }

    #[test]
    fn test_queued_tasks_dispatched_in_submission_order() {
        let processor = Arc::new(OrderProcessor::default());
        let scheduler = TaskScheduler::new(SchedulerConfig::default().with_workers(1), processor.clone()).unwrap();

        let handles: Vec<_> = (0..5)
            .map(|i| scheduler.submit(ImageInput::new(format!("q-{i}"), "", Vec::new())).unwrap())
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }

        let expected: Vec<_> = (0..5).map(|i| format!("q-{i}")).collect();
        assert_eq!(*processor.seen.lock(), expected);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let scheduler = TaskScheduler::new(SchedulerConfig::default().with_workers(2), Arc::new(EchoProcessor)).unwrap();
        let a = scheduler.submit(ImageInput::new("a", "", Vec::new())).unwrap();
        let b = scheduler.submit(ImageInput::new("b", "", Vec::new())).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_worker_states_reported() {
        let scheduler = TaskScheduler::new(SchedulerConfig::default().with_workers(3), Arc::new(EchoProcessor)).unwrap();
        let states = scheduler.worker_states().unwrap();
        assert_eq!(states, vec![SlotState::Idle; 3]);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = TaskScheduler::new(SchedulerConfig::default().with_workers(0), Arc::new(EchoProcessor));
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }
}
