//! Per-call GPU/CPU routing with transparent fallback

use crate::backend::{GpuBackend, GpuCapabilities, GpuContext, GpuError};
use crate::benchmark::{BenchmarkHistory, BenchmarkSample, Operation, PerformanceReport};
use crate::kernels::cpu;
use crate::plane::{Gradients, Plane};
use crate::pool::{IdleReaper, PoolConfig, PoolError, PoolStats, ResourcePool};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Dispatcher tuning; every field has a calibrated default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Planes smaller than this always run on the CPU
    pub min_gpu_pixels: usize,
    /// Maximum number of live GPU contexts
    pub pool_size: usize,
    pub idle_timeout_ms: u64,
    /// How long a dispatch waits for a context before falling back to the CPU
    pub checkout_timeout_ms: u64,
    pub reaper_interval_ms: u64,
    pub history_capacity: usize,
    /// Every Nth GPU dispatch of an operation (and the first) also times the CPU path
    pub calibration_interval: u32,
    /// GPU is dropped for the session once the recent mean speedup falls below this
    pub min_speedup: f64,
    /// Number of measured speedups averaged for the deprioritization check
    pub speedup_window: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_gpu_pixels: 100_000,
            pool_size: 3,
            idle_timeout_ms: 30_000,
            checkout_timeout_ms: 2_000,
            reaper_interval_ms: 5_000,
            history_capacity: 100,
            calibration_interval: 10,
            min_speedup: 1.5,
            speedup_window: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Invalid dispatch configuration: {0}")]
pub struct InvalidDispatchConfig(pub String);

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), InvalidDispatchConfig> {
        if self.pool_size == 0 {
            return Err(InvalidDispatchConfig("pool_size must be at least 1".into()));
        }
        if self.history_capacity == 0 {
            return Err(InvalidDispatchConfig("history_capacity must be at least 1".into()));
        }
        if self.calibration_interval == 0 {
            return Err(InvalidDispatchConfig("calibration_interval must be at least 1".into()));
        }
        if self.speedup_window == 0 || self.speedup_window > self.history_capacity {
            return Err(InvalidDispatchConfig(format!(
                "speedup_window must be between 1 and history_capacity ({})",
                self.history_capacity
            )));
        }
        if !self.min_speedup.is_finite() || self.min_speedup < 0.0 {
            return Err(InvalidDispatchConfig("min_speedup must be a non-negative number".into()));
        }
        if self.reaper_interval_ms == 0 {
            return Err(InvalidDispatchConfig("reaper_interval_ms must be positive".into()));
        }
        Ok(())
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_size,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            checkout_timeout: Some(Duration::from_millis(self.checkout_timeout_ms)),
        }
    }
}

struct GpuRuntime {
    backend: Arc<dyn GpuBackend>,
    capabilities: GpuCapabilities,
    pool: Arc<ResourcePool<Box<dyn GpuContext>>>,
    _reaper: Option<IdleReaper>,
}

/// Routes each kernel call to the GPU backend or the CPU implementation.
///
/// Callers never see a GPU failure: the CPU result is returned instead. All timing data
/// stays with this instance.
pub struct ComputeDispatcher {
    config: DispatchConfig,
    gpu: Option<GpuRuntime>,
    history: Mutex<BenchmarkHistory>,
    deprioritized: AtomicBool,
    gpu_dispatches: [AtomicU32; 4],
}

impl ComputeDispatcher {
    pub fn cpu_only(config: DispatchConfig) -> Result<Self, InvalidDispatchConfig> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// Attach a backend. A backend that reports no device yields a CPU-only dispatcher.
    pub fn with_backend(
        config: DispatchConfig,
        backend: Arc<dyn GpuBackend>,
    ) -> Result<Self, InvalidDispatchConfig> {
        config.validate()?;

        let Some(capabilities) = backend.capabilities() else {
            info!(backend = backend.name(), "GPU backend reports no device, using CPU kernels");
            return Ok(Self::build(config, None));
        };

        let pool = Arc::new(ResourcePool::new(config.pool_config()));
        let reaper = match IdleReaper::spawn(&pool, Duration::from_millis(config.reaper_interval_ms)) {
            Ok(reaper) => Some(reaper),
            Err(e) => {
                warn!(error = %e, "Failed to start GPU context reaper, relying on on-access eviction");
                None
            }
        };

        info!(
            backend = backend.name(),
            device = %capabilities.name,
            max_texture_size = capabilities.max_texture_size,
            pool_size = config.pool_size,
            "GPU compute enabled"
        );

        let runtime = GpuRuntime {
            backend,
            capabilities,
            pool,
            _reaper: reaper,
        };
        Ok(Self::build(config, Some(runtime)))
    }

    fn build(config: DispatchConfig, gpu: Option<GpuRuntime>) -> Self {
        let history = Mutex::new(BenchmarkHistory::new(config.history_capacity));
        Self {
            config,
            gpu,
            history,
            deprioritized: AtomicBool::new(false),
            gpu_dispatches: Default::default(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Whether a usable GPU backend is attached and still in use for this session
    pub fn gpu_available(&self) -> bool {
        self.gpu.is_some() && !self.is_gpu_deprioritized()
    }

    pub fn gpu_capabilities(&self) -> Option<&GpuCapabilities> {
        self.gpu.as_ref().map(|g| &g.capabilities)
    }

    pub fn is_gpu_deprioritized(&self) -> bool {
        self.deprioritized.load(Ordering::Relaxed)
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.gpu.as_ref().map(|g| g.pool.stats())
    }

    pub fn benchmark_history(&self) -> Vec<BenchmarkSample> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.history.lock().report(self.is_gpu_deprioritized())
    }

    pub fn laplacian(&self, plane: &Plane) -> Plane {
        self.dispatch(
            Operation::Laplacian,
            plane.width(),
            plane.height(),
            |ctx| ctx.laplacian(plane),
            || cpu::laplacian(plane),
        )
    }

    pub fn sobel(&self, plane: &Plane) -> Gradients {
        self.dispatch(
            Operation::Sobel,
            plane.width(),
            plane.height(),
            |ctx| ctx.sobel(plane),
            || cpu::sobel(plane),
        )
    }

    pub fn block_std_dev(&self, plane: &Plane, block: usize) -> Plane {
        self.dispatch(
            Operation::BlockStdDev,
            plane.width(),
            plane.height(),
            |ctx| ctx.block_std_dev(plane, block),
            || cpu::block_std_dev(plane, block),
        )
    }

    pub fn harris_response(&self, gradients: &Gradients, k: f32) -> Plane {
        self.dispatch(
            Operation::HarrisResponse,
            gradients.width(),
            gradients.height(),
            |ctx| ctx.harris_response(gradients, k),
            || cpu::harris_response(gradients, k),
        )
    }

    fn gpu_for(&self, width: usize, height: usize) -> Option<&GpuRuntime> {
        let runtime = self.gpu.as_ref()?;
        if self.is_gpu_deprioritized() {
            return None;
        }
        if width * height < self.config.min_gpu_pixels {
            return None;
        }
        if !runtime.capabilities.supports(width, height) {
            debug!(width, height, "Plane exceeds GPU limits, using CPU");
            return None;
        }
        Some(runtime)
    }

    fn dispatch<R>(
        &self,
        op: Operation,
        width: usize,
        height: usize,
        gpu: impl Fn(&mut dyn GpuContext) -> Result<R, GpuError>,
        cpu: impl Fn() -> R,
    ) -> R {
        let pixel_count = width * height;

        let Some(runtime) = self.gpu_for(width, height) else {
            let (result, cpu_ms) = timed(&cpu);
            self.record(BenchmarkSample::new(op, Some(cpu_ms), None, pixel_count));
            return result;
        };

        let nth = self.gpu_dispatches[op.index()].fetch_add(1, Ordering::Relaxed);
        let calibrate = nth % self.config.calibration_interval == 0;

        match run_on_gpu(runtime, &gpu) {
            Ok((result, gpu_ms)) => {
                let cpu_ms = calibrate.then(|| timed(&cpu).1);
                debug!(operation = op.as_str(), pixel_count, gpu_ms, ?cpu_ms, "GPU dispatch");
                self.record(BenchmarkSample::new(op, cpu_ms, Some(gpu_ms), pixel_count));
                result
            }
            Err(e) => {
                warn!(operation = op.as_str(), error = %e, "GPU dispatch failed, falling back to CPU");
                let (result, cpu_ms) = timed(&cpu);
                self.record(BenchmarkSample::new(op, Some(cpu_ms), None, pixel_count));
                result
            }
        }
    }

    fn record(&self, sample: BenchmarkSample) {
        let measured = sample.speedup.is_some();
        let mut history = self.history.lock();
        history.record(sample);

        if !measured || self.is_gpu_deprioritized() {
            return;
        }
        let recent = history.recent_speedups(self.config.speedup_window);
        if recent.len() < self.config.speedup_window {
            return;
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        if mean < self.config.min_speedup {
            self.deprioritized.store(true, Ordering::Relaxed);
            info!(
                mean_speedup = mean,
                threshold = self.config.min_speedup,
                "GPU speedup below threshold, using CPU for the rest of the session"
            );
        }
    }
}

fn run_on_gpu<R>(
    runtime: &GpuRuntime,
    gpu: &impl Fn(&mut dyn GpuContext) -> Result<R, GpuError>,
) -> Result<(R, f64), GpuError> {
    let backend = &runtime.backend;
    let mut lease = runtime
        .pool
        .checkout_with(|| backend.create_context())
        .map_err(|e| match e {
            PoolError::Timeout => GpuError::PoolExhausted,
            PoolError::Create(e) => e,
        })?;

    let (result, gpu_ms) = timed(|| gpu(&mut **lease));
    match result {
        Ok(value) => {
            if lease.is_lost() {
                lease.discard();
            }
            Ok((value, gpu_ms))
        }
        Err(e) => {
            if e.poisons_context() || lease.is_lost() {
                debug!(error = %e, "Discarding lost GPU context");
                lease.discard();
            }
            Err(e)
        }
    }
}

fn timed<R>(f: impl FnOnce() -> R) -> (R, f64) {
    let start = Instant::now();
    let result = f();
    (result, start.elapsed().as_secs_f64() * 1000.0)
}

impl fmt::Debug for ComputeDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeDispatcher")
            .field("backend", &self.gpu.as_ref().map(|g| g.backend.name().to_string()))
            .field("deprioritized", &self.is_gpu_deprioritized())
            .field("samples", &self.history.lock().len())
            .finish()
    }
}
