//! Rolling CPU/GPU timing history
//!
//! Every dispatch leaves a [`BenchmarkSample`]. The history is bounded and owned by a
//! single dispatcher; the report aggregates it per operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Kernel operations the dispatcher can route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Laplacian,
    Sobel,
    BlockStdDev,
    HarrisResponse,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Laplacian,
        Operation::Sobel,
        Operation::BlockStdDev,
        Operation::HarrisResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Laplacian => "laplacian",
            Operation::Sobel => "sobel",
            Operation::BlockStdDev => "block_std_dev",
            Operation::HarrisResponse => "harris_response",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Operation::Laplacian => 0,
            Operation::Sobel => 1,
            Operation::BlockStdDev => 2,
            Operation::HarrisResponse => 3,
        }
    }
}

/// One timed dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSample {
    pub operation: Operation,
    /// Present when the CPU path ran (fallback, CPU-only dispatch or calibration)
    pub cpu_time_ms: Option<f64>,
    /// Present when the GPU path completed successfully
    pub gpu_time_ms: Option<f64>,
    /// `cpu / gpu`, only when both timings exist
    pub speedup: Option<f64>,
    pub pixel_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl BenchmarkSample {
    pub fn new(
        operation: Operation,
        cpu_time_ms: Option<f64>,
        gpu_time_ms: Option<f64>,
        pixel_count: usize,
    ) -> Self {
        let speedup = match (cpu_time_ms, gpu_time_ms) {
            (Some(cpu), Some(gpu)) if gpu > 0.0 => Some(cpu / gpu),
            _ => None,
        };
        Self {
            operation,
            cpu_time_ms,
            gpu_time_ms,
            speedup,
            pixel_count,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded FIFO of samples; the oldest is evicted once `capacity` is reached
#[derive(Debug, Clone)]
pub struct BenchmarkHistory {
    samples: VecDeque<BenchmarkSample>,
    capacity: usize,
}

impl BenchmarkHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sample: BenchmarkSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &BenchmarkSample> {
        self.samples.iter()
    }

    /// The last `n` measured speedups, newest first
    pub fn recent_speedups(&self, n: usize) -> Vec<f64> {
        self.samples
            .iter()
            .rev()
            .filter_map(|s| s.speedup)
            .take(n)
            .collect()
    }

    pub fn report(&self, gpu_deprioritized: bool) -> PerformanceReport {
        let operations = Operation::ALL
            .iter()
            .filter_map(|&op| {
                let samples: Vec<&BenchmarkSample> =
                    self.samples.iter().filter(|s| s.operation == op).collect();
                if samples.is_empty() {
                    return None;
                }
                Some(OperationStats {
                    operation: op,
                    samples: samples.len(),
                    gpu_samples: samples.iter().filter(|s| s.gpu_time_ms.is_some()).count(),
                    mean_cpu_ms: mean(samples.iter().filter_map(|s| s.cpu_time_ms)),
                    mean_gpu_ms: mean(samples.iter().filter_map(|s| s.gpu_time_ms)),
                    mean_speedup: mean(samples.iter().filter_map(|s| s.speedup)),
                })
            })
            .collect();

        PerformanceReport {
            operations,
            gpu_deprioritized,
            total_samples: self.samples.len(),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Per-operation aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStats {
    pub operation: Operation,
    pub samples: usize,
    pub gpu_samples: usize,
    pub mean_cpu_ms: Option<f64>,
    pub mean_gpu_ms: Option<f64>,
    pub mean_speedup: Option<f64>,
}

/// Summary of one dispatcher's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub operations: Vec<OperationStats>,
    pub gpu_deprioritized: bool,
    pub total_samples: usize,
}
