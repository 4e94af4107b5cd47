//! Kernel dispatch layer for Aerial QA
//!
//! This crate runs the pixel kernels the analyzers depend on (Laplacian response,
//! Sobel gradients, block statistics, Harris corner response) on either a GPU-style
//! backend or the plain CPU implementation, choosing per call.
//!
//! # Features
//!
//! - **Backend agnostic**: GPU execution goes through the [`GpuBackend`] / [`GpuContext`]
//!   traits, so analyzers never depend on a graphics API
//! - **Context pooling**: bounded [`ResourcePool`] with lease guards, FIFO waiting and an
//!   idle reaper
//! - **Transparent fallback**: any GPU failure is retried on the CPU path and never surfaced
//! - **Benchmarking**: every dispatch is timed into a per-dispatcher rolling history, and
//!   GPU use is dropped for the session when it stops paying off

pub mod backend;
pub mod benchmark;
pub mod dispatcher;
pub mod kernels;
pub mod plane;
pub mod pool;

pub use backend::{GpuBackend, GpuCapabilities, GpuContext, GpuError, RayonBackend};
pub use benchmark::{BenchmarkHistory, BenchmarkSample, Operation, OperationStats, PerformanceReport};
pub use dispatcher::{ComputeDispatcher, DispatchConfig, InvalidDispatchConfig};
pub use plane::{Gradients, Plane};
pub use pool::{IdleReaper, Lease, PoolConfig, PoolError, PoolStats, ResourcePool};
