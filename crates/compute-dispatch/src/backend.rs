//! GPU backend abstraction
//!
//! Analyzer code never talks to a graphics API directly. A [`GpuBackend`] reports its
//! capabilities and creates [`GpuContext`]s; a context runs the same kernels the CPU
//! path implements in [`crate::kernels::cpu`].

use crate::kernels::{self, block_dims, laplacian_dims};
use crate::plane::{Gradients, Plane};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while running a kernel on a GPU context.
///
/// None of these ever reach analyzer callers: the dispatcher retries on the CPU.
#[derive(Debug, Clone, Error)]
pub enum GpuError {
    #[error("No GPU backend available")]
    Unavailable,
    #[error("GPU context lost: {0}")]
    ContextLost(String),
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),
    #[error("Missing GPU extension: {0}")]
    MissingExtension(String),
    #[error("Timed out waiting for a pooled GPU context")]
    PoolExhausted,
    #[error("GPU execution failed: {0}")]
    Execution(String),
}

impl GpuError {
    /// Whether the context that produced this error must not be reused
    pub fn poisons_context(&self) -> bool {
        matches!(self, GpuError::ContextLost(_))
    }
}

/// What a backend can do, probed once when the dispatcher is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuCapabilities {
    pub name: String,
    /// Largest texture edge the backend accepts
    pub max_texture_size: usize,
    /// Float render targets are required by every kernel
    pub float_textures: bool,
}

impl GpuCapabilities {
    /// Whether a plane of the given size can be uploaded
    pub fn supports(&self, width: usize, height: usize) -> bool {
        self.float_textures && width.max(height) <= self.max_texture_size
    }
}

/// A live execution context (device queue + compiled kernels).
pub trait GpuContext: Send {
    fn laplacian(&mut self, plane: &Plane) -> Result<Plane, GpuError>;

    fn sobel(&mut self, plane: &Plane) -> Result<Gradients, GpuError>;

    fn block_std_dev(&mut self, plane: &Plane, block: usize) -> Result<Plane, GpuError>;

    fn harris_response(&mut self, gradients: &Gradients, k: f32) -> Result<Plane, GpuError>;

    /// Set once the underlying device is gone; the pool discards lost contexts
    fn is_lost(&self) -> bool {
        false
    }
}

/// Factory for GPU contexts.
pub trait GpuBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Probe the device. `None` means no usable GPU on this host.
    fn capabilities(&self) -> Option<GpuCapabilities>;

    fn create_context(&self) -> Result<Box<dyn GpuContext>, GpuError>;
}

/// Data-parallel backend that executes each kernel as a grid of row dispatches on the
/// rayon pool.
///
/// Stands in for a device backend on hosts without one and shares the exact per-row
/// kernels with the CPU path, so results are identical.
#[derive(Debug, Clone)]
pub struct RayonBackend {
    max_texture_size: usize,
}

impl RayonBackend {
    pub fn new() -> Self {
        Self {
            max_texture_size: 16_384,
        }
    }

    pub fn with_max_texture_size(max_texture_size: usize) -> Self {
        Self { max_texture_size }
    }
}

impl Default for RayonBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for RayonBackend {
    fn name(&self) -> &str {
        "rayon"
    }

    fn capabilities(&self) -> Option<GpuCapabilities> {
        Some(GpuCapabilities {
            name: format!("rayon ({} threads)", rayon::current_num_threads()),
            max_texture_size: self.max_texture_size,
            float_textures: true,
        })
    }

    fn create_context(&self) -> Result<Box<dyn GpuContext>, GpuError> {
        Ok(Box::new(RayonContext))
    }
}

struct RayonContext;

impl GpuContext for RayonContext {
    fn laplacian(&mut self, plane: &Plane) -> Result<Plane, GpuError> {
        let (w, h) = laplacian_dims(plane);
        if w == 0 {
            return Ok(Plane::empty());
        }
        let mut data = vec![0.0f32; w * h];
        data.par_chunks_mut(w)
            .enumerate()
            .for_each(|(oy, row)| kernels::laplacian_row(plane, oy, row));
        Plane::from_vec(w, h, data).ok_or_else(|| GpuError::Execution("laplacian read-back size mismatch".into()))
    }

    fn sobel(&mut self, plane: &Plane) -> Result<Gradients, GpuError> {
        let (w, h) = (plane.width(), plane.height());
        if w == 0 || h == 0 {
            return Ok(Gradients {
                gx: Plane::empty(),
                gy: Plane::empty(),
            });
        }
        let mut gx = vec![0.0f32; w * h];
        let mut gy = vec![0.0f32; w * h];
        gx.par_chunks_mut(w)
            .zip(gy.par_chunks_mut(w))
            .enumerate()
            .for_each(|(y, (gx_row, gy_row))| kernels::sobel_row(plane, y, gx_row, gy_row));

        let gx = Plane::from_vec(w, h, gx);
        let gy = Plane::from_vec(w, h, gy);
        match (gx, gy) {
            (Some(gx), Some(gy)) => Ok(Gradients { gx, gy }),
            _ => Err(GpuError::Execution("sobel read-back size mismatch".into())),
        }
    }

    fn block_std_dev(&mut self, plane: &Plane, block: usize) -> Result<Plane, GpuError> {
        let (bw, bh) = block_dims(plane, block);
        if bw == 0 || bh == 0 {
            return Ok(Plane::empty());
        }
        let mut data = vec![0.0f32; bw * bh];
        data.par_chunks_mut(bw)
            .enumerate()
            .for_each(|(by, row)| kernels::block_std_row(plane, block, by, row));
        Plane::from_vec(bw, bh, data).ok_or_else(|| GpuError::Execution("block stats read-back size mismatch".into()))
    }

    fn harris_response(&mut self, gradients: &Gradients, k: f32) -> Result<Plane, GpuError> {
        let (w, h) = (gradients.width(), gradients.height());
        if w == 0 || h == 0 {
            return Ok(Plane::empty());
        }
        let mut data = vec![0.0f32; w * h];
        data.par_chunks_mut(w)
            .enumerate()
            .for_each(|(y, row)| kernels::harris_row(gradients, k, y, row));
        Plane::from_vec(w, h, data).ok_or_else(|| GpuError::Execution("harris read-back size mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::cpu;

    fn textured_plane() -> Plane {
        Plane::from_fn(64, 48, |x, y| ((x * 37 + y * 91) % 251) as f32)
    }

    #[test]
    fn test_rayon_backend_matches_cpu() -> Result<(), GpuError> {
        let backend = RayonBackend::new();
        let mut ctx = backend.create_context()?;
        let plane = textured_plane();

        assert_eq!(ctx.laplacian(&plane)?, cpu::laplacian(&plane));
        assert_eq!(ctx.sobel(&plane)?, cpu::sobel(&plane));
        assert_eq!(ctx.block_std_dev(&plane, 8)?, cpu::block_std_dev(&plane, 8));

        let gradients = cpu::sobel(&plane);
        assert_eq!(ctx.harris_response(&gradients, 0.04)?, cpu::harris_response(&gradients, 0.04));
        Ok(())
    }

    #[test]
    fn test_capabilities_size_check() {
        let caps = RayonBackend::with_max_texture_size(1024)
            .capabilities()
            .expect("rayon backend always reports capabilities");
        assert!(caps.supports(1024, 800));
        assert!(!caps.supports(2048, 800));
    }

    #[test]
    fn test_context_loss_poisons() {
        assert!(GpuError::ContextLost("device removed".into()).poisons_context());
        assert!(!GpuError::ShaderCompilation("bad".into()).poisons_context());
    }
}
