//! Pixel kernels shared by the CPU path and the row-parallel backend
//!
//! Each kernel is written as a per-output-row function so that the sequential CPU
//! implementation and a parallel dispatcher produce bit-identical samples.

use crate::plane::{Gradients, Plane};

/// 3x3 Laplacian: center weight 8, the eight neighbours -1
pub const LAPLACIAN_KERNEL: [[f32; 3]; 3] = [[-1.0, -1.0, -1.0], [-1.0, 8.0, -1.0], [-1.0, -1.0, -1.0]];

/// Output size of the Laplacian kernel (1-pixel border excluded)
pub fn laplacian_dims(plane: &Plane) -> (usize, usize) {
    if plane.width() < 3 || plane.height() < 3 {
        (0, 0)
    } else {
        (plane.width() - 2, plane.height() - 2)
    }
}

/// Absolute Laplacian response for interior output row `oy` (source row `oy + 1`)
pub fn laplacian_row(src: &Plane, oy: usize, out: &mut [f32]) {
    let above = src.row(oy);
    let center = src.row(oy + 1);
    let below = src.row(oy + 2);
    for (ox, value) in out.iter_mut().enumerate() {
        let x = ox + 1;
        let neighbours = above[x - 1] + above[x] + above[x + 1]
            + center[x - 1] + center[x + 1]
            + below[x - 1] + below[x] + below[x + 1];
        *value = (8.0 * center[x] - neighbours).abs();
    }
}

/// Sobel derivatives for row `y`, border samples replicated
pub fn sobel_row(src: &Plane, y: usize, gx_out: &mut [f32], gy_out: &mut [f32]) {
    let y = y as isize;
    for x in 0..src.width() {
        let xi = x as isize;
        let p = |dx: isize, dy: isize| src.get_clamped(xi + dx, y + dy);

        gx_out[x] = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
        gy_out[x] = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
    }
}

/// Output size of the block statistics kernel (only whole blocks are counted)
pub fn block_dims(plane: &Plane, block: usize) -> (usize, usize) {
    if block == 0 {
        return (0, 0);
    }
    (plane.width() / block, plane.height() / block)
}

/// Population standard deviation of each `block x block` tile in block row `by`
pub fn block_std_row(src: &Plane, block: usize, by: usize, out: &mut [f32]) {
    let n = (block * block) as f64;
    for (bx, value) in out.iter_mut().enumerate() {
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for dy in 0..block {
            let row = src.row(by * block + dy);
            for &v in &row[bx * block..(bx + 1) * block] {
                let v = v as f64;
                sum += v;
                sum_sq += v * v;
            }
        }
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        *value = variance.sqrt() as f32;
    }
}

/// Harris corner response `det(M) - k * trace(M)^2` for row `y`, where `M` is the
/// structure tensor summed over a 3x3 window (border samples replicated).
pub fn harris_row(gradients: &Gradients, k: f32, y: usize, out: &mut [f32]) {
    let y = y as isize;
    for (x, value) in out.iter_mut().enumerate() {
        let xi = x as isize;
        let mut sxx = 0.0f32;
        let mut syy = 0.0f32;
        let mut sxy = 0.0f32;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let gx = gradients.gx.get_clamped(xi + dx, y + dy);
                let gy = gradients.gy.get_clamped(xi + dx, y + dy);
                sxx += gx * gx;
                syy += gy * gy;
                sxy += gx * gy;
            }
        }
        let det = sxx * syy - sxy * sxy;
        let trace = sxx + syy;
        *value = det - k * trace * trace;
    }
}

/// Sequential reference implementations of every kernel.
pub mod cpu {
    use super::*;

    pub fn laplacian(plane: &Plane) -> Plane {
        let (w, h) = laplacian_dims(plane);
        if w == 0 {
            return Plane::empty();
        }
        let mut data = vec![0.0f32; w * h];
        for (oy, row) in data.chunks_mut(w).enumerate() {
            laplacian_row(plane, oy, row);
        }
        Plane::from_vec(w, h, data).unwrap_or_else(Plane::empty)
    }

    pub fn sobel(plane: &Plane) -> Gradients {
        let (w, h) = (plane.width(), plane.height());
        let mut gx = vec![0.0f32; w * h];
        let mut gy = vec![0.0f32; w * h];
        if w > 0 {
            for (y, (gx_row, gy_row)) in gx.chunks_mut(w).zip(gy.chunks_mut(w)).enumerate() {
                sobel_row(plane, y, gx_row, gy_row);
            }
        }
        Gradients {
            gx: Plane::from_vec(w, h, gx).unwrap_or_else(Plane::empty),
            gy: Plane::from_vec(w, h, gy).unwrap_or_else(Plane::empty),
        }
    }

    pub fn block_std_dev(plane: &Plane, block: usize) -> Plane {
        let (bw, bh) = block_dims(plane, block);
        if bw == 0 || bh == 0 {
            return Plane::empty();
        }
        let mut data = vec![0.0f32; bw * bh];
        for (by, row) in data.chunks_mut(bw).enumerate() {
            block_std_row(plane, block, by, row);
        }
        Plane::from_vec(bw, bh, data).unwrap_or_else(Plane::empty)
    }

    pub fn harris_response(gradients: &Gradients, k: f32) -> Plane {
        let (w, h) = (gradients.width(), gradients.height());
        if w == 0 || h == 0 {
            return Plane::empty();
        }
        let mut data = vec![0.0f32; w * h];
        for (y, row) in data.chunks_mut(w).enumerate() {
            harris_row(gradients, k, y, row);
        }
        Plane::from_vec(w, h, data).unwrap_or_else(Plane::empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_laplacian_flat_plane_is_zero() {
        let plane = Plane::filled(16, 16, 128.0);
        let response = cpu::laplacian(&plane);
        assert_eq!(response.width(), 14);
        assert_eq!(response.height(), 14);
        assert!(response.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_laplacian_single_spike() {
        let plane = Plane::from_fn(5, 5, |x, y| if x == 2 && y == 2 { 10.0 } else { 0.0 });
        let response = cpu::laplacian(&plane);
        // Center output sample sits on the spike
        assert_eq!(response.get(1, 1), 80.0);
        // Neighbours see -10, reported as absolute response
        assert_eq!(response.get(0, 0), 10.0);
    }

    #[test]
    fn test_laplacian_too_small() {
        assert!(cpu::laplacian(&Plane::filled(2, 10, 1.0)).is_empty());
    }

    #[test]
    fn test_sobel_vertical_edge() {
        let plane = Plane::from_fn(8, 8, |x, _| if x < 4 { 0.0 } else { 100.0 });
        let gradients = cpu::sobel(&plane);
        assert_eq!(gradients.gx.get(4, 4), 400.0);
        assert_eq!(gradients.gy.get(4, 4), 0.0);
        assert_eq!(gradients.gx.get(1, 4), 0.0);
    }

    #[test]
    fn test_block_std_dev() {
        // Alternating 0/10 columns: every 2x2 block has std dev 5
        let plane = Plane::from_fn(4, 4, |x, _| if x % 2 == 0 { 0.0 } else { 10.0 });
        let stats = cpu::block_std_dev(&plane, 2);
        assert_eq!(stats.width(), 2);
        assert_eq!(stats.height(), 2);
        assert!(stats.data().iter().all(|&v| (v - 5.0).abs() < 1e-5));
    }

    #[test]
    fn test_harris_corner_beats_edge() {
        // Bright square in the top-left quadrant
        let plane = Plane::from_fn(20, 20, |x, y| if x < 10 && y < 10 { 200.0 } else { 0.0 });
        let response = cpu::harris_response(&cpu::sobel(&plane), 0.04);
        let corner = response.get(9, 9);
        let edge = response.get(9, 3);
        assert!(corner > 0.0, "corner response should be positive, got {corner}");
        assert!(edge <= 0.0, "edge response should not be positive, got {edge}");
    }
}
