//! Single-channel floating point image planes

/// A row-major grid of `f32` samples.
///
/// Analyzers work on luminance (or single color channel) planes in the 0-255 range.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    /// Wrap an existing buffer. Returns `None` if the buffer length does not match.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }
        Some(Self { width, height, data })
    }

    /// Plane with every sample set to `value`
    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Build a plane by evaluating `f(x, y)` for every sample
    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    /// An empty 0x0 plane, returned by kernels whose input is too small
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            data: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Sample with coordinates clamped to the plane (replicated border)
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> f32 {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.data[cy * self.width + cx]
    }

    pub fn row(&self, y: usize) -> &[f32] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    /// Arithmetic mean of all samples (0.0 for an empty plane)
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&v| v as f64).sum::<f64>() / self.data.len() as f64
    }

    /// Population variance of all samples (0.0 for an empty plane)
    pub fn variance(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        self.data
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / self.data.len() as f64
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::MIN, f32::max)
    }

    /// Box-average downsample by an integer factor. Trailing rows/columns that do not
    /// fill a whole cell are dropped.
    pub fn downsample(&self, factor: usize) -> Plane {
        if factor <= 1 {
            return self.clone();
        }
        let out_w = self.width / factor;
        let out_h = self.height / factor;
        if out_w == 0 || out_h == 0 {
            return Plane::empty();
        }

        let norm = 1.0 / (factor * factor) as f32;
        let mut data = Vec::with_capacity(out_w * out_h);
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut sum = 0.0f32;
                for dy in 0..factor {
                    let row = self.row(oy * factor + dy);
                    sum += row[ox * factor..(ox + 1) * factor].iter().sum::<f32>();
                }
                data.push(sum * norm);
            }
        }

        Plane {
            width: out_w,
            height: out_h,
            data,
        }
    }

    /// Resample to the given size using box filtering over the source footprint.
    /// Used to bring a plane to a non-integer smaller scale.
    pub fn resize_area(&self, out_w: usize, out_h: usize) -> Plane {
        if out_w == 0 || out_h == 0 || self.is_empty() {
            return Plane::empty();
        }
        if out_w == self.width && out_h == self.height {
            return self.clone();
        }

        let sx = self.width as f64 / out_w as f64;
        let sy = self.height as f64 / out_h as f64;
        Plane::from_fn(out_w, out_h, |ox, oy| {
            let x0 = (ox as f64 * sx).floor() as usize;
            let y0 = (oy as f64 * sy).floor() as usize;
            let x1 = (((ox + 1) as f64 * sx).ceil() as usize).clamp(x0 + 1, self.width);
            let y1 = (((oy + 1) as f64 * sy).ceil() as usize).clamp(y0 + 1, self.height);
            let mut sum = 0.0f32;
            for y in y0..y1 {
                sum += self.row(y)[x0..x1].iter().sum::<f32>();
            }
            sum / ((x1 - x0) * (y1 - y0)) as f32
        })
    }
}

/// Horizontal and vertical Sobel derivatives of a plane
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub gx: Plane,
    pub gy: Plane,
}

impl Gradients {
    pub fn width(&self) -> usize {
        self.gx.width()
    }

    pub fn height(&self) -> usize {
        self.gx.height()
    }

    #[inline]
    pub fn magnitude(&self, x: usize, y: usize) -> f32 {
        let gx = self.gx.get(x, y);
        let gy = self.gy.get(x, y);
        (gx * gx + gy * gy).sqrt()
    }

    pub fn magnitude_plane(&self) -> Plane {
        let data = self
            .gx
            .data()
            .iter()
            .zip(self.gy.data())
            .map(|(gx, gy)| (gx * gx + gy * gy).sqrt())
            .collect();
        Plane {
            width: self.gx.width(),
            height: self.gx.height(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_rejects_mismatched_length() {
        assert!(Plane::from_vec(3, 3, vec![0.0; 8]).is_none());
        assert!(Plane::from_vec(3, 3, vec![0.0; 9]).is_some());
    }

    #[test]
    fn test_mean_and_variance() {
        let plane = Plane::from_vec(2, 2, vec![0.0, 10.0, 0.0, 10.0]).unwrap();
        assert_eq!(plane.mean(), 5.0);
        assert_eq!(plane.variance(), 25.0);
        assert_eq!(Plane::empty().variance(), 0.0);
    }

    #[test]
    fn test_downsample_box_average() {
        let plane = Plane::from_fn(4, 4, |x, _| if x < 2 { 0.0 } else { 100.0 });
        let half = plane.downsample(2);
        assert_eq!(half.width(), 2);
        assert_eq!(half.height(), 2);
        assert_eq!(half.row(0), &[0.0, 100.0]);

        assert!(plane.downsample(8).is_empty());
    }

    #[test]
    fn test_resize_area_preserves_flat_value() {
        let plane = Plane::filled(10, 7, 42.0);
        let resized = plane.resize_area(4, 3);
        assert_eq!(resized.width(), 4);
        assert_eq!(resized.height(), 3);
        assert!(resized.data().iter().all(|&v| (v - 42.0).abs() < 1e-4));
    }

    #[test]
    fn test_clamped_access() {
        let plane = Plane::from_fn(3, 3, |x, y| (y * 3 + x) as f32);
        assert_eq!(plane.get_clamped(-1, -1), 0.0);
        assert_eq!(plane.get_clamped(5, 1), 5.0);
    }
}
