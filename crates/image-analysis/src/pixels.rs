//! Decode, downsample and thumbnail
//!
//! Turns submitted bytes into an RGB buffer at the bounded analysis resolution plus a
//! small JPEG thumbnail for display. Every failure here is a [`AnalysisError::Decode`].

use crate::config::{LimitsConfig, ResolutionConfig};
use crate::error::{AnalysisError, Result};
use crate::model::Dimensions;
use compute_dispatch::Plane;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader, RgbImage};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Pixels ready for the analyzers
#[derive(Debug, Clone)]
pub struct DecodedImage {
    rgb: RgbImage,
    luma: Plane,
    source: Dimensions,
    format: Option<ImageFormat>,
    thumbnail: Vec<u8>,
}

impl DecodedImage {
    /// Wrap an already-decoded buffer (no resize, no thumbnail)
    pub fn from_rgb(rgb: RgbImage) -> Self {
        let source = Dimensions {
            width: rgb.width(),
            height: rgb.height(),
        };
        let luma = luminance_plane(&rgb);
        Self {
            rgb,
            luma,
            source,
            format: None,
            thumbnail: Vec::new(),
        }
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn width(&self) -> usize {
        self.rgb.width() as usize
    }

    pub fn height(&self) -> usize {
        self.rgb.height() as usize
    }

    pub fn pixel_count(&self) -> usize {
        self.width() * self.height()
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.rgb.width(),
            height: self.rgb.height(),
        }
    }

    pub fn source_dimensions(&self) -> Dimensions {
        self.source
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn thumbnail(&self) -> &[u8] {
        &self.thumbnail
    }

    pub fn into_thumbnail(self) -> Vec<u8> {
        self.thumbnail
    }

    /// Luminance plane, `0.299R + 0.587G + 0.114B`
    pub fn luminance(&self) -> &Plane {
        &self.luma
    }

    /// Single color channel (0 = red, 1 = green, 2 = blue)
    pub fn channel(&self, index: usize) -> Plane {
        let data = self.rgb.pixels().map(|p| p[index.min(2)] as f32).collect();
        Plane::from_vec(self.width(), self.height(), data).unwrap_or_else(Plane::empty)
    }
}

/// Decode `bytes` of the declared `mime` type into analysis-resolution pixels.
///
/// `gpu_available` raises the resolution cap for large sources.
pub fn decode(
    bytes: &[u8],
    mime: &str,
    resolution: &ResolutionConfig,
    limits: &LimitsConfig,
    gpu_available: bool,
) -> Result<DecodedImage> {
    if bytes.is_empty() {
        return Err(AnalysisError::Decode("empty file".into()));
    }

    let format = resolve_format(bytes, mime)?;
    let limit = limits.limit_for(format);
    if bytes.len() as u64 > limit {
        return Err(AnalysisError::Decode(format!(
            "{} bytes exceeds the {} limit of {} bytes",
            bytes.len(),
            format_name(format),
            limit
        )));
    }

    let mut reader = ImageReader::new(Cursor::new(bytes));
    reader.set_format(format);
    let img = reader
        .decode()
        .map_err(|e| AnalysisError::Decode(format!("failed to decode {}: {}", format_name(format), e)))?;

    let (width, height) = img.dimensions();
    if width < resolution.min_edge || height < resolution.min_edge {
        return Err(AnalysisError::Decode(format!(
            "degenerate dimensions {}x{} (minimum edge {} px)",
            width, height, resolution.min_edge
        )));
    }

    let source = Dimensions { width, height };
    let cap = analysis_cap(source, resolution, gpu_available);
    let thumbnail = encode_jpeg(
        &resize_to_fit(&img, resolution.thumbnail_edge, FilterType::Triangle),
        resolution.thumbnail_quality,
    )?;
    let analysis = resize_to_fit(&img, cap, FilterType::Triangle);

    debug!(
        source_width = width,
        source_height = height,
        analysis_width = analysis.width(),
        analysis_height = analysis.height(),
        cap,
        "Decoded image"
    );

    let rgb = analysis.to_rgb8();
    Ok(DecodedImage {
        luma: luminance_plane(&rgb),
        rgb,
        source,
        format: Some(format),
        thumbnail,
    })
}

fn luminance_plane(rgb: &RgbImage) -> Plane {
    let data = rgb
        .pixels()
        .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
        .collect();
    Plane::from_vec(rgb.width() as usize, rgb.height() as usize, data).unwrap_or_else(Plane::empty)
}

/// Long-edge cap for the analysis image
pub fn analysis_cap(source: Dimensions, resolution: &ResolutionConfig, gpu_available: bool) -> u32 {
    if gpu_available && source.pixel_count() > resolution.gpu_source_pixels {
        resolution.gpu_max_edge
    } else {
        resolution.max_edge
    }
}

fn resolve_format(bytes: &[u8], mime: &str) -> Result<ImageFormat> {
    let mime = mime.trim().to_lowercase();
    if mime.is_empty() || mime == "application/octet-stream" {
        return image::guess_format(bytes)
            .map_err(|_| AnalysisError::Decode("unrecognized image data".into()));
    }
    if !mime.starts_with("image/") {
        return Err(AnalysisError::Decode(format!("unsupported MIME type {mime}")));
    }
    match ImageFormat::from_mime_type(&mime) {
        Some(format) if format.reading_enabled() => Ok(format),
        _ => Err(AnalysisError::Decode(format!("unsupported MIME type {mime}"))),
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("image")
}

/// MIME type for a file extension; empty when unknown so the decoder sniffs the bytes
pub fn mime_for_path(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ImageFormat::from_extension(ext))
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_default()
}

/// Resize to fit within `max_dim` on the long edge, never upscaling
fn resize_to_fit(img: &DynamicImage, max_dim: u32, filter: FilterType) -> DynamicImage {
    let (width, height) = img.dimensions();
    let max_existing = width.max(height);
    if max_existing <= max_dim {
        return img.clone();
    }

    let ratio = max_dim as f64 / max_existing as f64;
    let new_width = ((width as f64 * ratio).round() as u32).max(1);
    let new_height = ((height as f64 * ratio).round() as u32).max(1);
    img.resize_exact(new_width, new_height, filter)
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))
        .map_err(|e| AnalysisError::Decode(format!("failed to encode thumbnail: {e}")))?;
    Ok(buffer)
}
