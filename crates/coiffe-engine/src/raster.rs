use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};

pub const CHANNELS: usize = 3;

/// Decoded RGB pixels in row-major order.
///
/// The buffer is fixed once built; every transformation returns a new image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RasterImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            bail!(
                "raster buffer holds {} samples, expected {expected} for {width}x{height}",
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * CHANNELS)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("failed decoding image bytes")?;
        Ok(Self::from(image.to_rgb8()))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let image =
            image::open(path).with_context(|| format!("failed decoding {}", path.display()))?;
        Ok(Self::from(image.to_rgb8()))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }

    /// Stretch-to-fit bilinear resample.
    pub fn resized(&self, width: u32, height: u32) -> Self {
        if (width, height) == self.dimensions() {
            return self.clone();
        }
        if width == 0 || height == 0 {
            return Self::filled(width, height, [0, 0, 0]);
        }
        let Some(source) = self.to_rgb_image() else {
            return Self::filled(width, height, [0, 0, 0]);
        };
        Self::from(image::imageops::resize(
            &source,
            width,
            height,
            FilterType::Triangle,
        ))
    }

    /// Downscale so the longer side is at most `max_side`, keeping aspect.
    pub fn fit_within(&self, max_side: u32) -> Self {
        let longest = self.width.max(self.height);
        if max_side == 0 || longest <= max_side {
            return self.clone();
        }
        let scale = max_side as f64 / longest as f64;
        let width = ((self.width as f64 * scale).round() as u32).max(1);
        let height = ((self.height as f64 * scale).round() as u32).max(1);
        self.resized(width, height)
    }

    pub fn encode(&self, output_format: &str) -> Result<Vec<u8>> {
        let source = self
            .to_rgb_image()
            .context("raster buffer does not match its dimensions")?;
        let mut out = Vec::new();
        match normalize_output_extension(output_format) {
            "jpg" => {
                let mut encoder = JpegEncoder::new_with_quality(&mut out, 92);
                encoder
                    .encode_image(&source)
                    .context("failed encoding jpeg")?;
            }
            _ => {
                DynamicImage::ImageRgb8(source)
                    .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                    .context("failed encoding png")?;
            }
        }
        Ok(out)
    }

    fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}

impl From<RgbImage> for RasterImage {
    fn from(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }
}

pub fn normalize_output_extension(output_format: &str) -> &'static str {
    match output_format.trim().to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" | "image/jpeg" => "jpg",
        _ => "png",
    }
}
