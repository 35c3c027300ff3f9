//! Robust color estimation over fixed regions of a photo.
//!
//! Samples go through two filters: a coarse brightness band that rejects
//! shadows and blown-out background, then a quartile trim on the survivors
//! that removes the flecks of skin or glare the band let through.

use crate::compositor::EllipseParams;
use crate::raster::{RasterImage, CHANNELS};

pub const DEFAULT_MIN_SAMPLES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorSample {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorSample {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn brightness(&self) -> f64 {
        (self.r as f64 + self.g as f64 + self.b as f64) / 3.0
    }

    pub fn channels(&self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    pub fn hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Rectangle given as fractions of the image size, `x0..x1` by `y0..y1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionSpec {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl RegionSpec {
    pub const fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Pixel bounds `(x0, y0, x1, y1)` with exclusive ends, clipped to the
    /// image. `None` when nothing of the region lands inside it.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = resolve_fraction(self.x0, width)?;
        let x1 = resolve_fraction(self.x1, width)?;
        let y0 = resolve_fraction(self.y0, height)?;
        let y1 = resolve_fraction(self.y1, height)?;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1, y1))
    }
}

/// The areas beside the head where existing hair usually shows.
pub fn default_side_regions() -> Vec<RegionSpec> {
    vec![
        RegionSpec::new(0.12, 0.18, 0.30, 0.45),
        RegionSpec::new(0.70, 0.18, 0.88, 0.45),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleBand {
    /// Exclusive lower brightness bound.
    pub brightness_min: f64,
    /// Exclusive upper brightness bound.
    pub brightness_max: f64,
    pub min_samples: usize,
}

impl Default for SampleBand {
    fn default() -> Self {
        Self {
            brightness_min: 20.0,
            brightness_max: 200.0,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

impl SampleBand {
    fn admits(&self, rgb: [u8; 3]) -> bool {
        let brightness = (rgb[0] as f64 + rgb[1] as f64 + rgb[2] as f64) / 3.0;
        brightness > self.brightness_min && brightness < self.brightness_max
    }
}

/// Dominant color across `regions`, or `None` when too few pixels qualify.
pub fn sample_region_color(
    image: &RasterImage,
    regions: &[RegionSpec],
    band: &SampleBand,
) -> Option<ColorSample> {
    let (width, height) = image.dimensions();
    let mut kept = Vec::new();
    for region in regions {
        let Some((x0, y0, x1, y1)) = region.pixel_bounds(width, height) else {
            continue;
        };
        for y in y0..y1 {
            let row = &image.as_raw()[row_span(width, y, x0, x1)];
            for pixel in row.chunks_exact(CHANNELS) {
                let rgb = [pixel[0], pixel[1], pixel[2]];
                if band.admits(rgb) {
                    kept.push(rgb);
                }
            }
        }
    }
    trimmed_mean(kept, band.min_samples)
}

/// Same estimate restricted to pixels within `scale` of the ellipse's
/// normalized radius, e.g. `0.6` for the inner part of the blend core.
pub fn sample_ellipse_color(
    image: &RasterImage,
    ellipse: &EllipseParams,
    scale: f64,
    band: &SampleBand,
) -> Option<ColorSample> {
    if !ellipse.is_drawable() || !(scale > 0.0) {
        return None;
    }
    let (width, height) = image.dimensions();
    let (x0, x1) = core_span(ellipse.cx, ellipse.rx * scale, width)?;
    let (y0, y1) = core_span(ellipse.cy, ellipse.ry * scale, height)?;

    let mut kept = Vec::new();
    for y in y0..y1 {
        for x in x0..x1 {
            if ellipse.distance(x, y) > scale {
                continue;
            }
            if let Some(rgb) = image.pixel(x, y) {
                if band.admits(rgb) {
                    kept.push(rgb);
                }
            }
        }
    }
    trimmed_mean(kept, band.min_samples)
}

fn trimmed_mean(mut kept: Vec<[u8; 3]>, min_samples: usize) -> Option<ColorSample> {
    if kept.is_empty() || kept.len() < min_samples {
        return None;
    }
    kept.sort_by_key(|rgb| rgb[0] as u16 + rgb[1] as u16 + rgb[2] as u16);
    let quarter = kept.len() / 4;
    let middle = &kept[quarter..kept.len() - quarter];

    let mut sums = [0u64; 3];
    for rgb in middle {
        for (sum, value) in sums.iter_mut().zip(rgb) {
            *sum += *value as u64;
        }
    }
    let count = middle.len() as f64;
    let channel = |sum: u64| (sum as f64 / count).round().clamp(0.0, 255.0) as u8;
    Some(ColorSample::new(
        channel(sums[0]),
        channel(sums[1]),
        channel(sums[2]),
    ))
}

/// Pixel indices `[start, end)` covering `center ± radius` on both sides.
fn core_span(center: f64, radius: f64, limit: u32) -> Option<(u32, u32)> {
    let start = (center - radius).floor().max(0.0);
    let end = ((center + radius).ceil() + 1.0).min(limit as f64);
    if !start.is_finite() || !end.is_finite() || end <= start {
        return None;
    }
    Some((start as u32, end as u32))
}

fn resolve_fraction(fraction: f64, dimension: u32) -> Option<u32> {
    if !fraction.is_finite() {
        return None;
    }
    Some((fraction * dimension as f64).round().clamp(0.0, dimension as f64) as u32)
}

fn row_span(width: u32, y: u32, x0: u32, x1: u32) -> std::ops::Range<usize> {
    let row_start = y as usize * width as usize;
    (row_start + x0 as usize) * CHANNELS..(row_start + x1 as usize) * CHANNELS
}
