//! Soft-edged elliptical blend of a generated image over the original photo.
//!
//! Inside the ellipse core the foreground wins outright, outside the
//! transition band the background is untouched, and in between the weight
//! follows a raised cosine so the seam has no visible edge.

use std::f64::consts::PI;

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use crate::correction::ColorCorrection;
use crate::raster::{RasterImage, CHANNELS};

/// Ellipse in pixel units. `fade_width` is the half-width of the transition
/// band as a fraction of the normalized radius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipseParams {
    pub cx: f64,
    pub cy: f64,
    pub rx: f64,
    pub ry: f64,
    pub fade_width: f64,
}

impl EllipseParams {
    pub fn new(cx: f64, cy: f64, rx: f64, ry: f64, fade_width: f64) -> Self {
        Self {
            cx,
            cy,
            rx,
            ry,
            fade_width: clamp_fade(fade_width),
        }
    }

    pub fn is_drawable(&self) -> bool {
        self.rx > 0.0 && self.ry > 0.0 && self.cx.is_finite() && self.cy.is_finite()
    }

    /// Normalized elliptical distance; `1.0` lies on the ellipse outline.
    pub fn distance(&self, x: u32, y: u32) -> f64 {
        if !self.is_drawable() {
            return f64::INFINITY;
        }
        let dx = (x as f64 - self.cx) / self.rx;
        let dy = (y as f64 - self.cy) / self.ry;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn weight_at(&self, x: u32, y: u32) -> f64 {
        blend_weight(self.distance(x, y), self.fade_width)
    }

    pub fn to_json(&self) -> Map<String, Value> {
        match json!({
            "cx": self.cx,
            "cy": self.cy,
            "rx": self.rx,
            "ry": self.ry,
            "fade_width": self.fade_width,
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Ellipse placement relative to image size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipseFractions {
    pub center_x: f64,
    pub center_y: f64,
    pub radius_x: f64,
    pub radius_y: f64,
    pub fade_width: f64,
}

impl Default for EllipseFractions {
    fn default() -> Self {
        Self {
            center_x: 0.5,
            center_y: 0.2,
            radius_x: 0.38,
            radius_y: 0.23,
            fade_width: 0.35,
        }
    }
}

impl EllipseFractions {
    pub fn resolve(&self, width: u32, height: u32) -> EllipseParams {
        EllipseParams::new(
            self.center_x * width as f64,
            self.center_y * height as f64,
            self.radius_x * width as f64,
            self.radius_y * height as f64,
            self.fade_width,
        )
    }
}

/// Foreground weight for normalized distance `d`.
pub fn blend_weight(d: f64, fade_width: f64) -> f64 {
    let fade = clamp_fade(fade_width);
    if d.is_nan() {
        return 0.0;
    }
    if fade == 0.0 {
        return if d <= 1.0 { 1.0 } else { 0.0 };
    }
    let inner = 1.0 - fade;
    let outer = 1.0 + fade;
    if d <= inner {
        return 1.0;
    }
    if d >= outer {
        return 0.0;
    }
    let t = (d - inner) / (2.0 * fade);
    (0.5 + 0.5 * (PI * t).cos()).clamp(0.0, 1.0)
}

/// Blend `foreground` over `background` through the ellipse mask.
///
/// Both images must already share dimensions; resize the foreground with
/// [`RasterImage::resized`] first. A mismatch here is a caller bug and is
/// reported as an error rather than patched over.
pub fn composite_ellipse(
    background: &RasterImage,
    foreground: &RasterImage,
    ellipse: &EllipseParams,
    correction: Option<&ColorCorrection>,
) -> Result<RasterImage> {
    if background.dimensions() != foreground.dimensions() {
        let (bw, bh) = background.dimensions();
        let (fw, fh) = foreground.dimensions();
        bail!("dimension mismatch: background is {bw}x{bh}, foreground is {fw}x{fh}");
    }

    let (width, height) = background.dimensions();
    let bg = background.as_raw();
    let fg = foreground.as_raw();
    let mut out = Vec::with_capacity(bg.len());

    for y in 0..height {
        for x in 0..width {
            let offset = (y as usize * width as usize + x as usize) * CHANNELS;
            let bg_px = [bg[offset], bg[offset + 1], bg[offset + 2]];
            let weight = ellipse.weight_at(x, y);
            if weight <= 0.0 {
                out.extend_from_slice(&bg_px);
                continue;
            }
            let mut fg_px = [fg[offset], fg[offset + 1], fg[offset + 2]];
            if let Some(correction) = correction {
                fg_px = correction.apply(fg_px);
            }
            if weight >= 1.0 {
                out.extend_from_slice(&fg_px);
                continue;
            }
            for (fg_value, bg_value) in fg_px.iter().zip(bg_px) {
                let mixed = *fg_value as f64 * weight + bg_value as f64 * (1.0 - weight);
                out.push(mixed.round().clamp(0.0, 255.0) as u8);
            }
        }
    }

    RasterImage::new(width, height, out)
}

fn clamp_fade(fade_width: f64) -> f64 {
    if fade_width.is_nan() {
        return 0.0;
    }
    fade_width.clamp(0.0, 1.0)
}
