use coiffe_contracts::presets::CorrectionLevel;

use crate::sampler::ColorSample;

/// Allowed range for each multiplicative ratio plus the mid-tone band of
/// foreground brightness that correction is applied to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionBounds {
    pub ratio_min: f64,
    pub ratio_max: f64,
    pub tone_min: f64,
    pub tone_max: f64,
}

impl CorrectionBounds {
    pub const fn natural() -> Self {
        Self {
            ratio_min: 0.8,
            ratio_max: 1.2,
            tone_min: 20.0,
            tone_max: 220.0,
        }
    }

    pub const fn aggressive() -> Self {
        Self {
            ratio_min: 0.6,
            ratio_max: 1.5,
            tone_min: 20.0,
            tone_max: 220.0,
        }
    }

    pub fn for_level(level: CorrectionLevel) -> Self {
        match level {
            CorrectionLevel::Natural => Self::natural(),
            CorrectionLevel::Aggressive => Self::aggressive(),
        }
    }

    fn clamp_ratio(&self, ratio: f64) -> f64 {
        let (low, high) = if self.ratio_min <= self.ratio_max {
            (self.ratio_min, self.ratio_max)
        } else {
            (self.ratio_max, self.ratio_min)
        };
        if ratio.is_nan() {
            return 1.0_f64.clamp(low, high);
        }
        ratio.clamp(low, high)
    }
}

impl Default for CorrectionBounds {
    fn default() -> Self {
        Self::natural()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorCorrection {
    ratios: [f64; 3],
    tone_min: f64,
    tone_max: f64,
}

impl ColorCorrection {
    /// Ratios that pull `current` toward `reference`, each clamped to `bounds`.
    pub fn derive(reference: ColorSample, current: ColorSample, bounds: &CorrectionBounds) -> Self {
        let ratio = |target: u8, present: u8| {
            bounds.clamp_ratio(target as f64 / (present as f64).max(1.0))
        };
        Self {
            ratios: [
                ratio(reference.r, current.r),
                ratio(reference.g, current.g),
                ratio(reference.b, current.b),
            ],
            tone_min: bounds.tone_min,
            tone_max: bounds.tone_max,
        }
    }

    pub fn identity() -> Self {
        Self {
            ratios: [1.0; 3],
            tone_min: CorrectionBounds::natural().tone_min,
            tone_max: CorrectionBounds::natural().tone_max,
        }
    }

    pub fn ratios(&self) -> [f64; 3] {
        self.ratios
    }

    /// Pixels whose brightness falls outside the mid-tone band pass through.
    pub fn apply(&self, rgb: [u8; 3]) -> [u8; 3] {
        let brightness = (rgb[0] as f64 + rgb[1] as f64 + rgb[2] as f64) / 3.0;
        if brightness < self.tone_min || brightness > self.tone_max {
            return rgb;
        }
        let scale = |value: u8, ratio: f64| (value as f64 * ratio).round().clamp(0.0, 255.0) as u8;
        [
            scale(rgb[0], self.ratios[0]),
            scale(rgb[1], self.ratios[1]),
            scale(rgb[2], self.ratios[2]),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::{ColorCorrection, CorrectionBounds};
    use crate::sampler::ColorSample;

    #[test]
    fn ratios_pull_toward_reference() {
        let correction = ColorCorrection::derive(
            ColorSample::new(110, 100, 90),
            ColorSample::new(100, 100, 100),
            &CorrectionBounds::natural(),
        );
        let [r, g, b] = correction.ratios();
        assert!((r - 1.1).abs() < 1e-9);
        assert!((g - 1.0).abs() < 1e-9);
        assert!((b - 0.9).abs() < 1e-9);
    }

    #[test]
    fn extreme_differences_stay_within_bounds() {
        let near_white = ColorSample::new(250, 250, 250);
        let near_black = ColorSample::new(2, 0, 1);
        for bounds in [CorrectionBounds::natural(), CorrectionBounds::aggressive()] {
            let up = ColorCorrection::derive(near_white, near_black, &bounds);
            let down = ColorCorrection::derive(near_black, near_white, &bounds);
            for ratio in up.ratios().into_iter().chain(down.ratios()) {
                assert!(ratio >= bounds.ratio_min && ratio <= bounds.ratio_max);
            }
            assert_eq!(up.ratios(), [bounds.ratio_max; 3]);
            assert_eq!(down.ratios(), [bounds.ratio_min; 3]);
        }
    }

    #[test]
    fn zero_foreground_channel_does_not_divide_by_zero() {
        let correction = ColorCorrection::derive(
            ColorSample::new(1, 0, 0),
            ColorSample::new(0, 0, 0),
            &CorrectionBounds {
                ratio_min: 0.0,
                ratio_max: 10.0,
                tone_min: 0.0,
                tone_max: 255.0,
            },
        );
        assert_eq!(correction.ratios(), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn apply_scales_mid_tones_and_clamps() {
        let correction = ColorCorrection::derive(
            ColorSample::new(150, 100, 80),
            ColorSample::new(100, 100, 100),
            &CorrectionBounds::aggressive(),
        );
        assert_eq!(correction.apply([200, 100, 10]), [255, 100, 8]);
    }

    #[test]
    fn apply_passes_extreme_tones_through() {
        let correction = ColorCorrection::derive(
            ColorSample::new(150, 100, 80),
            ColorSample::new(100, 100, 100),
            &CorrectionBounds::aggressive(),
        );
        assert_eq!(correction.apply([5, 10, 15]), [5, 10, 15]);
        assert_eq!(correction.apply([240, 235, 250]), [240, 235, 250]);
        assert_eq!(ColorCorrection::identity().apply([90, 80, 70]), [90, 80, 70]);
    }
}
