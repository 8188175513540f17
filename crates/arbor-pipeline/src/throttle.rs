//! Process-wide throttle state and the parameters derived from it

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub const MIN_LEVEL: f64 = 0.0;
pub const MAX_LEVEL: f64 = 5.0;

/// Written only by the performance controller; everything else holds a [`ThrottleReader`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    pub level: f64,
    pub adaptive_enabled: bool,
}

impl Default for ThrottleState {
    fn default() -> Self {
        ThrottleState {
            level: MIN_LEVEL,
            adaptive_enabled: true,
        }
    }
}

pub type ThrottleReader = watch::Receiver<ThrottleState>;

impl ThrottleState {
    /// `1 + level`, the factor applied to every timing parameter.
    pub fn multiplier(&self) -> f64 {
        1.0 + self.level
    }

    /// Debounce and batch delays grow with the level.
    pub fn scale_delay(&self, base: Duration) -> Duration {
        Duration::from_nanos((base.as_nanos() as f64 * self.multiplier()).round() as u64)
    }

    /// `floor(base / (1 + level))`, never below 1.
    pub fn scale_concurrency(&self, base: usize) -> usize {
        ((base as f64 / self.multiplier()).floor() as usize).max(1)
    }

    /// Frames the renderer may skip between redraws.
    pub fn skip_frames(&self) -> u32 {
        (self.multiplier() - 1.0).floor().max(0.0) as u32
    }
}

/// Clamp to the valid range and drop float noise from repeated step additions.
pub fn clamp_level(level: f64) -> f64 {
    if !level.is_finite() {
        return MIN_LEVEL;
    }
    let rounded = (level * 1000.0).round() / 1000.0;
    rounded.clamp(MIN_LEVEL, MAX_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(level: f64) -> ThrottleState {
        ThrottleState { level, adaptive_enabled: true }
    }

    #[test]
    fn test_delay_scaling() {
        assert_eq!(at(0.0).scale_delay(Duration::from_millis(300)), Duration::from_millis(300));
        assert_eq!(at(1.0).scale_delay(Duration::from_millis(300)), Duration::from_millis(600));
        assert_eq!(at(5.0).scale_delay(Duration::from_millis(100)), Duration::from_millis(600));
    }

    #[test]
    fn test_concurrency_scaling() {
        assert_eq!(at(0.0).scale_concurrency(3), 3);
        assert_eq!(at(0.4).scale_concurrency(3), 2);
        assert_eq!(at(2.0).scale_concurrency(3), 1);
        assert_eq!(at(5.0).scale_concurrency(3), 1);
        assert_eq!(at(1.0).scale_concurrency(8), 4);
    }

    #[test]
    fn test_skip_frames() {
        assert_eq!(at(0.8).skip_frames(), 0);
        assert_eq!(at(2.4).skip_frames(), 2);
    }

    #[test]
    fn test_clamp_level() {
        assert_eq!(clamp_level(-1.0), 0.0);
        assert_eq!(clamp_level(7.0), 5.0);
        assert_eq!(clamp_level(0.1 + 0.2), 0.3);
        assert_eq!(clamp_level(f64::NAN), 0.0);
    }
}
