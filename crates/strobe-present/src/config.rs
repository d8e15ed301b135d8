// SPDX-License-Identifier: CEPL-1.0
//! `[present]` section of `strobe.toml`.

use std::time::Duration;

use serde::Deserialize;

use crate::backend::SurfaceFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PacingPreference {
    /// Predictive when the backend reports past presentation timing,
    /// reactive otherwise.
    #[default]
    Auto,
    Reactive,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PresentConfig {
    pub desired_buffer_count: u32,
    pub desired_format: SurfaceFormat,
    pub max_recovery_attempts: u32,
    /// Absent means wait forever.
    pub acquire_timeout_ms: Option<u64>,
    pub use_acquire_fences: bool,
    pub pacing: PacingPreference,
    pub reactive: ReactiveConfig,
    pub predictive: PredictiveConfig,
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            desired_buffer_count: 3,
            desired_format: SurfaceFormat::Bgra8Srgb,
            max_recovery_attempts: 4,
            acquire_timeout_ms: None,
            use_acquire_fences: true,
            pacing: PacingPreference::Auto,
            reactive: ReactiveConfig::default(),
            predictive: PredictiveConfig::default(),
        }
    }
}

impl PresentConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReactiveConfig {
    /// Added to the measured average before comparing with the target.
    pub sleep_margin_ms: f64,
    /// How far past the target the average may drift before it is reported.
    pub overrun_warn_ms: f64,
    pub reset_after_samples: u32,
    /// Used when the backend cannot tell the refresh rate.
    pub fallback_refresh_hz: f64,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            sleep_margin_ms: 2.0,
            overrun_warn_ms: 5.0,
            reset_after_samples: 1000,
            fallback_refresh_hz: 60.0,
        }
    }
}

impl ReactiveConfig {
    pub fn sleep_margin(&self) -> Duration {
        Duration::from_secs_f64(self.sleep_margin_ms.max(0.0) / 1000.0)
    }

    pub fn overrun_warn(&self) -> Duration {
        Duration::from_secs_f64(self.overrun_warn_ms.max(0.0) / 1000.0)
    }

    pub fn fallback_refresh(&self) -> Duration {
        let hz = if self.fallback_refresh_hz > 0.0 {
            self.fallback_refresh_hz
        } else {
            60.0
        };
        Duration::from_secs_f64(1.0 / hz)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    /// Weight of the running offset against a new sample.
    pub filter_weight: u32,
    /// Offset samples are clamped to this many refresh periods.
    pub max_offset_refreshes: u32,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            filter_weight: 10,
            max_offset_refreshes: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = PresentConfig::default();
        assert_eq!(c.desired_buffer_count, 3);
        assert_eq!(c.max_recovery_attempts, 4);
        assert_eq!(c.acquire_timeout(), None);
        assert_eq!(c.reactive.sleep_margin(), Duration::from_millis(2));
        assert_eq!(c.predictive.filter_weight, 10);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c: PresentConfig = toml::from_str(
            r#"
            desired_buffer_count = 2
            acquire_timeout_ms = 500
            pacing = "reactive"
            desired_format = "rgba16_float"

            [reactive]
            sleep_margin_ms = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(c.desired_buffer_count, 2);
        assert_eq!(c.acquire_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(c.pacing, PacingPreference::Reactive);
        assert_eq!(c.desired_format, SurfaceFormat::Rgba16Float);
        assert_eq!(c.reactive.sleep_margin_ms, 1.5);
        assert_eq!(c.reactive.reset_after_samples, 1000);
        assert_eq!(c.max_recovery_attempts, 4);
    }

    #[test]
    fn bogus_refresh_falls_back_to_60hz() {
        let r = ReactiveConfig {
            fallback_refresh_hz: 0.0,
            ..Default::default()
        };
        let d = r.fallback_refresh();
        assert!((d.as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }
}
