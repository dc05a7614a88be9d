//! Buffer geometry planning.
//!
//! Translates user-facing capture parameters (time base, time position) into
//! concrete device buffer geometry under hard device ceilings:
//!
//! - Sample rate quantized to an integer submultiple of the hardware maximum
//! - Total buffer length clamped to the device buffer ceiling
//! - Trigger-relative offset clamped to the hardware pre-trigger depth
//! - Rolling-buffer fallback for time spans too long for a single
//!   triggered buffer
//!
//! Planning is a pure computation over its inputs. No I/O, no retained
//! state; the geometry is rederived on every time-base or position change
//! and never persisted.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CaptureError, Result};

/// Fixed transfer-time margin added to one acquisition window when sizing
/// the auto-trigger watchdog interval.
pub const TRANSFER_MARGIN: Duration = Duration::from_millis(100);

/// Hard limits of the capture device, immutable per device.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HardwareLimits {
    /// Maximum sample rate in samples per second.
    #[serde(default = "default_max_sample_rate")]
    pub max_sample_rate: f64,

    /// Maximum device buffer length in samples.
    #[serde(default = "default_max_buffer_samples")]
    pub max_buffer_samples: u64,

    /// Maximum pre/post trigger depth in samples.
    #[serde(default = "default_max_trigger_buffer_samples")]
    pub max_trigger_buffer_samples: u64,

    /// Number of horizontal divisions on the capture display.
    #[serde(default = "default_division_count")]
    pub division_count: u32,
}

fn default_max_sample_rate() -> f64 {
    80_000_000.0
}
fn default_max_buffer_samples() -> u64 {
    500_000
}
fn default_max_trigger_buffer_samples() -> u64 {
    8192
}
fn default_division_count() -> u32 {
    10
}

impl Default for HardwareLimits {
    fn default() -> Self {
        Self {
            max_sample_rate: default_max_sample_rate(),
            max_buffer_samples: default_max_buffer_samples(),
            max_trigger_buffer_samples: default_max_trigger_buffer_samples(),
            division_count: default_division_count(),
        }
    }
}

impl HardwareLimits {
    /// Validate the limits.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_sample_rate > 0.0) || !self.max_sample_rate.is_finite() {
            return Err(CaptureError::invalid_config(format!(
                "max_sample_rate must be positive and finite, got {}",
                self.max_sample_rate
            )));
        }
        if self.max_buffer_samples == 0 {
            return Err(CaptureError::invalid_config(
                "max_buffer_samples must be greater than 0",
            ));
        }
        if self.division_count == 0 {
            return Err(CaptureError::invalid_config(
                "division_count must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Tunables for the geometry planner.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PlannerConfig {
    /// Target buffer fill for one full screen span, in samples.
    #[serde(default = "default_desired_fill_samples")]
    pub desired_fill_samples: u64,

    /// Time span in seconds at or beyond which the planner switches to a
    /// rolling buffer and disables the hardware trigger.
    #[serde(default = "default_streaming_threshold_secs")]
    pub streaming_threshold_secs: f64,

    /// Display refresh rate used to size the rolling buffer.
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: u32,
}

fn default_desired_fill_samples() -> u64 {
    500_000
}
fn default_streaming_threshold_secs() -> f64 {
    11.0
}
fn default_refresh_rate() -> u32 {
    100
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            desired_fill_samples: default_desired_fill_samples(),
            streaming_threshold_secs: default_streaming_threshold_secs(),
            refresh_rate: default_refresh_rate(),
        }
    }
}

impl PlannerConfig {
    /// Validate the planner tunables.
    pub fn validate(&self) -> Result<()> {
        if self.desired_fill_samples == 0 {
            return Err(CaptureError::invalid_config(
                "desired_fill_samples must be greater than 0",
            ));
        }
        if !(self.streaming_threshold_secs > 0.0) {
            return Err(CaptureError::invalid_config(format!(
                "streaming_threshold_secs must be positive, got {}",
                self.streaming_threshold_secs
            )));
        }
        if self.refresh_rate == 0 {
            return Err(CaptureError::invalid_config(
                "refresh_rate must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Concrete device buffer geometry derived from the capture parameters.
///
/// All values are clamped into the hardware's valid ranges; planning never
/// fails for positive time bases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureGeometry {
    /// Chosen sample rate in samples per second. Always an integer-divided
    /// submultiple of the hardware maximum.
    pub sample_rate: f64,

    /// Total device buffer length in samples.
    pub total_samples: u64,

    /// Signed trigger offset in samples relative to the buffer start.
    pub trigger_samples: i64,

    /// Requested time position in seconds, carried for display purposes.
    pub time_position_secs: f64,

    /// True when the rolling-buffer fallback is in effect. The hardware
    /// trigger is disabled entirely for rolling capture.
    pub streaming: bool,
}

/// Pick the highest rate the hardware can produce that does not exceed the
/// ideal rate for filling `desired_samples` over `span_secs`.
///
/// The result is `max_rate / k` for some positive integer `k`. When the
/// ideal rate meets or exceeds the hardware maximum (including the
/// degenerate zero-span case), the maximum rate is used.
pub fn pick_sample_rate(span_secs: f64, desired_samples: u64, max_rate: f64) -> f64 {
    if span_secs <= 0.0 {
        return max_rate;
    }
    let ideal = desired_samples as f64 / span_secs;
    let divider = (max_rate / ideal).ceil();
    if divider > 0.0 && divider.is_finite() {
        max_rate / divider
    } else {
        max_rate
    }
}

/// Derive capture geometry for the given time base and time position.
///
/// `time_base_secs` is seconds per division; the covered span is
/// `time_base_secs * limits.division_count`. When the span reaches
/// `config.streaming_threshold_secs`, the planner emits a reduced rolling
/// buffer (`max_buffer_samples / refresh_rate`) with the trigger disabled
/// instead of one impractically large triggered buffer.
pub fn plan(
    time_base_secs: f64,
    time_position_secs: f64,
    limits: &HardwareLimits,
    config: &PlannerConfig,
) -> CaptureGeometry {
    let span_secs = time_base_secs * f64::from(limits.division_count);
    let sample_rate = pick_sample_rate(span_secs, config.desired_fill_samples, limits.max_sample_rate);

    if span_secs >= config.streaming_threshold_secs {
        let rolling = (limits.max_buffer_samples / u64::from(config.refresh_rate)).max(1);
        return CaptureGeometry {
            sample_rate,
            total_samples: rolling,
            trigger_samples: 0,
            time_position_secs,
            streaming: true,
        };
    }

    let max_trigger = limits.max_trigger_buffer_samples as i64;
    let trigger_samples = (-time_position_secs * sample_rate)
        .round()
        .clamp(-(max_trigger as f64), max_trigger as f64) as i64;

    let total_samples = ((span_secs * sample_rate).round().max(0.0) as u64)
        .min(limits.max_buffer_samples);

    CaptureGeometry {
        sample_rate,
        total_samples,
        trigger_samples,
        time_position_secs,
        streaming: false,
    }
}

/// One acquisition window plus the fixed transfer margin.
///
/// This is the expected wall-clock time for a full buffer to arrive and is
/// the interval used by the auto-trigger watchdog.
pub fn acquisition_window(time_base_secs: f64, division_count: u32) -> Duration {
    let span = (time_base_secs * f64::from(division_count)).max(0.0);
    Duration::from_secs_f64(span) + TRANSFER_MARGIN
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> HardwareLimits {
        HardwareLimits::default()
    }

    fn config() -> PlannerConfig {
        PlannerConfig::default()
    }

    #[test]
    fn test_rate_is_submultiple_of_max() {
        let limits = limits();
        for &tb in &[10e-9, 100e-9, 1e-6, 33e-6, 1e-3, 0.5] {
            let geom = plan(tb, 0.0, &limits, &config());
            assert!(geom.sample_rate <= limits.max_sample_rate, "tb={}", tb);
            let k = limits.max_sample_rate / geom.sample_rate;
            assert!(
                (k - k.round()).abs() < 1e-9,
                "rate {} is not max/k for tb={}",
                geom.sample_rate,
                tb
            );
            assert!(k.round() >= 1.0);
        }
    }

    #[test]
    fn test_clamps_hold_for_all_inputs() {
        let limits = limits();
        for &tb in &[10e-9, 1e-6, 1e-3, 1.0] {
            for &pos in &[-5.0, -1e-3, 0.0, 1e-3, 5.0] {
                let geom = plan(tb, pos, &limits, &config());
                assert!(geom.total_samples <= limits.max_buffer_samples);
                assert!(
                    geom.trigger_samples.unsigned_abs() <= limits.max_trigger_buffer_samples
                );
            }
        }
    }

    #[test]
    fn test_one_millisecond_per_division() {
        // 10 ms span: ideal rate 50 MS/s, quantized down to 80/2 = 40 MS/s,
        // 400k samples total.
        let geom = plan(1e-3, 0.0, &limits(), &config());
        assert_eq!(geom.sample_rate, 40_000_000.0);
        assert_eq!(geom.total_samples, 400_000);
        assert_eq!(geom.trigger_samples, 0);
        assert!(!geom.streaming);
    }

    #[test]
    fn test_zero_divider_falls_back_to_max_rate() {
        // Span so short the ideal rate dwarfs the hardware maximum.
        let geom = plan(1e-12, 0.0, &limits(), &config());
        assert_eq!(geom.sample_rate, limits().max_sample_rate);
        assert_eq!(pick_sample_rate(0.0, 500_000, 80e6), 80e6);
    }

    #[test]
    fn test_trigger_offset_scales_and_clamps() {
        let limits = limits();
        let geom = plan(1e-3, -1e-4, &limits, &config());
        // 1e-4 s at 40 MS/s would be 4000 samples, within the 8192 ceiling.
        assert_eq!(geom.trigger_samples, 4000);

        let geom = plan(1e-3, -1.0, &limits, &config());
        assert_eq!(
            geom.trigger_samples,
            limits.max_trigger_buffer_samples as i64
        );
        let geom = plan(1e-3, 1.0, &limits, &config());
        assert_eq!(
            geom.trigger_samples,
            -(limits.max_trigger_buffer_samples as i64)
        );
    }

    #[test]
    fn test_streaming_fallback() {
        let limits = limits();
        let cfg = config();
        // 1.2 s/div over 10 divisions = 12 s span, past the 11 s threshold.
        let geom = plan(1.2, 0.0, &limits, &cfg);
        assert!(geom.streaming);
        assert_eq!(
            geom.total_samples,
            limits.max_buffer_samples / u64::from(cfg.refresh_rate)
        );
        assert_eq!(geom.trigger_samples, 0);
    }

    #[test]
    fn test_acquisition_window() {
        let window = acquisition_window(1e-3, 10);
        assert_eq!(window, Duration::from_millis(10) + TRANSFER_MARGIN);
    }

    #[test]
    fn test_limits_validation() {
        assert!(HardwareLimits::default().validate().is_ok());
        let bad = HardwareLimits {
            max_sample_rate: 0.0,
            ..HardwareLimits::default()
        };
        assert!(bad.validate().is_err());
        let bad = HardwareLimits {
            division_count: 0,
            ..HardwareLimits::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_planner_config_validation() {
        assert!(PlannerConfig::default().validate().is_ok());
        let bad = PlannerConfig {
            refresh_rate: 0,
            ..PlannerConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
