// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Export threshold control loop. The threshold is the number of flow records
//! that may be exported in one update period. Each period the number actually
//! exported is compared with what the configured export rate allows: above it
//! the threshold shrinks, well below it the threshold relaxes back.

use std::time::Duration;
use tracing::debug;

/// Smallest threshold the loop can settle on
pub const MIN_FLOW_SAMPLING_THRESHOLD: u32 = 20;
/// Threshold at startup
pub const DEFAULT_FLOW_SAMPLING_THRESHOLD: u32 = 500;

/// Share of the configured rate under which the threshold relaxes
const UNDERLOAD_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdControl {
    threshold: u32,
    gain: f64,
    /// Records exported in the last completed period
    last_count: u64,
    /// Target ceiling of the last completed period
    last_target: f64,
}

impl ThresholdControl {
    /// A control loop stepping by `gain`, clamped to (0, 1]
    #[must_use]
    pub fn new(gain: f64) -> Self {
        let gain = if gain.is_finite() && gain > 0.0 {
            gain.min(1.0)
        } else {
            1.0
        };
        Self {
            threshold: DEFAULT_FLOW_SAMPLING_THRESHOLD,
            gain,
            last_count: 0,
            last_target: 0.0,
        }
    }
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
    #[must_use]
    pub fn gain(&self) -> f64 {
        self.gain
    }
    #[must_use]
    pub fn last_count(&self) -> u64 {
        self.last_count
    }
    #[must_use]
    pub fn last_target(&self) -> f64 {
        self.last_target
    }

    /// Compute the control state after a period of `elapsed` in which `exported`
    /// records went out, with `rate` records per second configured.
    #[must_use]
    pub fn next(&self, exported: u64, elapsed: Duration, rate: u32) -> Self {
        let target = f64::from(rate) * elapsed.as_secs_f64();
        let current = f64::from(self.threshold);
        #[allow(clippy::cast_precision_loss)]
        let count = exported as f64;

        let updated = if target <= 0.0 {
            // only flows marked for logging go out, nothing to regulate
            current
        } else if count > target {
            let excess = (count - target) / count;
            (current * (1.0 - self.gain * excess)).floor()
        } else if count < target * UNDERLOAD_RATIO {
            let ceiling = target.max(f64::from(DEFAULT_FLOW_SAMPLING_THRESHOLD));
            if current < ceiling {
                (current + self.gain * (ceiling - current)).ceil()
            } else {
                current
            }
        } else {
            current
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let threshold = (updated.min(f64::from(u32::MAX)) as u32).max(MIN_FLOW_SAMPLING_THRESHOLD);
        if threshold != self.threshold {
            debug!(
                "Export threshold {} -> {threshold} ({exported} records, target {target:.0})",
                self.threshold
            );
        }
        Self {
            threshold,
            gain: self.gain,
            last_count: exported,
            last_target: target,
        }
    }
}

impl Default for ThresholdControl {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_THRESHOLD_GAIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(2);

    #[test]
    fn test_default_threshold() {
        let control = ThresholdControl::default();
        assert_eq!(control.threshold(), DEFAULT_FLOW_SAMPLING_THRESHOLD);
    }

    #[test]
    fn test_overload_lowers_threshold() {
        let mut control = ThresholdControl::new(0.5);
        let mut previous = control.threshold();
        // 100 records/s configured, exports keep coming at 10x the rate
        for _ in 0..20 {
            control = control.next(2000, PERIOD, 100);
            assert!(
                control.threshold() < previous
                    || control.threshold() == MIN_FLOW_SAMPLING_THRESHOLD
            );
            previous = control.threshold();
        }
        assert_eq!(control.threshold(), MIN_FLOW_SAMPLING_THRESHOLD);
    }

    #[test]
    fn test_underload_relaxes_threshold() {
        let mut control = ThresholdControl::new(0.5);
        for _ in 0..10 {
            control = control.next(10_000, PERIOD, 100);
        }
        assert_eq!(control.threshold(), MIN_FLOW_SAMPLING_THRESHOLD);
        control = control.next(0, PERIOD, 1000);
        assert!(control.threshold() > MIN_FLOW_SAMPLING_THRESHOLD);
        for _ in 0..30 {
            control = control.next(0, PERIOD, 1000);
        }
        assert_eq!(control.threshold(), 2000);
    }

    #[test]
    fn test_disabled_export_keeps_threshold() {
        let control = ThresholdControl::new(0.5).next(5000, PERIOD, 0);
        assert_eq!(control.threshold(), DEFAULT_FLOW_SAMPLING_THRESHOLD);
        assert_eq!(control.last_count(), 5000);
    }

    #[test]
    fn test_threshold_never_below_floor() {
        bolero::check!()
            .with_type::<(u8, Vec<(u32, u16, u16)>)>()
            .for_each(|(gain, ticks)| {
                let mut control = ThresholdControl::new(f64::from(*gain) / 255.0);
                for (exported, millis, rate) in ticks {
                    let elapsed = Duration::from_millis(u64::from(*millis));
                    control = control.next(u64::from(*exported), elapsed, u32::from(*rate));
                    assert!(control.threshold() >= MIN_FLOW_SAMPLING_THRESHOLD);
                }
            });
    }
}
