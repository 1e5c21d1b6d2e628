//! Down-sampling arithmetic

use chrono::{DateTime, Utc};
use mq_config::ValueSettings;
use std::time::{Duration, Instant};

/// A point in time on both clocks
///
/// Cadence arithmetic uses the monotonic clock; stored rows carry the wall
/// clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub mono: Instant,
    pub wall: DateTime<Utc>,
}

impl Stamp {
    pub fn now() -> Self {
        Self {
            mono: Instant::now(),
            wall: Utc::now(),
        }
    }

    /// The same stamp moved forward on both clocks
    pub fn after(&self, elapsed: Duration) -> Self {
        Self {
            mono: self.mono + elapsed,
            wall: self.wall
                + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Minimum spacing between messages worth examining for one sensor
///
/// The GCD of the value intervals, or zero (no gate) as soon as one value
/// averages, since averaging needs every sample.
pub fn sensor_cadence(values: &[ValueSettings]) -> Duration {
    if values.iter().any(|v| v.averaging) {
        return Duration::ZERO;
    }
    let nanos = values
        .iter()
        .map(|v| v.interval.as_nanos())
        .fold(0, gcd);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Mean of the step-wise linear signal through `samples`
///
/// Each span between consecutive samples contributes the mean of its two
/// endpoints weighted by its length. Returns `None` when the samples do not
/// span any time.
pub fn time_weighted_mean(samples: &[(Instant, f64)]) -> Option<f64> {
    let (first, last) = (samples.first()?, samples.last()?);
    let total = last.0.saturating_duration_since(first.0).as_secs_f64();
    if total <= 0.0 {
        return None;
    }

    let weighted: f64 = samples
        .windows(2)
        .map(|pair| {
            let (t0, v0) = pair[0];
            let (t1, v1) = pair[1];
            (v0 + v1) / 2.0 * t1.saturating_duration_since(t0).as_secs_f64()
        })
        .sum();
    Some(weighted / total)
}
