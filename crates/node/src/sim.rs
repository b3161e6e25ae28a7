//! Simulated moisture channel for running the node without hardware.
//!
//! Models the behaviour the stability sampler has to cope with:
//! - a slowly wandering "true" soil value (random walk with mean reversion)
//! - gradual drying drift
//! - per-conversion electronic noise
//! - occasional spikes (sensor flakiness)
//!
//! Codes follow an ADS1115 at ±4.096 V, where dry soil reads high.

use std::fmt;

use crate::mapper::VoltScale;
use crate::ports::Sensor;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scenario {
    /// Mid-range, quiet. Batches pass the stability check.
    Stable,
    /// Mid-range, drifting toward dry with moderate noise.
    Drying,
    /// Heavy noise and frequent spikes; batches mostly fail.
    Flaky,
    /// Near the wet end, quiet.
    Wet,
}

impl Scenario {
    pub(crate) fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "drying" => Self::Drying,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Stable,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Drying => write!(f, "drying"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

struct Profile {
    /// Where the soil starts: 0.0 = wet reference, 1.0 = dry reference.
    start_frac: f64,
    drift_per_sample: f64,
    /// Pull back toward the starting value per sample.
    reversion: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    spike_prob: f64,
    spike_sigma: f64,
}

impl Scenario {
    fn profile(self) -> Profile {
        match self {
            Self::Stable => Profile {
                start_frac: 0.5,
                drift_per_sample: 0.0,
                reversion: 0.01,
                walk_sigma: 2.0,
                noise_sigma: 40.0,
                spike_prob: 0.0,
                spike_sigma: 0.0,
            },
            Self::Drying => Profile {
                start_frac: 0.5,
                drift_per_sample: 1.5,
                reversion: 0.0,
                walk_sigma: 4.0,
                noise_sigma: 80.0,
                spike_prob: 0.002,
                spike_sigma: 1500.0,
            },
            Self::Flaky => Profile {
                start_frac: 0.5,
                drift_per_sample: 0.0,
                reversion: 0.02,
                walk_sigma: 20.0,
                noise_sigma: 400.0,
                spike_prob: 0.10,
                spike_sigma: 3000.0,
            },
            Self::Wet => Profile {
                start_frac: 0.15,
                drift_per_sample: 0.3,
                reversion: 0.01,
                walk_sigma: 2.0,
                noise_sigma: 30.0,
                spike_prob: 0.0,
                spike_sigma: 0.0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub(crate) struct SimSensor {
    rng: fastrand::Rng,
    profile: Profile,
    base: f64,
    center: f64,
    raw_dry: f64,
    raw_wet: f64,
}

impl SimSensor {
    /// `raw_dry` / `raw_wet` are the codes the simulated soil produces at the
    /// two extremes; they are what an operator would calibrate with.
    pub(crate) fn new(scenario: Scenario, raw_dry: f64, raw_wet: f64) -> Self {
        Self::with_rng(scenario, raw_dry, raw_wet, fastrand::Rng::new())
    }

    fn with_rng(scenario: Scenario, raw_dry: f64, raw_wet: f64, rng: fastrand::Rng) -> Self {
        let profile = scenario.profile();
        let base = raw_wet + profile.start_frac * (raw_dry - raw_wet);
        tracing::info!(%scenario, base, "simulated sensor initialised");
        Self {
            rng,
            center: base,
            base,
            profile,
            raw_dry,
            raw_wet,
        }
    }

    fn next_code(&mut self) -> i32 {
        let p = &self.profile;

        // Evolve the underlying soil value.
        let pull = p.reversion * (self.center - self.base);
        let walk = p.walk_sigma * approx_std_normal(&mut self.rng);
        let (lo, hi) = (
            self.raw_wet.min(self.raw_dry) - 500.0,
            self.raw_wet.max(self.raw_dry) + 500.0,
        );
        self.base = (self.base + p.drift_per_sample + pull + walk).clamp(lo, hi);

        // Instantaneous conversion.
        let noise = p.noise_sigma * approx_std_normal(&mut self.rng);
        let spike = if self.rng.f64() < p.spike_prob {
            p.spike_sigma * approx_std_normal(&mut self.rng)
        } else {
            0.0
        };

        (self.base + noise + spike).round().clamp(0.0, 32767.0) as i32
    }
}

impl Sensor for SimSensor {
    fn read_raw(&mut self) -> anyhow::Result<i32> {
        Ok(self.next_code())
    }

    fn scale(&self) -> VoltScale {
        VoltScale::ADS1115_4V096
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{SampleBatch, MAX_DEVIATION_PERCENT, SAMPLES_PER_ATTEMPT};

    fn sim(scenario: Scenario, seed: u64) -> SimSensor {
        SimSensor::with_rng(scenario, 26000.0, 12000.0, fastrand::Rng::with_seed(seed))
    }

    fn batch(sensor: &mut SimSensor) -> SampleBatch {
        SampleBatch::from_samples(
            (0..SAMPLES_PER_ATTEMPT)
                .map(|_| sensor.read_raw().unwrap())
                .collect(),
        )
    }

    #[test]
    fn readings_within_adc_range() {
        let mut s = sim(Scenario::Flaky, 1);
        for _ in 0..2000 {
            let v = s.read_raw().unwrap();
            assert!((0..=32767).contains(&v), "ADC out of range: {v}");
        }
    }

    #[test]
    fn stable_batches_pass_tolerance() {
        let mut s = sim(Scenario::Stable, 7);
        for _ in 0..10 {
            let dev = batch(&mut s).deviation_percent().unwrap();
            assert!(dev <= MAX_DEVIATION_PERCENT, "stable deviation {dev:.3}%");
        }
    }

    #[test]
    fn flaky_batches_exceed_tolerance() {
        let mut s = sim(Scenario::Flaky, 7);
        let failing = (0..10)
            .filter(|_| batch(&mut s).deviation_percent().unwrap() > MAX_DEVIATION_PERCENT)
            .count();
        assert!(failing >= 8, "only {failing}/10 flaky batches failed");
    }

    #[test]
    fn wet_scenario_reads_below_midpoint() {
        let mut s = sim(Scenario::Wet, 3);
        let mean = batch(&mut s).mean;
        assert!(mean < 19000.0, "wet mean {mean:.0}");
    }

    #[test]
    fn drying_trends_upward() {
        let mut s = sim(Scenario::Drying, 11);
        let first = batch(&mut s).mean;
        for _ in 0..40 {
            batch(&mut s);
        }
        let later = batch(&mut s).mean;
        assert!(later > first, "drying should raise codes: {first:.0} → {later:.0}");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let mut rng = fastrand::Rng::with_seed(5);
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal(&mut rng)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Stable);
    }

    #[test]
    fn scenario_display_round_trips() {
        for s in [Scenario::Stable, Scenario::Drying, Scenario::Flaky, Scenario::Wet] {
            assert_eq!(Scenario::from_str_lossy(&s.to_string()), s);
        }
    }
}
