//! Stable-reading acquisition.
//!
//! A reading is only trusted when a batch of samples agrees with itself:
//! the relative standard deviation of `SAMPLES_PER_ATTEMPT` consecutive
//! conversions must stay within `MAX_DEVIATION_PERCENT`. Up to
//! `MAX_ATTEMPTS` batches are tried before the sensor is declared unstable.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ports::{Clock, Sensor};

pub(crate) const MAX_ATTEMPTS: usize = 5;
pub(crate) const SAMPLES_PER_ATTEMPT: usize = 25;
pub(crate) const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);
pub(crate) const MAX_DEVIATION_PERCENT: f64 = 1.0;

#[derive(Debug, Error)]
pub(crate) enum SampleError {
    #[error("sensor readings unstable after {attempts} attempts")]
    Unstable { attempts: usize },
    #[error("sensor read failed: {0:#}")]
    Sensor(anyhow::Error),
}

/// Mean and population standard deviation of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SampleBatch {
    pub samples: Vec<i32>,
    pub mean: f64,
    pub std_dev: f64,
}

impl SampleBatch {
    pub(crate) fn from_samples(samples: Vec<i32>) -> Self {
        if samples.is_empty() {
            return Self {
                samples,
                mean: 0.0,
                std_dev: 0.0,
            };
        }
        let n = samples.len() as f64;
        let mean = samples.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = samples
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        Self {
            samples,
            mean,
            std_dev: variance.sqrt(),
        }
    }

    /// `100 * stdDev / mean`, or `None` when the mean is not positive.
    /// A negative mean would make any spread look stable.
    pub(crate) fn deviation_percent(&self) -> Option<f64> {
        if self.mean <= 0.0 {
            None
        } else {
            Some(100.0 * self.std_dev / self.mean)
        }
    }
}

/// Draw batches until one is stable, returning its mean.
///
/// A zero-mean batch is discarded without evaluating it but still uses up
/// one of the attempts. No best-effort value is ever returned.
pub(crate) async fn acquire_stable_reading<S, C>(
    sensor: &mut S,
    clock: &C,
) -> Result<f64, SampleError>
where
    S: Sensor,
    C: Clock,
{
    for attempt in 1..=MAX_ATTEMPTS {
        info!(attempt, max = MAX_ATTEMPTS, "sampling batch");

        let mut samples = Vec::with_capacity(SAMPLES_PER_ATTEMPT);
        for _ in 0..SAMPLES_PER_ATTEMPT {
            samples.push(sensor.read_raw().map_err(SampleError::Sensor)?);
            clock.sleep(SAMPLE_INTERVAL).await;
        }

        let batch = SampleBatch::from_samples(samples);
        let Some(deviation) = batch.deviation_percent() else {
            warn!(attempt, mean = batch.mean, "batch mean is not positive; discarding");
            continue;
        };

        debug!(
            attempt,
            samples = batch.samples.len(),
            mean = format_args!("{:.2}", batch.mean),
            std_dev = format_args!("{:.2}", batch.std_dev),
            deviation_pct = format_args!("{deviation:.2}"),
            "batch statistics"
        );

        if deviation <= MAX_DEVIATION_PERCENT {
            info!(attempt, mean = batch.mean, "stable reading acquired");
            return Ok(batch.mean);
        }
    }

    warn!(attempts = MAX_ATTEMPTS, "no stable reading obtained");
    Err(SampleError::Unstable {
        attempts: MAX_ATTEMPTS,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
