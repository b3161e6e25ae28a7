//! Collaborator traits: the boundary between the node's decision logic and
//! the hardware, network, and storage it talks to.
//!
//! ```text
//!   adapter (adc, sim, chat, device, update::HttpSource, calibration::JsonFileStorage)
//!      │ implements
//!      ▼
//!   port trait ──▶ sampler / calibration / dispatch / update / cycle
//! ```
//!
//! Everything is driven from one task, so the async ports are plain
//! `async fn` in traits and consumers take them as generics.

use std::time::Duration;

use crate::calibration::CalibrationRecord;
use crate::mapper::VoltScale;
use crate::update::FetchError;

// ---------------------------------------------------------------------------
// Sensor (hardware → domain)
// ---------------------------------------------------------------------------

/// A single analog moisture channel.
pub(crate) trait Sensor {
    /// One instantaneous raw conversion. Single-ended codes are never
    /// negative.
    fn read_raw(&mut self) -> anyhow::Result<i32>;

    /// The raw-to-volts transform of the converter behind this channel.
    fn scale(&self) -> VoltScale;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Every explicit suspension point in the node goes through this trait so
/// tests can run polling loops without wall-clock delays.
pub(crate) trait Clock {
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TokioClock;

impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ---------------------------------------------------------------------------
// Chat (operator notifications + polled commands)
// ---------------------------------------------------------------------------

pub(crate) trait ChatLink {
    /// Send a text message to the operator chat.
    async fn send(&mut self, text: &str) -> anyhow::Result<()>;

    /// Fetch the next unseen message, if any. Each message is returned once.
    async fn poll(&mut self) -> anyhow::Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

pub(crate) trait Pump {
    fn set_running(&mut self, on: bool);
}

// ---------------------------------------------------------------------------
// Update artifact source
// ---------------------------------------------------------------------------

pub(crate) trait ArtifactSource {
    /// Download the full replacement program body.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

// ---------------------------------------------------------------------------
// Durable calibration record
// ---------------------------------------------------------------------------

pub(crate) trait CalibrationStorage {
    /// Read the persisted record. Any failure (missing, unreadable, malformed)
    /// is an error; the caller decides that an error means "recalibrate".
    fn load(&self) -> anyhow::Result<CalibrationRecord>;

    fn save(&self, record: &CalibrationRecord) -> anyhow::Result<()>;
}
