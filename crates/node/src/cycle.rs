//! Boot sequence and the unbounded measurement cycle.
//!
//! One cycle runs strictly in order:
//!
//! ```text
//! acquire ─▶ map ─▶ publish ─▶ drain MQTT commands ─▶ poll chat ─▶ dispatch
//! ```
//!
//! Measurement failures are reported to the operator chat and never end the
//! loop. Only a dispatched restart (admin command or installed update) does.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::calibration::{CalibrationRecord, CalibrationStore};
use crate::dispatch::{Channel, Command, Directive, Dispatcher};
use crate::mapper::{map_to_percent, MapError};
use crate::mqtt;
use crate::ports::{ArtifactSource, CalibrationStorage, ChatLink, Clock, Pump, Sensor};
use crate::sampler::{acquire_stable_reading, SampleError};
use crate::telemetry::{Reading, TelemetryPayload, TelemetrySink};
use crate::update::UpdateCoordinator;

#[derive(Debug, Error)]
pub(crate) enum CycleError {
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("telemetry publish failed: {0:#}")]
    Transport(anyhow::Error),
}

/// Load the persisted calibration, or walk the operator through acquiring
/// one. Nothing else starts until this returns.
pub(crate) async fn boot<St, L, C>(
    store: &mut CalibrationStore<St>,
    chat: &mut L,
    clock: &C,
    node_id: &str,
) -> CalibrationRecord
where
    St: CalibrationStorage,
    L: ChatLink,
    C: Clock,
{
    let record = store.ensure_calibrated(chat, clock, node_id).await;
    info!(
        node_id,
        dry = record.dry.raw,
        wet = record.wet.raw,
        "boot calibration ready"
    );
    record
}

pub(crate) struct Node<S, L, P, C, A, T> {
    pub node_id: String,
    pub calibration: CalibrationRecord,
    pub cycle_interval: Duration,
    pub irrigation: Duration,
    pub sensor: S,
    pub chat: L,
    pub pump: P,
    pub clock: C,
    pub updater: UpdateCoordinator<A>,
    pub telemetry: T,
    pub commands: mpsc::UnboundedReceiver<Command>,
}

impl<S, L, P, C, A, T> Node<S, L, P, C, A, T>
where
    S: Sensor,
    L: ChatLink,
    P: Pump,
    C: Clock,
    A: ArtifactSource,
    T: TelemetrySink,
{
    /// Cycle until a restart is required.
    pub(crate) async fn run(&mut self) {
        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            info!(cycle, "cycle started");
            if self.run_cycle().await == Directive::Restart {
                info!(cycle, "restart requested; leaving cycle loop");
                return;
            }
            info!(
                cycle,
                sleep_s = self.cycle_interval.as_secs(),
                "cycle complete"
            );
            self.clock.sleep(self.cycle_interval).await;
        }
    }

    pub(crate) async fn run_cycle(&mut self) -> Directive {
        match self.measure().await {
            Ok(reading) => {
                if let Err(e) = self.publish(&reading).await {
                    self.recover(e).await;
                }
            }
            Err(e) => self.recover(e).await,
        }

        let mut commands = mqtt::drain(&mut self.commands);
        match self.chat.poll().await {
            Ok(Some(text)) => commands.push(Command::new(Channel::Chat, text)),
            Ok(None) => {}
            Err(e) => warn!("chat poll failed: {e:#}"),
        }

        for command in &commands {
            let directive = Dispatcher {
                node_id: &self.node_id,
                irrigation: self.irrigation,
                pump: &mut self.pump,
                chat: &mut self.chat,
                clock: &self.clock,
                updater: &self.updater,
            }
            .dispatch(command)
            .await;

            if directive == Directive::Restart {
                return Directive::Restart;
            }
        }
        Directive::Continue
    }

    async fn measure(&mut self) -> Result<Reading, CycleError> {
        let raw_mean = acquire_stable_reading(&mut self.sensor, &self.clock).await?;
        let percentages = map_to_percent(raw_mean, &self.calibration, &self.sensor.scale())?;
        Ok(Reading::new(&self.node_id, raw_mean, percentages))
    }

    async fn publish(&mut self, reading: &Reading) -> Result<(), CycleError> {
        info!(
            raw = reading.raw_mean,
            percent_raw = reading.percent_raw,
            percent_v = reading.percent_voltage,
            at = %reading.timestamp,
            "reading acquired"
        );
        self.telemetry
            .publish(&TelemetryPayload::from(reading))
            .await
            .map_err(CycleError::Transport)
    }

    /// Report a failed measurement or publish and carry on with the cycle.
    async fn recover(&mut self, e: CycleError) {
        let id = &self.node_id;
        let text = match &e {
            CycleError::Sample(SampleError::Unstable { .. }) => {
                format!("WARNING! The sensor on node {id} seems to have a problem. Unstable readings.")
            }
            CycleError::Sample(SampleError::Sensor(_)) => {
                format!("WARNING! Node {id} could not read its sensor: {e}")
            }
            CycleError::Map(_) => format!("WARNING! Node {id} skipped this reading: {e}"),
            CycleError::Transport(_) => format!("WARNING! Node {id} could not publish: {e}"),
        };
        warn!("cycle degraded: {e}");

        if let Err(send_err) = self.chat.send(&text).await {
            error!("operator notification failed: {send_err:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
