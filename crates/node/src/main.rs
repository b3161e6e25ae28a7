#[cfg(feature = "adc")]
mod adc;
mod calibration;
mod chat;
mod config;
mod cycle;
mod device;
mod dispatch;
mod mapper;
mod mqtt;
mod ports;
mod sampler;
#[cfg(feature = "sim")]
mod sim;
mod telemetry;
#[cfg(test)]
mod testutil;
mod update;

use anyhow::Result;
use std::{collections::HashMap, env, path::Path, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use calibration::{CalibrationStore, JsonFileStorage};
use chat::TelegramChat;
use config::NodeConfig;
use cycle::Node;
use device::RelayPump;
use ports::TokioClock;
use telemetry::MqttTelemetry;
use update::{HttpSource, UpdateCoordinator};

#[cfg(not(any(feature = "adc", feature = "sim")))]
compile_error!("enable `adc` for the ADS1115 sensor or `sim` for the simulated one");

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let vars: HashMap<String, String> = env::vars().collect();
    let config_path = vars
        .get("NODE_CONFIG")
        .cloned()
        .unwrap_or_else(|| "node.toml".to_string());
    let cfg = config::load(Path::new(&config_path), &vars)?;
    info!(
        node_id = %cfg.node_id,
        config = %config_path,
        interval_s = cfg.cycle_interval_s,
        "moisture node starting"
    );

    // ── Collaborators ───────────────────────────────────────────────
    let clock = TokioClock;
    let mut chat = TelegramChat::new(&cfg.chat)?;
    let sensor = open_sensor(&cfg)?;
    let pump = RelayPump::new(cfg.pump.gpio_pin, cfg.pump.active_low)?;

    // ── Calibration (blocks until a record exists) ──────────────────
    let storage = JsonFileStorage::new(&cfg.calibration_path);
    info!(path = %storage.path().display(), "calibration storage");
    let mut store = CalibrationStore::new(storage);
    let calibration = cycle::boot(&mut store, &mut chat, &clock, &cfg.node_id).await;

    // ── Updates ─────────────────────────────────────────────────────
    let paths = cfg.update_paths()?;
    let program = paths.program.clone();
    let updater = UpdateCoordinator::new(
        HttpSource::new()?,
        cfg.update_url.clone(),
        paths,
        cfg.update_digest()?,
    );

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, commands) = mqtt::connect(&cfg);
    let telemetry = MqttTelemetry::new(client, cfg.data_topic());
    info!(topic = %cfg.data_topic(), "publishing telemetry");

    let mut node = Node {
        node_id: cfg.node_id.clone(),
        calibration,
        cycle_interval: Duration::from_secs(cfg.cycle_interval_s),
        irrigation: Duration::from_secs(cfg.irrigation_s),
        sensor,
        chat,
        pump,
        clock,
        updater,
        telemetry,
        commands,
    };
    node.run().await;

    device::restart(&program)
}

#[cfg(feature = "adc")]
fn open_sensor(cfg: &NodeConfig) -> Result<adc::Ads1115> {
    adc::Ads1115::new(cfg.adc.i2c_addr, cfg.adc.channel)
}

#[cfg(all(feature = "sim", not(feature = "adc")))]
fn open_sensor(cfg: &NodeConfig) -> Result<sim::SimSensor> {
    let scenario = sim::Scenario::from_str_lossy(&cfg.sim.scenario);
    info!(%scenario, "using simulated sensor");
    Ok(sim::SimSensor::new(
        scenario,
        cfg.sim.raw_dry,
        cfg.sim.raw_wet,
    ))
}
