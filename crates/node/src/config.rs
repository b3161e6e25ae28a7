//! Node configuration: TOML file, environment overrides, validation.
//!
//! Every field has a default, so a node can boot from environment variables
//! alone. The file is read from `NODE_CONFIG` (default `node.toml`); a missing
//! file is not an error.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::update::{parse_sha256, UpdatePaths};

/// Maximum valid ADS1115 single-ended channel index.
const MAX_ADC_CHANNEL: u8 = 3;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    /// First topic segment, e.g. `planta` in `planta/1/data`.
    pub namespace: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub cycle_interval_s: u64,
    pub irrigation_s: u64,
    pub calibration_path: PathBuf,
    /// The program the update coordinator replaces and restarts into.
    /// Defaults to the currently running executable.
    pub program_path: Option<PathBuf>,
    /// Defaults to `<program_path>.bak`.
    pub backup_path: Option<PathBuf>,
    pub update_url: String,
    /// Hex SHA-256 the downloaded artifact must match. Unset means the
    /// artifact is installed unverified.
    pub update_sha256: Option<String>,
    pub chat: ChatConfig,
    pub adc: AdcConfig,
    pub pump: PumpConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
    /// Long-poll timeout passed to the chat API.
    pub poll_timeout_s: u64,
    pub request_timeout_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub i2c_addr: u16,
    pub channel: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub gpio_pin: u8,
    /// Many common relay boards are active-low.
    pub active_low: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub scenario: String,
    pub raw_dry: f64,
    pub raw_wet: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "1".to_string(),
            namespace: "planta".to_string(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            cycle_interval_s: 300,
            irrigation_s: 5,
            calibration_path: PathBuf::from("config.json"),
            program_path: None,
            backup_path: None,
            update_url: String::new(),
            update_sha256: None,
            chat: ChatConfig::default(),
            adc: AdcConfig::default(),
            pump: PumpConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: String::new(),
            chat_id: String::new(),
            poll_timeout_s: 5,
            request_timeout_s: 10,
        }
    }
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            i2c_addr: 0x48,
            channel: 0,
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 17,
            active_low: true,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            scenario: "stable".to_string(),
            raw_dry: 26000.0,
            raw_wet: 12000.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl NodeConfig {
    /// Apply `NODE_ID`, `MQTT_HOST`, ... on top of the file values.
    ///
    /// Takes the variables as a map so tests don't touch the process
    /// environment.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        let get = |k: &str| vars.get(k).filter(|v| !v.is_empty()).cloned();

        if let Some(v) = get("NODE_ID") {
            self.node_id = v;
        }
        if let Some(v) = get("MQTT_HOST") {
            self.mqtt_host = v;
        }
        if let Some(v) = get("MQTT_PORT") {
            self.mqtt_port = v.parse().with_context(|| format!("invalid MQTT_PORT: {v:?}"))?;
        }
        if let Some(v) = get("SAMPLE_EVERY_S") {
            self.cycle_interval_s = v
                .parse()
                .with_context(|| format!("invalid SAMPLE_EVERY_S: {v:?}"))?;
        }
        if let Some(v) = get("CHAT_BOT_TOKEN") {
            self.chat.bot_token = v;
        }
        if let Some(v) = get("CHAT_ID") {
            self.chat.chat_id = v;
        }
        if let Some(v) = get("UPDATE_URL") {
            self.update_url = v;
        }
        if let Some(v) = get("UPDATE_SHA256") {
            self.update_sha256 = Some(v);
        }
        if let Some(v) = get("SIM_SCENARIO") {
            self.sim.scenario = v;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Validate all fields. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.node_id.trim().is_empty() {
            errors.push("node_id is empty".to_string());
        } else if self.node_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "node_id {:?} must not contain MQTT topic characters",
                self.node_id
            ));
        }
        if self.namespace.trim().is_empty() {
            errors.push("namespace is empty".to_string());
        } else if self.namespace.contains(['/', '+', '#']) {
            errors.push(format!(
                "namespace {:?} must not contain MQTT topic characters",
                self.namespace
            ));
        }
        if self.cycle_interval_s == 0 {
            errors.push("cycle_interval_s must be positive".to_string());
        }
        if self.irrigation_s == 0 {
            errors.push("irrigation_s must be positive".to_string());
        }
        if self.chat.poll_timeout_s >= self.chat.request_timeout_s {
            errors.push(format!(
                "chat.poll_timeout_s ({}) must be shorter than chat.request_timeout_s ({})",
                self.chat.poll_timeout_s, self.chat.request_timeout_s
            ));
        }
        if self.adc.channel > MAX_ADC_CHANNEL {
            errors.push(format!(
                "adc.channel {} out of range (0-{MAX_ADC_CHANNEL})",
                self.adc.channel
            ));
        }
        if let Some(digest) = &self.update_sha256 {
            if let Err(e) = parse_sha256(digest) {
                errors.push(format!("update_sha256 is not a hex SHA-256: {e}"));
            }
        }
        if let Err(e) = self.update_paths() {
            errors.push(format!("update paths: {e:#}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    pub fn data_topic(&self) -> String {
        format!("{}/{}/data", self.namespace, self.node_id)
    }

    pub fn irrigation_topic(&self) -> String {
        format!("{}/{}/riego", self.namespace, self.node_id)
    }

    pub fn admin_topic(&self) -> String {
        format!("{}/{}/admin", self.namespace, self.node_id)
    }

    pub fn mqtt_client_id(&self) -> String {
        format!("moisture-node-{}", self.node_id)
    }

    /// Program, staging and backup locations, falling back to the running
    /// executable for the program path.
    pub(crate) fn update_paths(&self) -> Result<UpdatePaths> {
        let program = match &self.program_path {
            Some(p) => p.clone(),
            None => std::env::current_exe().context("cannot locate running executable")?,
        };
        Ok(match &self.backup_path {
            Some(backup) => UpdatePaths::new(program, backup.clone())?,
            None => UpdatePaths::for_program(program),
        })
    }

    pub(crate) fn update_digest(&self) -> Result<Option<[u8; 32]>> {
        self.update_sha256.as_deref().map(parse_sha256).transpose()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, validate.
/// A missing file yields the defaults.
pub fn load(path: &Path, vars: &HashMap<String, String>) -> Result<NodeConfig> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?
    } else {
        NodeConfig::default()
    };

    config.apply_env(vars)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
