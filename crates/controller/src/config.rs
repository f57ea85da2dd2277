//! TOML config file loading and validation: broker, topics, relay wiring,
//! zones, controller cadence and the watering classifier.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::UtcOffset;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: Topics,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub relays: RelayConfig,
    #[serde(default = "default_zones")]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_sec: u64,
}

/// Topic names. Inbound: `task`, `monitor`. Outbound: everything, including
/// `monitor`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub task: String,
    pub monitor: String,
    pub soil: String,
    pub level: String,
    pub task_list: String,
    pub task_history: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_sec: u64,
    pub utc_offset_minutes: i32,
    /// Start in automatic watering mode.
    pub automatic: bool,
    /// Level added to a mixer per tick while it charges.
    pub mixer_step: i32,
    /// Water drawn per tick for each mixer still charging.
    pub task_water_drain: i32,
    /// Water drawn per tick for each zone being watered.
    pub zone_water_drain: i32,
}

/// Relay channel per actuator (1-8 on the relay board).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mixer1: u8,
    pub mixer2: u8,
    pub mixer3: u8,
    pub pumpin: u8,
    pub pumpout: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub relay: u8,
}

/// Standard-scaler + logistic model over `[moisture, temperature, humidity]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub means: [f32; 3],
    pub scales: [f32; 3],
    pub weights: [f32; 3],
    pub bias: f32,
    pub threshold: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Probability that any single relay write or sensor read fails.
    pub fail_rate: f64,
    pub seed: Option<u64>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "fertigation-controller".to_string(),
            username: None,
            password: None,
            keep_alive_sec: 30,
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            task: "task".to_string(),
            monitor: "monitor".to_string(),
            soil: "soil".to_string(),
            level: "level".to_string(),
            task_list: "taskList".to_string(),
            task_history: "taskHistory".to_string(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_sec: 5,
            utc_offset_minutes: 0,
            automatic: false,
            mixer_step: 1,
            task_water_drain: 1,
            zone_water_drain: 1,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mixer1: 1,
            mixer2: 2,
            mixer3: 3,
            pumpin: 7,
            pumpout: 8,
        }
    }
}

fn default_zones() -> Vec<ZoneEntry> {
    (1..=3)
        .map(|i| ZoneEntry {
            zone_id: format!("area{i}"),
            relay: 3 + i,
        })
        .collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            means: [50.0, 25.0, 60.0],
            scales: [20.0, 5.0, 15.0],
            weights: [-3.0, 0.8, -0.6],
            bias: 0.0,
            threshold: 0.5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            topics: Topics::default(),
            controller: ControllerConfig::default(),
            relays: RelayConfig::default(),
            zones: default_zones(),
            classifier: ClassifierConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Relay board limits
// ---------------------------------------------------------------------------

/// Channels on the RS485 relay board.
pub const RELAY_CHANNELS: std::ops::RangeInclusive<u8> = 1..=8;

/// Largest UTC offset `time` accepts, in minutes.
const MAX_OFFSET_MIN: i32 = 18 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_topics(&mut errors);
        self.validate_controller(&mut errors);
        self.validate_relays(&mut errors);
        self.validate_classifier(&mut errors);

        if !(0.0..=1.0).contains(&self.sim.fail_rate) {
            errors.push(format!(
                "sim.fail_rate {} out of range [0.0, 1.0]",
                self.sim.fail_rate
            ));
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

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if self.mqtt.keep_alive_sec == 0 {
            errors.push("mqtt.keep_alive_sec must be positive".to_string());
        }
        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            errors.push("mqtt.password set without mqtt.username".to_string());
        }
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let t = &self.topics;
        for (key, value) in [
            ("task", &t.task),
            ("monitor", &t.monitor),
            ("soil", &t.soil),
            ("level", &t.level),
            ("task_list", &t.task_list),
            ("task_history", &t.task_history),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("topics.{key} is empty"));
            } else if value.contains(['+', '#']) {
                errors.push(format!("topics.{key} '{value}' contains a wildcard"));
            }
        }
        if !t.task.is_empty() && t.task == t.monitor {
            errors.push(format!(
                "topics.task and topics.monitor are both '{}'",
                t.task
            ));
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if c.tick_sec == 0 {
            errors.push("controller.tick_sec must be positive".to_string());
        }
        if c.utc_offset_minutes.abs() > MAX_OFFSET_MIN {
            errors.push(format!(
                "controller.utc_offset_minutes {} out of range [-{MAX_OFFSET_MIN}, {MAX_OFFSET_MIN}]",
                c.utc_offset_minutes
            ));
        }
        for (key, value) in [
            ("mixer_step", c.mixer_step),
            ("task_water_drain", c.task_water_drain),
            ("zone_water_drain", c.zone_water_drain),
        ] {
            if !(1..=100).contains(&value) {
                errors.push(format!(
                    "controller.{key} {value} out of range [1, 100]"
                ));
            }
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<u8> = HashSet::new();
        let mut check = |what: String, channel: u8, errors: &mut Vec<String>| {
            if !RELAY_CHANNELS.contains(&channel) {
                errors.push(format!(
                    "{what}: relay {channel} is not a board channel (allowed: 1-8)"
                ));
            } else if !seen.insert(channel) {
                errors.push(format!("{what}: relay {channel} is already in use"));
            }
        };

        let r = &self.relays;
        for (key, channel) in [
            ("mixer1", r.mixer1),
            ("mixer2", r.mixer2),
            ("mixer3", r.mixer3),
            ("pumpin", r.pumpin),
            ("pumpout", r.pumpout),
        ] {
            check(format!("relays.{key}"), channel, errors);
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, z) in self.zones.iter().enumerate() {
            let ctx = if z.zone_id.trim().is_empty() {
                format!("zones[{i}]")
            } else {
                format!("zone '{}'", z.zone_id)
            };

            if z.zone_id.trim().is_empty() {
                errors.push(format!("{ctx}: zone_id is empty"));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{ctx}: duplicate zone_id"));
            }
            check(ctx, z.relay, errors);
        }
    }

    fn validate_classifier(&self, errors: &mut Vec<String>) {
        let c = &self.classifier;
        for (i, scale) in c.scales.iter().enumerate() {
            if !scale.is_finite() || *scale == 0.0 {
                errors.push(format!(
                    "classifier.scales[{i}] must be finite and non-zero, got {scale}"
                ));
            }
        }
        let all_finite = c
            .means
            .iter()
            .chain(c.weights.iter())
            .chain(std::iter::once(&c.bias))
            .all(|v| v.is_finite());
        if !all_finite {
            errors.push("classifier means/weights/bias must be finite".to_string());
        }
        if !(c.threshold > 0.0 && c.threshold < 1.0) {
            errors.push(format!(
                "classifier.threshold {} out of range (0.0, 1.0)",
                c.threshold
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    pub fn zone_ids(&self) -> Vec<String> {
        self.zones.iter().map(|z| z.zone_id.clone()).collect()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.controller.tick_sec)
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.controller.utc_offset_minutes * 60)
            .context("controller.utc_offset_minutes out of range")
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Broker overrides from `MQTT_HOST` / `MQTT_PORT`.
pub fn apply_env(config: &mut Config) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
    {
        config.mqtt.port = port;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
