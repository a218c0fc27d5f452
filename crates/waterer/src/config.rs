//! TOML config file loading, environment overrides and validation.
//!
//! Every section has defaults, so an empty (or absent) file describes a
//! runnable development setup: mock board, simulated sensor, local sqlite.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::hardware::MCP3008_MAX_CHANNEL;
use crate::thresholds::Thresholds;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub pump: PumpConfig,
    pub sensor: SensorConfig,
    pub control: ControlConfig,
    pub reservoir: ReservoirConfig,
    pub manual: ManualConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:plant_data.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub in1_pin: i64,
    /// Second motor-driver input. Leave unset for a single relay pin.
    pub in2_pin: Option<i64>,
    /// Relay polarity. Ignored when driving a motor driver pair.
    pub active_low: bool,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            in1_pin: 17,
            in2_pin: Some(18),
            active_low: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorMode {
    Analog,
    Digital,
    Simulated,
}

impl SensorMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "analog" => Some(Self::Analog),
            "digital" => Some(Self::Digital),
            "simulated" | "sim" => Some(Self::Simulated),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub mode: SensorMode,
    /// LM393 digital output (HIGH = dry).
    pub signal_pin: i64,
    pub adc_channel: i64,
    pub vref: f64,
    /// Calibration voltage of bone-dry soil.
    pub dry_v: f64,
    /// Calibration voltage of saturated soil.
    pub wet_v: f64,
    /// Consecutive failed reads after which the last value stops being reused.
    pub max_stale_cycles: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            mode: if cfg!(feature = "gpio") {
                SensorMode::Analog
            } else {
                SensorMode::Simulated
            },
            signal_pin: 21,
            adc_channel: 0,
            vref: 3.3,
            dry_v: 2.8,
            wet_v: 1.2,
            max_stale_cycles: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub sample_interval_ms: u64,
    /// Seed values, used only until thresholds are stored in the database.
    pub dry_threshold: i64,
    pub wet_threshold: i64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            dry_threshold: 30,
            wet_threshold: 60,
        }
    }
}

impl ControlConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReservoirConfig {
    pub capacity_ml: i64,
    /// Estimated pump throughput.
    pub ml_per_sec: f64,
    /// Levels at or below this are reported as LOW.
    pub low_level_ml: i64,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            capacity_ml: 500,
            ml_per_sec: 10.0,
            low_level_ml: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    pub default_sec: i64,
    pub min_sec: i64,
    pub max_sec: i64,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            default_sec: 5,
            min_sec: 1,
            max_sec: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_pins(&mut errors);
        self.validate_sensor(&mut errors);
        self.validate_control(&mut errors);
        self.validate_reservoir(&mut errors);
        self.validate_manual(&mut errors);

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

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<i64> = HashSet::new();
        let pins = [
            ("pump.in1_pin", Some(self.pump.in1_pin)),
            ("pump.in2_pin", self.pump.in2_pin),
            ("sensor.signal_pin", Some(self.sensor.signal_pin)),
        ];

        for (name, pin) in pins {
            let Some(pin) = pin else { continue };
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("{name}: pin {pin} is already in use"));
            }
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;

        if !(0..=MCP3008_MAX_CHANNEL).contains(&s.adc_channel) {
            errors.push(format!(
                "sensor.adc_channel {} out of MCP3008 range [0, {MCP3008_MAX_CHANNEL}]",
                s.adc_channel
            ));
        }
        if !s.vref.is_finite() || s.vref <= 0.0 {
            errors.push(format!("sensor.vref must be positive, got {}", s.vref));
        }
        for (name, v) in [("dry_v", s.dry_v), ("wet_v", s.wet_v)] {
            if !v.is_finite() || v < 0.0 || v > s.vref {
                errors.push(format!(
                    "sensor.{name} {v} out of range [0, vref={}]",
                    s.vref
                ));
            }
        }
        if s.dry_v == s.wet_v {
            errors.push(format!(
                "sensor: dry_v and wet_v are both {}, calibration range is zero",
                s.dry_v
            ));
        }
        if s.max_stale_cycles == 0 {
            errors.push("sensor.max_stale_cycles must be positive".to_string());
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;

        if c.sample_interval_ms == 0 {
            errors.push("control.sample_interval_ms must be positive".to_string());
        }
        if let Err(e) = Thresholds::new(c.dry_threshold, c.wet_threshold) {
            errors.push(format!("control: {e}"));
        }
    }

    fn validate_reservoir(&self, errors: &mut Vec<String>) {
        let r = &self.reservoir;

        if r.capacity_ml <= 0 {
            errors.push(format!(
                "reservoir.capacity_ml must be positive, got {}",
                r.capacity_ml
            ));
        }
        if !r.ml_per_sec.is_finite() || r.ml_per_sec <= 0.0 {
            errors.push(format!(
                "reservoir.ml_per_sec must be positive, got {}",
                r.ml_per_sec
            ));
        }
        if r.low_level_ml < 0 || r.low_level_ml >= r.capacity_ml {
            errors.push(format!(
                "reservoir.low_level_ml ({}) must be within [0, capacity_ml={})",
                r.low_level_ml, r.capacity_ml
            ));
        }
    }

    fn validate_manual(&self, errors: &mut Vec<String>) {
        let m = &self.manual;

        if m.min_sec < 1 {
            errors.push(format!("manual.min_sec must be at least 1, got {}", m.min_sec));
        }
        if !(m.min_sec <= m.default_sec && m.default_sec <= m.max_sec) {
            errors.push(format!(
                "manual: expected min_sec <= default_sec <= max_sec, got {} / {} / {}",
                m.min_sec, m.default_sec, m.max_sec
            ));
        }
    }

    /// Apply `DB_URL`, `WEB_PORT` and `SENSOR_MODE` from the environment.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("DB_URL") {
            self.database.url = url;
        }
        if let Ok(port) = env::var("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("invalid WEB_PORT '{port}'"))?;
        }
        if let Ok(mode) = env::var("SENSOR_MODE") {
            self.sensor.mode = SensorMode::parse(&mode)
                .with_context(|| format!("invalid SENSOR_MODE '{mode}'"))?;
        }
        Ok(())
    }

    pub fn seed_thresholds(&self) -> Result<Thresholds> {
        Thresholds::new(self.control.dry_threshold, self.control.wet_threshold)
            .context("invalid seed thresholds")
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but falls back to defaults when the file does not exist.
/// Environment overrides are applied and the result re-validated.
pub fn load_or_default(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        load(path)?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_env()?;
    config.validate().context("invalid config after env overrides")?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
