//! Moisture sensing strategies and the fault-tolerant reader the control loop
//! samples once per cycle.

use crate::config::{SensorConfig, SensorMode};
use crate::error::SensorError;
use crate::hardware::Hardware;

/// Wet sentinel returned when no trustworthy reading exists. It can only ever
/// switch the pump OFF.
pub const FAILSAFE_PERCENT: u8 = 100;

/// One strategy for turning board signals into a moisture percentage.
pub trait MoistureSensor: Send + Sync {
    fn name(&self) -> &'static str;

    fn read_percent(&mut self, hw: &mut dyn Hardware) -> Result<u8, SensorError>;

    /// Told the commanded pump state every cycle. Only the simulator cares.
    fn observe_pump(&mut self, _on: bool) {}
}

// ---------------------------------------------------------------------------
// Digital (LM393 comparator output)
// ---------------------------------------------------------------------------

/// HIGH means the comparator sees dry soil.
pub struct DigitalSensor;

impl MoistureSensor for DigitalSensor {
    fn name(&self) -> &'static str {
        "digital"
    }

    fn read_percent(&mut self, hw: &mut dyn Hardware) -> Result<u8, SensorError> {
        let dry = hw.read_digital_signal()?;
        Ok(if dry { 0 } else { 100 })
    }
}

// ---------------------------------------------------------------------------
// Analog (voltage through the ADC)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub dry_v: f64,
    pub wet_v: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            dry_v: 2.8,
            wet_v: 1.2,
        }
    }
}

impl Calibration {
    /// Linear map from the dry endpoint (0 %) to the wet endpoint (100 %),
    /// saturating outside the calibrated range.
    pub fn voltage_to_percent(&self, volts: f64) -> Result<u8, SensorError> {
        if !volts.is_finite() || volts < 0.0 {
            return Err(SensorError::Implausible(volts));
        }
        let ratio = (self.dry_v - volts) / (self.dry_v - self.wet_v);
        Ok((ratio * 100.0).round().clamp(0.0, 100.0) as u8)
    }
}

pub struct AnalogSensor {
    calibration: Calibration,
}

impl AnalogSensor {
    pub fn new(calibration: Calibration) -> Self {
        Self { calibration }
    }
}

impl MoistureSensor for AnalogSensor {
    fn name(&self) -> &'static str {
        "analog"
    }

    fn read_percent(&mut self, hw: &mut dyn Hardware) -> Result<u8, SensorError> {
        let volts = hw.read_analog_voltage()?;
        self.calibration.voltage_to_percent(volts)
    }
}

// ---------------------------------------------------------------------------
// Simulated (random walk, no hardware)
// ---------------------------------------------------------------------------

/// Approximate N(0,1) by the Irwin-Hall sum of 12 uniforms.
fn std_normal(rng: &mut fastrand::Rng) -> f64 {
    (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0
}

/// Soil that dries a little every sample, wanders, drifts back toward a
/// resting level and soaks up water while the pump runs.
pub struct SimulatedSensor {
    rng: fastrand::Rng,
    level: f64,
    pumping: bool,
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    resting: f64,
    soak_rate: f64,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self::from_rng(fastrand::Rng::new())
    }

    /// Reproducible walk for tests.
    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(fastrand::Rng::with_seed(seed))
    }

    fn from_rng(mut rng: fastrand::Rng) -> Self {
        let level = 45.0 + 5.0 * std_normal(&mut rng);
        Self {
            rng,
            level,
            pumping: false,
            drift: -0.4,
            walk_sigma: 0.6,
            mean_reversion: 0.005,
            resting: 40.0,
            soak_rate: 4.0,
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl MoistureSensor for SimulatedSensor {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn read_percent(&mut self, _hw: &mut dyn Hardware) -> Result<u8, SensorError> {
        let pull = self.mean_reversion * (self.resting - self.level);
        let walk = self.walk_sigma * std_normal(&mut self.rng);
        let soak = if self.pumping { self.soak_rate } else { 0.0 };

        self.level = (self.level + self.drift + pull + walk + soak).clamp(0.0, 100.0);
        Ok(self.level.round() as u8)
    }

    fn observe_pump(&mut self, on: bool) {
        self.pumping = on;
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub percent: u8,
    /// False when the value is a reused or sentinel reading.
    pub fresh: bool,
}

/// Wraps a strategy so a read never fails: errors fall back to the last good
/// value, and after `max_stale` consecutive failures to [`FAILSAFE_PERCENT`].
pub struct SensorReader {
    sensor: Box<dyn MoistureSensor>,
    last_good: Option<u8>,
    failures: u32,
    max_stale: u32,
}

impl SensorReader {
    pub fn new(sensor: Box<dyn MoistureSensor>, max_stale: u32) -> Self {
        Self {
            sensor,
            last_good: None,
            failures: 0,
            max_stale,
        }
    }

    pub fn from_config(cfg: &SensorConfig) -> Self {
        let sensor: Box<dyn MoistureSensor> = match cfg.mode {
            SensorMode::Digital => Box::new(DigitalSensor),
            SensorMode::Analog => Box::new(AnalogSensor::new(Calibration {
                dry_v: cfg.dry_v,
                wet_v: cfg.wet_v,
            })),
            SensorMode::Simulated => Box::new(SimulatedSensor::new()),
        };
        tracing::info!(mode = sensor.name(), "moisture sensor ready");
        Self::new(sensor, cfg.max_stale_cycles)
    }

    pub fn observe_pump(&mut self, on: bool) {
        self.sensor.observe_pump(on);
    }

    pub fn read(&mut self, hw: &mut dyn Hardware) -> Sample {
        match self.sensor.read_percent(hw) {
            Ok(percent) => {
                if self.failures > 0 {
                    tracing::info!(failures = self.failures, "sensor recovered");
                }
                self.last_good = Some(percent);
                self.failures = 0;
                Sample {
                    percent,
                    fresh: true,
                }
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                match self.last_good {
                    Some(last) if self.failures <= self.max_stale => {
                        tracing::warn!(
                            failures = self.failures,
                            last,
                            "sensor read failed, reusing last value: {e}"
                        );
                        Sample {
                            percent: last,
                            fresh: false,
                        }
                    }
                    _ => {
                        tracing::error!(
                            failures = self.failures,
                            sentinel = FAILSAFE_PERCENT,
                            "sensor read failed, no usable value: {e}"
                        );
                        Sample {
                            percent: FAILSAFE_PERCENT,
                            fresh: false,
                        }
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockBoard;

    // -- Calibration --------------------------------------------------------

    #[test]
    fn midpoint_voltage_is_fifty_percent() {
        let cal = Calibration::default();
        assert_eq!(cal.voltage_to_percent(2.0).unwrap(), 50);
    }

    #[test]
    fn endpoints_map_to_zero_and_hundred() {
        let cal = Calibration::default();
        assert_eq!(cal.voltage_to_percent(2.8).unwrap(), 0);
        assert_eq!(cal.voltage_to_percent(1.2).unwrap(), 100);
    }

    #[test]
    fn out_of_range_voltage_saturates() {
        let cal = Calibration::default();
        assert_eq!(cal.voltage_to_percent(3.3).unwrap(), 0);
        assert_eq!(cal.voltage_to_percent(0.0).unwrap(), 100);
    }

    #[test]
    fn inverted_calibration_still_maps_correctly() {
        // Some probes read higher when wet.
        let cal = Calibration {
            dry_v: 1.0,
            wet_v: 3.0,
        };
        assert_eq!(cal.voltage_to_percent(2.0).unwrap(), 50);
        assert_eq!(cal.voltage_to_percent(3.3).unwrap(), 100);
    }

    #[test]
    fn nan_voltage_is_implausible() {
        let cal = Calibration::default();
        assert!(matches!(
            cal.voltage_to_percent(f64::NAN),
            Err(SensorError::Implausible(_))
        ));
    }

    // -- Strategies ---------------------------------------------------------

    #[test]
    fn digital_high_is_dry() {
        let board = MockBoard::new();
        let mut hw = board.clone();
        let mut sensor = DigitalSensor;

        board.set_signal(true);
        assert_eq!(sensor.read_percent(&mut hw).unwrap(), 0);
        board.set_signal(false);
        assert_eq!(sensor.read_percent(&mut hw).unwrap(), 100);
    }

    #[test]
    fn analog_reads_through_the_board() {
        let board = MockBoard::new();
        let mut hw = board.clone();
        let mut sensor = AnalogSensor::new(Calibration::default());

        board.set_voltage(2.0);
        assert_eq!(sensor.read_percent(&mut hw).unwrap(), 50);
    }

    #[test]
    fn simulated_stays_in_range() {
        let mut hw = MockBoard::new();
        let mut sensor = SimulatedSensor::with_seed(7);
        for _ in 0..2_000 {
            assert!(sensor.read_percent(&mut hw).unwrap() <= 100);
        }
    }

    #[test]
    fn simulated_dries_without_water() {
        let mut hw = MockBoard::new();
        let mut sensor = SimulatedSensor::with_seed(42);
        let first = sensor.read_percent(&mut hw).unwrap();
        let mut last = first;
        for _ in 0..100 {
            last = sensor.read_percent(&mut hw).unwrap();
        }
        assert!(last < first, "expected drying: {first} -> {last}");
    }

    #[test]
    fn simulated_rises_while_pumping() {
        let mut hw = MockBoard::new();
        let mut sensor = SimulatedSensor::with_seed(42);
        let before = sensor.read_percent(&mut hw).unwrap();
        sensor.observe_pump(true);
        let mut after = before;
        for _ in 0..10 {
            after = sensor.read_percent(&mut hw).unwrap();
        }
        assert!(after > before, "expected wetting: {before} -> {after}");
    }

    #[test]
    fn simulated_seed_is_reproducible() {
        let mut hw = MockBoard::new();
        let mut a = SimulatedSensor::with_seed(3);
        let mut b = SimulatedSensor::with_seed(3);
        for _ in 0..50 {
            assert_eq!(
                a.read_percent(&mut hw).unwrap(),
                b.read_percent(&mut hw).unwrap()
            );
        }
    }

    // -- SensorReader -------------------------------------------------------

    fn analog_reader(max_stale: u32) -> SensorReader {
        SensorReader::new(Box::new(AnalogSensor::new(Calibration::default())), max_stale)
    }

    #[test]
    fn fresh_read_is_marked_fresh() {
        let board = MockBoard::new();
        let mut hw = board.clone();
        let mut reader = analog_reader(3);

        assert_eq!(
            reader.read(&mut hw),
            Sample {
                percent: 50,
                fresh: true
            }
        );
    }

    #[test]
    fn failure_reuses_last_good_value() {
        let board = MockBoard::new();
        let mut hw = board.clone();
        let mut reader = analog_reader(3);

        reader.read(&mut hw);
        board.set_voltage(1.2);
        board.fail_next_reads(1);
        assert_eq!(
            reader.read(&mut hw),
            Sample {
                percent: 50,
                fresh: false
            }
        );
        assert_eq!(reader.read(&mut hw).percent, 100);
    }

    #[test]
    fn failure_without_history_returns_sentinel() {
        let board = MockBoard::new();
        let mut hw = board.clone();
        let mut reader = analog_reader(3);

        board.fail_next_reads(1);
        assert_eq!(
            reader.read(&mut hw),
            Sample {
                percent: FAILSAFE_PERCENT,
                fresh: false
            }
        );
    }

    #[test]
    fn prolonged_failure_falls_back_to_sentinel() {
        let board = MockBoard::new();
        let mut hw = board.clone();
        let mut reader = analog_reader(2);

        board.set_voltage(2.8); // 0 %
        reader.read(&mut hw);
        board.fail_next_reads(3);

        assert_eq!(reader.read(&mut hw).percent, 0);
        assert_eq!(reader.read(&mut hw).percent, 0);
        assert_eq!(reader.read(&mut hw).percent, FAILSAFE_PERCENT);

        // Recovery resets the streak.
        assert_eq!(
            reader.read(&mut hw),
            Sample {
                percent: 0,
                fresh: true
            }
        );
    }

    #[test]
    fn implausible_voltage_counts_as_failure() {
        let board = MockBoard::new();
        let mut hw = board.clone();
        let mut reader = analog_reader(3);

        reader.read(&mut hw);
        board.set_voltage(f64::NAN);
        assert_eq!(
            reader.read(&mut hw),
            Sample {
                percent: 50,
                fresh: false
            }
        );
    }
}
