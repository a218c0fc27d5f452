//! Pump output and moisture inputs behind one injected capability.
//!
//! The `gpio` feature gates the real rppal board (motor driver or relay on
//! the pump pins, LM393 digital input, MCP3008 ADC on SPI0). Without it a
//! mock board stands in: it remembers pump writes and serves whatever
//! readings it was given.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::Config;
use crate::error::HardwareError;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};
#[cfg(feature = "gpio")]
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

/// Everything the controller needs from the board. Every call must be safe to
/// repeat; `set_pump` is idempotent at the pin level.
pub trait Hardware: Send {
    fn set_pump(&mut self, on: bool) -> Result<(), HardwareError>;
    fn read_digital_signal(&mut self) -> Result<bool, HardwareError>;
    fn read_analog_voltage(&mut self) -> Result<f64, HardwareError>;
}

/// The board behind an async lock. Lock order: pump state first, then this.
pub type SharedHardware = Arc<tokio::sync::Mutex<Box<dyn Hardware>>>;

pub fn shared(hw: Box<dyn Hardware>) -> SharedHardware {
    Arc::new(tokio::sync::Mutex::new(hw))
}

// ── MCP3008 framing ─────────────────────────────────────────────────────────

/// Highest single-ended MCP3008 input (CH0..CH7).
pub const MCP3008_MAX_CHANNEL: i64 = 7;

/// 10-bit converter.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const MCP3008_FULL_SCALE: f64 = 1023.0;

/// SPI clock for the MCP3008 at 3.3 V.
#[cfg(feature = "gpio")]
const MCP3008_CLOCK_HZ: u32 = 1_350_000;

/// Three-byte request for a single-ended read: start bit, then SGL=1 and the
/// channel in the top nibble of the second byte.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
fn mcp3008_request(channel: u8) -> [u8; 3] {
    [0x01, (0x08 | (channel & 0x07)) << 4, 0x00]
}

/// The result is the low two bits of byte 1 followed by byte 2.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
fn mcp3008_counts(rx: [u8; 3]) -> u16 {
    (u16::from(rx[1] & 0x03) << 8) | u16::from(rx[2])
}

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
fn counts_to_volts(counts: u16, vref: f64) -> f64 {
    f64::from(counts) / MCP3008_FULL_SCALE * vref
}

// ---------------------------------------------------------------------------
// Real board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct PiBoard {
    in1: OutputPin,
    /// Present for a two-pin motor driver; absent for a single relay.
    in2: Option<OutputPin>,
    active_low: bool,
    signal: InputPin,
    spi: Spi,
    channel: u8,
    vref: f64,
}

#[cfg(feature = "gpio")]
impl PiBoard {
    pub fn open(cfg: &Config) -> anyhow::Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;

        let in1 = gpio
            .get(cfg.pump.in1_pin as u8)
            .with_context(|| format!("failed to claim pump pin {}", cfg.pump.in1_pin))?
            .into_output();
        let in2 = match cfg.pump.in2_pin {
            Some(pin) => Some(
                gpio.get(pin as u8)
                    .with_context(|| format!("failed to claim pump pin {pin}"))?
                    .into_output(),
            ),
            None => None,
        };
        let signal = gpio
            .get(cfg.sensor.signal_pin as u8)
            .with_context(|| format!("failed to claim sensor pin {}", cfg.sensor.signal_pin))?
            .into_input();
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, MCP3008_CLOCK_HZ, Mode::Mode0)
            .context("failed to open spi0 for mcp3008")?;

        let mut board = Self {
            in1,
            in2,
            active_low: cfg.pump.active_low,
            signal,
            spi,
            channel: cfg.sensor.adc_channel as u8,
            vref: cfg.sensor.vref,
        };

        // Fail-safe: pins come up OFF before anyone commands them.
        board.set_pump(false)?;

        tracing::info!(
            in1 = cfg.pump.in1_pin,
            in2 = ?cfg.pump.in2_pin,
            signal = cfg.sensor.signal_pin,
            adc_channel = cfg.sensor.adc_channel,
            "gpio board initialised"
        );
        Ok(board)
    }
}

#[cfg(feature = "gpio")]
impl Hardware for PiBoard {
    fn set_pump(&mut self, on: bool) -> Result<(), HardwareError> {
        match self.in2.as_mut() {
            // Motor driver: IN1 high + IN2 low runs the pump, both low stops it.
            Some(in2) => {
                in2.set_low();
                if on {
                    self.in1.set_high();
                } else {
                    self.in1.set_low();
                }
            }
            // Relay: polarity depends on the board.
            None => {
                if on != self.active_low {
                    self.in1.set_high();
                } else {
                    self.in1.set_low();
                }
            }
        }
        tracing::debug!("pump set {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    fn read_digital_signal(&mut self) -> Result<bool, HardwareError> {
        Ok(self.signal.is_high())
    }

    fn read_analog_voltage(&mut self) -> Result<f64, HardwareError> {
        let tx = mcp3008_request(self.channel);
        let mut rx = [0u8; 3];
        self.spi
            .transfer(&mut rx, &tx)
            .map_err(|e| HardwareError::Spi(e.to_string()))?;
        Ok(counts_to_volts(mcp3008_counts(rx), self.vref))
    }
}

// ---------------------------------------------------------------------------
// Mock board (development and tests, no hardware)
// ---------------------------------------------------------------------------

/// Observable state of the mock board.
#[derive(Debug)]
#[cfg_attr(feature = "gpio", allow(dead_code))]
pub struct MockPins {
    pub pump_on: bool,
    /// Every successful pump write, in order.
    pub writes: Vec<bool>,
    pub signal_high: bool,
    pub voltage: f64,
    /// Number of upcoming pump writes that fail.
    pub fail_writes: u32,
    /// Number of upcoming sensor reads that fail.
    pub fail_reads: u32,
}

/// Cloneable handle: tests keep one clone while the controller owns another.
#[derive(Clone)]
#[cfg_attr(feature = "gpio", allow(dead_code))]
pub struct MockBoard {
    pins: Arc<Mutex<MockPins>>,
}

/// Scripting hooks used by tests.
#[cfg_attr(not(test), allow(dead_code))]
impl MockBoard {
    pub fn new() -> Self {
        Self {
            pins: Arc::new(Mutex::new(MockPins {
                pump_on: false,
                writes: Vec::new(),
                signal_high: false,
                voltage: 2.0,
                fail_writes: 0,
                fail_reads: 0,
            })),
        }
    }

    pub fn pins(&self) -> MutexGuard<'_, MockPins> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_voltage(&self, volts: f64) {
        self.pins().voltage = volts;
    }

    pub fn set_signal(&self, high: bool) {
        self.pins().signal_high = high;
    }

    pub fn pump_on(&self) -> bool {
        self.pins().pump_on
    }

    pub fn writes(&self) -> Vec<bool> {
        self.pins().writes.clone()
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.pins().fail_writes = n;
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.pins().fail_reads = n;
    }
}

impl Default for MockBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for MockBoard {
    fn set_pump(&mut self, on: bool) -> Result<(), HardwareError> {
        let mut pins = self.pins();
        if pins.fail_writes > 0 {
            pins.fail_writes -= 1;
            return Err(HardwareError::Gpio("[mock-gpio] injected write fault".into()));
        }
        pins.pump_on = on;
        pins.writes.push(on);
        tracing::debug!("[mock-gpio] pump set {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    fn read_digital_signal(&mut self) -> Result<bool, HardwareError> {
        let mut pins = self.pins();
        if pins.fail_reads > 0 {
            pins.fail_reads -= 1;
            return Err(HardwareError::Gpio("[mock-gpio] injected read fault".into()));
        }
        Ok(pins.signal_high)
    }

    fn read_analog_voltage(&mut self) -> Result<f64, HardwareError> {
        let mut pins = self.pins();
        if pins.fail_reads > 0 {
            pins.fail_reads -= 1;
            return Err(HardwareError::Spi("[mock-gpio] injected read fault".into()));
        }
        Ok(pins.voltage)
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub fn open(cfg: &Config) -> anyhow::Result<Box<dyn Hardware>> {
    Ok(Box::new(PiBoard::open(cfg)?))
}

#[cfg(not(feature = "gpio"))]
pub fn open(cfg: &Config) -> anyhow::Result<Box<dyn Hardware>> {
    tracing::warn!(
        in1 = cfg.pump.in1_pin,
        signal = cfg.sensor.signal_pin,
        "[mock-gpio] pump board initialised (no hardware)"
    );
    Ok(Box::new(MockBoard::new()))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- MCP3008 framing ----------------------------------------------------

    #[test]
    fn request_channel_0() {
        assert_eq!(mcp3008_request(0), [0x01, 0x80, 0x00]);
    }

    #[test]
    fn request_channel_7() {
        assert_eq!(mcp3008_request(7), [0x01, 0xF0, 0x00]);
    }

    #[test]
    fn request_masks_channel_to_three_bits() {
        assert_eq!(mcp3008_request(9), mcp3008_request(1));
    }

    #[test]
    fn counts_use_low_ten_bits() {
        assert_eq!(mcp3008_counts([0xFF, 0x03, 0xFF]), 1023);
        assert_eq!(mcp3008_counts([0xFF, 0xFC, 0x00]), 0);
        assert_eq!(mcp3008_counts([0x00, 0x02, 0x00]), 512);
    }

    #[test]
    fn full_scale_is_vref() {
        assert!((counts_to_volts(1023, 3.3) - 3.3).abs() < 1e-9);
        assert_eq!(counts_to_volts(0, 3.3), 0.0);
    }

    // -- MockBoard ----------------------------------------------------------

    #[test]
    fn mock_starts_off_with_no_writes() {
        let board = MockBoard::new();
        assert!(!board.pump_on());
        assert!(board.writes().is_empty());
    }

    #[test]
    fn mock_records_writes_through_clones() {
        let board = MockBoard::new();
        let mut owned = board.clone();
        owned.set_pump(true).unwrap();
        owned.set_pump(false).unwrap();
        assert_eq!(board.writes(), vec![true, false]);
        assert!(!board.pump_on());
    }

    #[test]
    fn mock_injected_write_fault_leaves_pin_untouched() {
        let board = MockBoard::new();
        let mut owned = board.clone();
        board.fail_next_writes(1);

        assert!(owned.set_pump(true).is_err());
        assert!(!board.pump_on());

        owned.set_pump(true).unwrap();
        assert!(board.pump_on());
        assert_eq!(board.writes(), vec![true]);
    }

    #[test]
    fn mock_serves_configured_readings() {
        let board = MockBoard::new();
        let mut owned = board.clone();
        board.set_voltage(1.5);
        board.set_signal(true);
        assert_eq!(owned.read_analog_voltage().unwrap(), 1.5);
        assert!(owned.read_digital_signal().unwrap());
    }

    #[test]
    fn mock_injected_read_faults_count_down() {
        let board = MockBoard::new();
        let mut owned = board.clone();
        board.fail_next_reads(2);
        assert!(owned.read_analog_voltage().is_err());
        assert!(owned.read_digital_signal().is_err());
        assert!(owned.read_analog_voltage().is_ok());
    }
}
