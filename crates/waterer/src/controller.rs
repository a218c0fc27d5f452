//! Auto-watering control loop: samples moisture once per period and applies
//! the hysteresis rule to the pump.
//!
//! ## State machine
//!
//! ```text
//! Off ──[percent <= dry]──▶ On
//!  ▲                         │
//!  └──────[percent >= wet]───┘
//! ```
//!
//! Between the thresholds nothing happens. The current state is the pump's
//! last commanded state, re-read at the start of every cycle, so a manual
//! session or a failed write is picked up on the next tick. An OFF left
//! pending by a manual session is re-driven before the rule is applied.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::{MoistureSample, Source};
use crate::hardware::SharedHardware;
use crate::journal::Journal;
use crate::pump::{Pump, Switch};
use crate::sensor::{Sample, SensorReader};
use crate::state::SharedState;
use crate::thresholds::{ThresholdStore, Thresholds};

/// Consecutive failed pump writes before the loop raises an alarm.
const ACTUATOR_ALARM_CYCLES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PumpState {
    Off,
    On,
}

impl PumpState {
    pub fn from_on(on: bool) -> Self {
        if on {
            PumpState::On
        } else {
            PumpState::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == PumpState::On
    }

    /// The state to move to for `percent`, or `None` to stay put.
    pub fn next(self, percent: u8, thresholds: Thresholds) -> Option<PumpState> {
        match self {
            PumpState::Off if percent <= thresholds.dry() => Some(PumpState::On),
            PumpState::On if percent >= thresholds.wet() => Some(PumpState::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hold,
    Switched(PumpState),
    /// A manual session owns the pump.
    Suppressed,
    /// The write failed; the next cycle decides again.
    ActuatorFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub sample: Sample,
    pub thresholds: Thresholds,
    pub action: Action,
}

pub struct Controller {
    reader: SensorReader,
    hw: SharedHardware,
    pump: Arc<Pump>,
    thresholds: Arc<ThresholdStore>,
    journal: Arc<Journal>,
    shared: SharedState,
}

impl Controller {
    pub fn new(
        reader: SensorReader,
        hw: SharedHardware,
        pump: Arc<Pump>,
        thresholds: Arc<ThresholdStore>,
        journal: Arc<Journal>,
        shared: SharedState,
    ) -> Self {
        Self {
            reader,
            hw,
            pump,
            thresholds,
            journal,
            shared,
        }
    }

    /// Run forever at `period`. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(period_ms = period.as_millis() as u64, "control loop started");
        self.shared.write().await.record_system(format!(
            "control loop started (every {} ms)",
            period.as_millis()
        ));

        let mut faults: u32 = 0;
        loop {
            ticker.tick().await;
            let outcome = self.cycle().await;

            if outcome.action != Action::ActuatorFailed {
                faults = 0;
                continue;
            }
            faults += 1;
            if faults == ACTUATOR_ALARM_CYCLES {
                error!(
                    faults,
                    percent = outcome.sample.percent,
                    dry = outcome.thresholds.dry(),
                    wet = outcome.thresholds.wet(),
                    "pump has rejected every command for {faults} cycles"
                );
                self.shared.write().await.record_error(format!(
                    "pump unresponsive for {faults} cycles"
                ));
            }
        }
    }

    /// One sample, one decision. Never fails; problems are logged and the
    /// next cycle starts from whatever the pump last accepted.
    pub async fn cycle(&mut self) -> CycleOutcome {
        let retried = self.retry_pending_off().await;
        let state = PumpState::from_on(self.pump.is_on().await);
        self.reader.observe_pump(state.is_on());

        let sample = {
            let mut hw = self.hw.lock().await;
            self.reader.read(&mut **hw)
        };
        self.record_sample(sample).await;

        // One consistent pair per cycle.
        let thresholds = self.thresholds.current().await;

        let action = match (retried, state.next(sample.percent, thresholds)) {
            (Some(action), _) => action,
            (None, None) => Action::Hold,
            (None, Some(next)) => self.apply(next, sample, thresholds).await,
        };

        debug!(
            percent = sample.percent,
            fresh = sample.fresh,
            dry = thresholds.dry(),
            wet = thresholds.wet(),
            dead_band = thresholds.in_dead_band(sample.percent),
            ?state,
            ?action,
            "cycle"
        );

        CycleOutcome {
            sample,
            thresholds,
            action,
        }
    }

    async fn record_sample(&self, sample: Sample) {
        self.shared
            .write()
            .await
            .record_moisture(sample.percent, sample.fresh);

        let record = if sample.fresh {
            MoistureSample::now(sample.percent)
        } else {
            MoistureSample::stale(sample.percent)
        };
        if let Err(e) = self.journal.moisture(record).await {
            warn!("moisture history not written this cycle: {e}");
        }
    }

    /// The outcome of re-driving a pending manual OFF, if one was pending.
    async fn retry_pending_off(&self) -> Option<Action> {
        match self.pump.retry_pending_off().await? {
            Ok(_) => {
                info!("pump OFF after an earlier failed manual stop");
                Some(Action::Switched(PumpState::Off))
            }
            Err(e) => {
                error!("pump still refuses the pending manual OFF: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("pump write failed: {e}"));
                Some(Action::ActuatorFailed)
            }
        }
    }

    async fn apply(&self, next: PumpState, sample: Sample, thresholds: Thresholds) -> Action {
        match self.pump.switch(next.is_on(), Source::Auto).await {
            Ok(Switch::Changed(_)) => {
                info!(
                    percent = sample.percent,
                    dry = thresholds.dry(),
                    wet = thresholds.wet(),
                    "auto: pump {}",
                    if next.is_on() { "ON" } else { "OFF" }
                );
                Action::Switched(next)
            }
            // Someone else moved the pump since the start of the cycle.
            Ok(Switch::Unchanged) => Action::Hold,
            Ok(Switch::Suppressed) => {
                debug!(percent = sample.percent, "auto: manual session active, not switching");
                Action::Suppressed
            }
            Err(e) => {
                error!(
                    percent = sample.percent,
                    "auto: pump write failed, retrying next cycle: {e}"
                );
                self.shared
                    .write()
                    .await
                    .record_error(format!("pump write failed: {e}"));
                Action::ActuatorFailed
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
