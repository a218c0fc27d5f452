//! Single owner of the pump output.
//!
//! Every ON/OFF command, whether from the control loop, a manual request or
//! shutdown, goes through [`Pump`], which serialises them behind one lock and
//! remembers the last commanded state. That commanded state is what the
//! control loop reads each cycle; the physical pin is never read back.
//!
//! While a manual session runs, automatic commands are suppressed rather than
//! applied, so the loop cannot cut a manual watering short. If the OFF that
//! ends a session fails, the OFF stays pending and the control loop re-drives
//! it every cycle until the pin accepts it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::db::{PumpEvent, ReservoirEntry, Source, Transition};
use crate::error::{HardwareError, PumpError};
use crate::hardware::SharedHardware;
use crate::journal::Journal;
use crate::reservoir::Reservoir;
use crate::state::SharedState;

/// Result of a switch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Switch {
    /// The output moved and exactly one event was recorded.
    Changed(PumpEvent),
    /// Already in the requested state. Nothing written.
    Unchanged,
    /// An automatic command arrived during a manual session.
    Suppressed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualReport {
    pub duration_sec: f64,
    /// Reservoir debit for the run this session ended.
    pub consumed_ml: i64,
    pub level_ml: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PumpSnapshot {
    pub on: bool,
    pub manual: bool,
}

struct Commanded {
    on: bool,
    since: Option<Instant>,
    started_by: Source,
    manual: bool,
    /// A manual session ended but its OFF write failed.
    off_pending: bool,
}

pub struct Pump {
    hw: SharedHardware,
    state: Mutex<Commanded>,
    journal: Arc<Journal>,
    reservoir: Arc<Reservoir>,
    shared: SharedState,
}

impl Pump {
    /// Take over the output and drive it OFF. Whatever the pin was doing
    /// before this process started is not trusted.
    pub async fn start(
        hw: SharedHardware,
        journal: Arc<Journal>,
        reservoir: Arc<Reservoir>,
        shared: SharedState,
    ) -> anyhow::Result<Self> {
        hw.lock()
            .await
            .set_pump(false)
            .context("failed to force pump OFF at startup")?;

        info!("pump forced OFF at startup");
        shared
            .write()
            .await
            .record_system("pump forced OFF at startup".to_string());
        if let Err(e) = journal.note("pump forced OFF at startup", Source::System).await {
            warn!("startup note not recorded: {e}");
        }

        Ok(Self {
            hw,
            state: Mutex::new(Commanded {
                on: false,
                since: None,
                started_by: Source::System,
                manual: false,
                off_pending: false,
            }),
            journal,
            reservoir,
            shared,
        })
    }

    /// Last commanded state.
    pub async fn is_on(&self) -> bool {
        self.state.lock().await.on
    }

    pub async fn snapshot(&self) -> PumpSnapshot {
        let state = self.state.lock().await;
        PumpSnapshot {
            on: state.on,
            manual: state.manual,
        }
    }

    /// Command the output. A failed write leaves the commanded state as it
    /// was, so the caller can simply ask again.
    pub async fn switch(&self, on: bool, source: Source) -> Result<Switch, HardwareError> {
        let mut state = self.state.lock().await;
        if state.manual && source == Source::Auto {
            return Ok(Switch::Suppressed);
        }
        if state.on == on {
            return Ok(Switch::Unchanged);
        }
        let (event, _) = self.drive(&mut state, on, source).await?;
        Ok(Switch::Changed(event))
    }

    /// Run the pump for `duration`, then stop it. Returns once the pump is
    /// OFF again. If the pump was already running from the control loop the
    /// session adopts that run instead of logging a second ON.
    pub async fn water_for(&self, duration: Duration) -> Result<ManualReport, PumpError> {
        {
            let mut state = self.state.lock().await;
            if state.manual {
                return Err(PumpError::Busy);
            }
            if state.on {
                info!("pump already running, manual session takes over the run");
            } else {
                self.drive(&mut state, true, Source::Manual).await?;
            }
            state.manual = true;
        }

        info!(duration_sec = duration.as_secs_f64(), "manual watering started");
        tokio::time::sleep(duration).await;

        let mut state = self.state.lock().await;
        state.manual = false;
        if !state.on {
            // Stopped underneath us (shutdown).
            return Ok(ManualReport {
                duration_sec: duration.as_secs_f64(),
                consumed_ml: 0,
                level_ml: self.reservoir.level().await,
            });
        }

        let (_, drained) = match self.drive(&mut state, false, Source::Manual).await {
            Ok(done) => done,
            Err(e) => {
                state.off_pending = true;
                error!("manual watering could not stop the pump, retrying every cycle: {e}");
                return Err(e.into());
            }
        };
        info!(duration_sec = duration.as_secs_f64(), "manual watering finished");

        Ok(ManualReport {
            duration_sec: duration.as_secs_f64(),
            consumed_ml: drained.as_ref().map_or(0, |e| e.amount_ml),
            level_ml: match drained {
                Some(entry) => entry.level_ml,
                None => self.reservoir.level().await,
            },
        })
    }

    /// Re-drive the OFF of a manual session whose final write failed.
    /// `None` when nothing is pending or a new session owns the pump.
    pub async fn retry_pending_off(&self) -> Option<Result<PumpEvent, HardwareError>> {
        let mut state = self.state.lock().await;
        if !state.off_pending || state.manual {
            return None;
        }
        Some(
            self.drive(&mut state, false, Source::Manual)
                .await
                .map(|(event, _)| event),
        )
    }

    /// Best-effort OFF regardless of who is driving. The pin is written even
    /// when the pump is already commanded OFF.
    pub async fn force_off(&self, source: Source) -> Result<Switch, HardwareError> {
        let mut state = self.state.lock().await;
        state.manual = false;
        if state.on {
            let (event, _) = self.drive(&mut state, false, source).await?;
            return Ok(Switch::Changed(event));
        }
        self.hw.lock().await.set_pump(false)?;
        Ok(Switch::Unchanged)
    }

    /// Write the pin, then record the transition. Caller holds the state lock,
    /// which keeps events in the order the pin actually moved.
    async fn drive(
        &self,
        state: &mut Commanded,
        on: bool,
        source: Source,
    ) -> Result<(PumpEvent, Option<ReservoirEntry>), HardwareError> {
        self.hw.lock().await.set_pump(on)?;

        let finished_run = if on {
            state.since = Some(Instant::now());
            state.started_by = source;
            None
        } else {
            state.since.take().map(|t| (t.elapsed(), state.started_by))
        };
        state.on = on;
        if !on {
            state.off_pending = false;
        }

        let event = PumpEvent::now(Transition::from_on(on), source);
        info!(
            transition = event.transition.as_str(),
            source = source.as_str(),
            "pump switched"
        );
        self.shared.write().await.record_pump(event.transition, source);

        if let Err(e) = self.journal.pump(event.clone()).await {
            error!("pump event not recorded yet: {e}");
        }

        let drained = match finished_run {
            Some((ran, started_by)) => {
                let (entry, written) = self.reservoir.drain(ran, started_by).await;
                if let Err(e) = written {
                    error!("reservoir debit not recorded yet: {e}");
                }
                Some(entry)
            }
            None => None,
        };

        Ok((event, drained))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReservoirConfig;
    use crate::db::Db;
    use crate::hardware::{self, MockBoard};
    use crate::state;

    struct Rig {
        board: MockBoard,
        pump: Arc<Pump>,
        db: Db,
    }

    async fn rig() -> Rig {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let journal = Arc::new(Journal::new(db.clone()));
        let reservoir = Arc::new(
            Reservoir::load(journal.clone(), &ReservoirConfig::default())
                .await
                .unwrap(),
        );
        let board = MockBoard::new();
        let pump = Pump::start(
            hardware::shared(Box::new(board.clone())),
            journal,
            reservoir,
            state::shared(),
        )
        .await
        .unwrap();
        Rig {
            board,
            pump: Arc::new(pump),
            db,
        }
    }

    async fn events(db: &Db) -> Vec<(Transition, Source)> {
        db.pump_events(100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.transition, e.source))
            .collect()
    }

    #[tokio::test]
    async fn start_forces_pin_off_without_an_event() {
        let rig = rig().await;
        assert_eq!(rig.board.writes(), vec![false]);
        assert!(!rig.pump.is_on().await);
        assert!(events(&rig.db).await.is_empty());
        assert_eq!(
            rig.db.notes(10).await.unwrap()[0].message,
            "pump forced OFF at startup"
        );
    }

    #[tokio::test]
    async fn start_fails_when_pin_cannot_be_written() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let journal = Arc::new(Journal::new(db));
        let reservoir = Arc::new(
            Reservoir::load(journal.clone(), &ReservoirConfig::default())
                .await
                .unwrap(),
        );
        let board = MockBoard::new();
        board.fail_next_writes(1);

        let res = Pump::start(
            hardware::shared(Box::new(board)),
            journal,
            reservoir,
            state::shared(),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn repeated_switch_is_written_and_logged_once() {
        let rig = rig().await;

        assert!(matches!(
            rig.pump.switch(true, Source::Auto).await.unwrap(),
            Switch::Changed(_)
        ));
        assert_eq!(
            rig.pump.switch(true, Source::Auto).await.unwrap(),
            Switch::Unchanged
        );

        assert_eq!(rig.board.writes(), vec![false, true]);
        assert_eq!(events(&rig.db).await, vec![(Transition::On, Source::Auto)]);
    }

    #[tokio::test]
    async fn failed_write_keeps_commanded_state() {
        let rig = rig().await;
        rig.board.fail_next_writes(1);

        assert!(rig.pump.switch(true, Source::Auto).await.is_err());
        assert!(!rig.pump.is_on().await);
        assert!(events(&rig.db).await.is_empty());

        // Retry goes through.
        rig.pump.switch(true, Source::Auto).await.unwrap();
        assert!(rig.pump.is_on().await);
        assert!(rig.board.pump_on());
    }

    #[tokio::test]
    async fn off_transition_debits_reservoir() {
        let rig = rig().await;
        rig.pump.switch(true, Source::Auto).await.unwrap();
        rig.pump.switch(false, Source::Auto).await.unwrap();

        let level = rig.db.get_reservoir_level().await.unwrap();
        assert!(level.is_some(), "a drain row should be written");
        assert!(level.unwrap() <= 500);
    }

    #[tokio::test]
    async fn manual_session_logs_on_and_off() {
        let rig = rig().await;
        let report = rig.pump.water_for(Duration::from_millis(30)).await.unwrap();

        assert_eq!(report.duration_sec, 0.03);
        assert!(!rig.pump.is_on().await);
        assert!(!rig.pump.snapshot().await.manual);
        assert_eq!(rig.board.writes(), vec![false, true, false]);
        assert_eq!(
            events(&rig.db).await,
            vec![
                (Transition::On, Source::Manual),
                (Transition::Off, Source::Manual)
            ]
        );
    }

    #[tokio::test]
    async fn failed_manual_off_stays_pending_until_driven() {
        let rig = rig().await;
        let pump = rig.pump.clone();
        let session =
            tokio::spawn(async move { pump.water_for(Duration::from_millis(100)).await });

        while !rig.pump.snapshot().await.manual {
            tokio::task::yield_now().await;
        }
        rig.board.fail_next_writes(1);

        assert!(matches!(
            session.await.unwrap(),
            Err(PumpError::Actuator(_))
        ));
        assert!(rig.pump.is_on().await);
        assert!(rig.board.pump_on());

        let event = rig.pump.retry_pending_off().await.unwrap().unwrap();
        assert_eq!(
            (event.transition, event.source),
            (Transition::Off, Source::Manual)
        );
        assert!(!rig.board.pump_on());
        assert!(!rig.pump.is_on().await);
        assert!(rig.pump.retry_pending_off().await.is_none());

        // The late OFF still debits the run.
        assert!(rig.db.get_reservoir_level().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nothing_pending_after_a_clean_session() {
        let rig = rig().await;
        rig.pump.water_for(Duration::from_millis(10)).await.unwrap();
        assert!(rig.pump.retry_pending_off().await.is_none());
    }

    #[tokio::test]
    async fn auto_commands_are_suppressed_during_manual() {
        let rig = rig().await;
        let pump = rig.pump.clone();
        let session =
            tokio::spawn(async move { pump.water_for(Duration::from_millis(200)).await });

        // Wait for the session to take the pump.
        while !rig.pump.snapshot().await.manual {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            rig.pump.switch(false, Source::Auto).await.unwrap(),
            Switch::Suppressed
        );
        assert!(rig.board.pump_on());

        session.await.unwrap().unwrap();
        assert_eq!(
            events(&rig.db).await,
            vec![
                (Transition::On, Source::Manual),
                (Transition::Off, Source::Manual)
            ]
        );
    }

    #[tokio::test]
    async fn second_manual_request_is_busy() {
        let rig = rig().await;
        let pump = rig.pump.clone();
        let session =
            tokio::spawn(async move { pump.water_for(Duration::from_millis(200)).await });

        while !rig.pump.snapshot().await.manual {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            rig.pump.water_for(Duration::from_millis(10)).await,
            Err(PumpError::Busy)
        ));
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn manual_adopts_a_running_auto_cycle() {
        let rig = rig().await;
        rig.pump.switch(true, Source::Auto).await.unwrap();
        rig.pump.water_for(Duration::from_millis(20)).await.unwrap();

        // One ON (auto), one OFF (manual). No duplicate ON.
        assert_eq!(
            events(&rig.db).await,
            vec![
                (Transition::On, Source::Auto),
                (Transition::Off, Source::Manual)
            ]
        );
    }

    #[tokio::test]
    async fn manual_start_failure_is_an_actuator_error() {
        let rig = rig().await;
        rig.board.fail_next_writes(1);

        assert!(matches!(
            rig.pump.water_for(Duration::from_millis(10)).await,
            Err(PumpError::Actuator(_))
        ));
        assert!(!rig.pump.snapshot().await.manual);
    }

    #[tokio::test]
    async fn force_off_logs_system_transition() {
        let rig = rig().await;
        rig.pump.switch(true, Source::Auto).await.unwrap();

        assert!(matches!(
            rig.pump.force_off(Source::System).await.unwrap(),
            Switch::Changed(_)
        ));
        assert!(!rig.board.pump_on());
        assert_eq!(
            events(&rig.db).await.last(),
            Some(&(Transition::Off, Source::System))
        );

        // Already off: the pin is still written, nothing is logged.
        assert_eq!(
            rig.pump.force_off(Source::System).await.unwrap(),
            Switch::Unchanged
        );
        assert_eq!(rig.board.writes(), vec![false, true, false, false]);
        assert_eq!(events(&rig.db).await.len(), 2);
    }
}
