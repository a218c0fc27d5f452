//! Wiring and the operations the dashboard calls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, ManualConfig};
use crate::controller::Controller;
use crate::db::{Db, MoistureSample, Note, PumpEvent, Source};
use crate::error::{PersistenceError, PumpError, ThresholdError};
use crate::hardware::{self, Hardware};
use crate::journal::Journal;
use crate::pump::{ManualReport, Pump, PumpSnapshot, Switch};
use crate::reservoir::{Reservoir, ReservoirSnapshot};
use crate::sensor::SensorReader;
use crate::state::{self, ActivityResponse, SharedState};
use crate::thresholds::{ThresholdStore, Thresholds};

/// Moisture samples shown on the dashboard chart.
const DASHBOARD_SAMPLES: i64 = 10;
/// Recent waterings listed on the dashboard.
const DASHBOARD_WATERINGS: i64 = 7;
/// Pump transitions and activity notes shown on the dashboard.
const DASHBOARD_HISTORY: i64 = 10;

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Value the last cycle acted on. `None` before the first cycle.
    pub moisture_percent: Option<u8>,
    pub moisture_fresh: bool,
    pub pump_on: bool,
    pub manual_active: bool,
    pub reservoir_level: i64,
    pub reservoir: ReservoirSnapshot,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    /// Oldest first.
    pub moisture: Vec<MoistureSample>,
    /// Pump-ON events, newest first.
    pub waterings: Vec<PumpEvent>,
    /// ON and OFF, oldest first.
    pub transitions: Vec<PumpEvent>,
    pub notes: Vec<Note>,
    pub reservoir: ReservoirSnapshot,
    pub consumed_since_refill_ml: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_watered: Option<OffsetDateTime>,
    pub thresholds: Thresholds,
    pub pump: PumpSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayUsage {
    pub day: &'static str,
    pub amount_ml: i64,
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct App {
    db: Db,
    journal: Arc<Journal>,
    pump: Arc<Pump>,
    thresholds: Arc<ThresholdStore>,
    reservoir: Arc<Reservoir>,
    shared: SharedState,
    manual: ManualConfig,
}

/// Assemble everything around one board. The pump is forced OFF here.
pub async fn build(cfg: &Config, db: Db, hw: Box<dyn Hardware>) -> Result<(App, Controller)> {
    let reader = SensorReader::from_config(&cfg.sensor);
    let hw = hardware::shared(hw);
    let shared = state::shared();
    let journal = Arc::new(Journal::new(db.clone()));

    let thresholds = Arc::new(ThresholdStore::load(db.clone(), cfg.seed_thresholds()?).await?);
    let reservoir = Arc::new(Reservoir::load(journal.clone(), &cfg.reservoir).await?);
    let pump = Arc::new(
        Pump::start(
            hw.clone(),
            journal.clone(),
            reservoir.clone(),
            shared.clone(),
        )
        .await?,
    );

    let controller = Controller::new(
        reader,
        hw,
        pump.clone(),
        thresholds.clone(),
        journal.clone(),
        shared.clone(),
    );

    let app = App {
        db,
        journal,
        pump,
        thresholds,
        reservoir,
        shared,
        manual: cfg.manual.clone(),
    };
    Ok((app, controller))
}

impl App {
    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub async fn current_status(&self) -> Status {
        let last = self.shared.read().await.last_moisture;
        let pump = self.pump.snapshot().await;
        let reservoir = self.reservoir.snapshot().await;

        Status {
            moisture_percent: last.map(|r| r.percent),
            moisture_fresh: last.is_some_and(|r| r.fresh),
            pump_on: pump.on,
            manual_active: pump.manual,
            reservoir_level: reservoir.level_ml,
            reservoir,
            thresholds: self.thresholds.current().await,
        }
    }

    pub async fn activity(&self) -> ActivityResponse {
        self.shared.read().await.to_activity()
    }

    pub async fn thresholds(&self) -> Thresholds {
        self.thresholds.current().await
    }

    /// Requested seconds, or the default, clamped to the allowed window.
    /// Fractions are kept.
    pub fn clamp_duration(&self, requested: Option<f64>) -> Duration {
        let secs = requested
            .filter(|s| s.is_finite())
            .unwrap_or(self.manual.default_sec as f64)
            .clamp(self.manual.min_sec as f64, self.manual.max_sec as f64);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Water for the (clamped) duration and return when the pump is OFF.
    /// The run lives in its own task, so it finishes even if the caller goes
    /// away half-way.
    pub async fn trigger_manual_water(
        &self,
        requested: Option<f64>,
    ) -> Result<ManualReport, PumpError> {
        let duration = self.clamp_duration(requested);
        if let Some(req) = requested {
            if req != duration.as_secs_f64() {
                info!(
                    requested = req,
                    clamped = duration.as_secs_f64(),
                    "manual duration clamped"
                );
            }
        }

        let pump = self.pump.clone();
        tokio::spawn(async move { pump.water_for(duration).await })
            .await
            .map_err(|e| PumpError::Aborted(e.to_string()))?
    }

    /// Missing values keep their current setting.
    pub async fn update_thresholds(
        &self,
        dry: Option<i64>,
        wet: Option<i64>,
    ) -> Result<Thresholds, ThresholdError> {
        let current = self.thresholds.current().await;
        let dry = dry.unwrap_or(i64::from(current.dry()));
        let wet = wet.unwrap_or(i64::from(current.wet()));

        let next = self.thresholds.update(dry, wet).await?;

        let detail = format!("thresholds set to dry={} wet={}", next.dry(), next.wet());
        self.shared.write().await.record_config(detail.clone());
        if let Err(e) = self.journal.note(detail, Source::User).await {
            warn!("threshold note not recorded yet: {e}");
        }
        Ok(next)
    }

    pub async fn refill(&self) -> Result<ReservoirSnapshot, PersistenceError> {
        let result = self.reservoir.refill().await;
        self.shared
            .write()
            .await
            .record_system("reservoir refilled".to_string());
        result?;
        Ok(self.reservoir.snapshot().await)
    }

    pub async fn dashboard(&self) -> Result<Dashboard, PersistenceError> {
        let moisture = self.db.recent_moisture(DASHBOARD_SAMPLES).await?;
        let waterings = self.db.recent_waterings(DASHBOARD_WATERINGS).await?;
        let last_watered = waterings.first().map(|e| e.ts);

        Ok(Dashboard {
            moisture,
            waterings,
            transitions: self.db.pump_events(DASHBOARD_HISTORY).await?,
            notes: self.db.notes(DASHBOARD_HISTORY).await?,
            reservoir: self.reservoir.snapshot().await,
            consumed_since_refill_ml: self.db.consumption_since_refill().await?,
            last_watered,
            thresholds: self.thresholds.current().await,
            pump: self.pump.snapshot().await,
        })
    }

    /// All drained water grouped by weekday, Sunday first, zero-filled.
    pub async fn water_usage(&self) -> Result<Vec<DayUsage>, PersistenceError> {
        let mut days: Vec<DayUsage> = WEEKDAYS
            .iter()
            .map(|&day| DayUsage { day, amount_ml: 0 })
            .collect();

        for usage in self.db.water_usage_by_weekday().await? {
            if let Some(slot) = days.get_mut(usize::from(usage.weekday)) {
                slot.amount_ml = usage.amount_ml;
            }
        }
        Ok(days)
    }

    /// Stop the control loop, drive the pump OFF and record why. Called once
    /// on the way out.
    pub async fn shutdown(&self, control: JoinHandle<()>, reason: &str) {
        // A cycle already past its last await could still switch the pump ON.
        control.abort();
        if let Err(e) = control.await {
            if !e.is_cancelled() {
                warn!("control loop ended abnormally: {e}");
            }
        }

        match self.pump.force_off(Source::System).await {
            Ok(Switch::Changed(_)) => info!("pump stopped for shutdown"),
            Ok(_) => info!("pump already off at shutdown"),
            Err(e) => tracing::error!("failed to stop pump at shutdown: {e}"),
        }

        self.shared
            .write()
            .await
            .record_system(format!("shutting down ({reason})"));
        if let Err(e) = self
            .journal
            .note(format!("shutdown: {reason}"), Source::System)
            .await
        {
            warn!(
                pending = self.journal.pending().await,
                "shutdown note not recorded: {e}"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
