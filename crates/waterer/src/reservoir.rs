//! Reservoir bookkeeping. Every pump run is debited at its end in proportion
//! to how long the pump ran; a refill resets to capacity. Each change is a
//! ledger row carrying the amount and the resulting level, so consumption
//! since the last refill is the sum of the drain rows after it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ReservoirConfig;
use crate::db::{ReservoirEntry, ReservoirKind, Source};
use crate::error::PersistenceError;
use crate::journal::Journal;

/// Estimated water moved by a run of `ran` at `ml_per_sec`.
pub fn consumption_ml(ran: Duration, ml_per_sec: f64) -> i64 {
    (ran.as_secs_f64() * ml_per_sec).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReservoirStatus {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReservoirSnapshot {
    pub level_ml: i64,
    pub capacity_ml: i64,
    pub status: ReservoirStatus,
}

pub struct Reservoir {
    journal: Arc<Journal>,
    capacity_ml: i64,
    ml_per_sec: f64,
    low_level_ml: i64,
    level_ml: Mutex<i64>,
}

impl Reservoir {
    /// Resume from the last ledger row; a fresh database starts full.
    pub async fn load(journal: Arc<Journal>, cfg: &ReservoirConfig) -> Result<Self> {
        let level = match journal.db().get_reservoir_level().await? {
            Some(level) => level.clamp(0, cfg.capacity_ml),
            None => cfg.capacity_ml,
        };
        info!(level_ml = level, capacity_ml = cfg.capacity_ml, "reservoir loaded");

        Ok(Self {
            journal,
            capacity_ml: cfg.capacity_ml,
            ml_per_sec: cfg.ml_per_sec,
            low_level_ml: cfg.low_level_ml,
            level_ml: Mutex::new(level),
        })
    }

    pub async fn level(&self) -> i64 {
        *self.level_ml.lock().await
    }

    pub fn status_of(&self, level_ml: i64) -> ReservoirStatus {
        if level_ml > self.low_level_ml {
            ReservoirStatus::High
        } else {
            ReservoirStatus::Low
        }
    }

    pub async fn snapshot(&self) -> ReservoirSnapshot {
        let level_ml = self.level().await;
        ReservoirSnapshot {
            level_ml,
            capacity_ml: self.capacity_ml,
            status: self.status_of(level_ml),
        }
    }

    /// Debit a finished run. The in-memory level moves even if the ledger
    /// write has to wait in the journal backlog.
    pub async fn drain(
        &self,
        ran: Duration,
        source: Source,
    ) -> (ReservoirEntry, Result<(), PersistenceError>) {
        let amount_ml = consumption_ml(ran, self.ml_per_sec);

        let mut level = self.level_ml.lock().await;
        *level = (*level - amount_ml).max(0);
        let entry = ReservoirEntry {
            ts: OffsetDateTime::now_utc(),
            kind: ReservoirKind::Drain,
            amount_ml,
            level_ml: *level,
            source,
        };

        info!(
            amount_ml,
            level_ml = entry.level_ml,
            ran_ms = ran.as_millis() as u64,
            "reservoir debited"
        );
        let written = self.journal.reservoir(entry.clone()).await;
        (entry, written)
    }

    pub async fn refill(&self) -> Result<ReservoirEntry, PersistenceError> {
        let mut level = self.level_ml.lock().await;
        let entry = ReservoirEntry {
            ts: OffsetDateTime::now_utc(),
            kind: ReservoirKind::Refill,
            amount_ml: self.capacity_ml - *level,
            level_ml: self.capacity_ml,
            source: Source::User,
        };
        *level = self.capacity_ml;

        info!(level_ml = self.capacity_ml, "reservoir refilled");
        self.journal.reservoir(entry.clone()).await?;
        self.journal
            .note(
                format!("reservoir refilled to {} ml", self.capacity_ml),
                Source::User,
            )
            .await?;
        Ok(entry)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn test_reservoir() -> Reservoir {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        Reservoir::load(Arc::new(Journal::new(db)), &ReservoirConfig::default())
            .await
            .unwrap()
    }

    #[test]
    fn consumption_is_proportional_to_run_time() {
        assert_eq!(consumption_ml(Duration::from_secs(5), 10.0), 50);
        assert_eq!(consumption_ml(Duration::from_millis(1_250), 10.0), 13);
        assert_eq!(consumption_ml(Duration::ZERO, 10.0), 0);
    }

    #[tokio::test]
    async fn fresh_reservoir_starts_full() {
        let r = test_reservoir().await;
        assert_eq!(r.level().await, 500);
        assert_eq!(r.snapshot().await.status, ReservoirStatus::High);
    }

    #[tokio::test]
    async fn level_is_capacity_minus_runs() {
        let r = test_reservoir().await;
        for secs in [5, 10, 3] {
            let (_, written) = r.drain(Duration::from_secs(secs), Source::Auto).await;
            written.unwrap();
        }

        assert_eq!(r.level().await, 500 - 180);
        assert_eq!(r.journal.db().get_reservoir_level().await.unwrap(), Some(320));
        assert_eq!(r.journal.db().consumption_since_refill().await.unwrap(), 180);
    }

    #[tokio::test]
    async fn level_floors_at_zero() {
        let r = test_reservoir().await;
        let (entry, _) = r.drain(Duration::from_secs(45), Source::Manual).await;
        let (entry2, _) = r.drain(Duration::from_secs(30), Source::Manual).await;

        assert_eq!(entry.level_ml, 50);
        assert_eq!(entry2.level_ml, 0);
        assert_eq!(entry2.amount_ml, 300);
        assert_eq!(r.snapshot().await.status, ReservoirStatus::Low);
    }

    #[tokio::test]
    async fn refill_restores_capacity_and_resets_consumption() {
        let r = test_reservoir().await;
        r.drain(Duration::from_secs(20), Source::Auto).await.1.unwrap();
        assert_eq!(r.level().await, 300);

        let entry = r.refill().await.unwrap();
        assert_eq!(entry.amount_ml, 200);
        assert_eq!(r.level().await, 500);
        assert_eq!(r.journal.db().consumption_since_refill().await.unwrap(), 0);

        r.drain(Duration::from_secs(2), Source::Auto).await.1.unwrap();
        assert_eq!(r.journal.db().consumption_since_refill().await.unwrap(), 20);

        let notes = r.journal.db().notes(10).await.unwrap();
        assert_eq!(notes[0].message, "reservoir refilled to 500 ml");
        assert_eq!(notes[0].source, Source::User);
    }

    #[tokio::test]
    async fn load_resumes_from_ledger() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let journal = Arc::new(Journal::new(db));
        let cfg = ReservoirConfig::default();

        let first = Reservoir::load(journal.clone(), &cfg).await.unwrap();
        first.drain(Duration::from_secs(12), Source::Auto).await.1.unwrap();

        let second = Reservoir::load(journal, &cfg).await.unwrap();
        assert_eq!(second.level().await, 380);
    }

    #[tokio::test]
    async fn status_boundary_is_exclusive() {
        let r = test_reservoir().await;
        assert_eq!(r.status_of(101), ReservoirStatus::High);
        assert_eq!(r.status_of(100), ReservoirStatus::Low);
    }
}
