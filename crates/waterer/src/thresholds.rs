//! Hysteresis thresholds and the store the control loop reads every cycle.

use anyhow::Result;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::db::Db;
use crate::error::{PersistenceError, ThresholdError};

/// A validated (dry, wet) pair. `dry < wet`, both within 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    #[serde(rename = "dry_threshold")]
    dry: u8,
    #[serde(rename = "wet_threshold")]
    wet: u8,
}

impl Thresholds {
    pub fn new(dry: i64, wet: i64) -> Result<Self, ThresholdError> {
        if !(0..=100).contains(&dry) || !(0..=100).contains(&wet) {
            return Err(ThresholdError::OutOfRange { dry, wet });
        }
        if dry >= wet {
            return Err(ThresholdError::Inverted { dry, wet });
        }
        Ok(Self {
            dry: dry as u8,
            wet: wet as u8,
        })
    }

    /// Moisture at or below which the pump is commanded ON.
    pub fn dry(&self) -> u8 {
        self.dry
    }

    /// Moisture at or above which the pump is commanded OFF.
    pub fn wet(&self) -> u8 {
        self.wet
    }

    pub fn in_dead_band(&self, percent: u8) -> bool {
        percent > self.dry && percent < self.wet
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { dry: 30, wet: 60 }
    }
}

/// Current thresholds, persisted in `settings` and cached behind a lock so a
/// cycle always copies out a consistent pair.
pub struct ThresholdStore {
    db: Db,
    current: RwLock<Thresholds>,
}

impl ThresholdStore {
    /// Load the persisted pair, seeding `fallback` when none exists yet.
    pub async fn load(db: Db, fallback: Thresholds) -> Result<Self> {
        let current = match db.get_thresholds().await? {
            Some(t) => t,
            None => {
                db.set_thresholds(fallback).await?;
                tracing::info!(
                    dry = fallback.dry(),
                    wet = fallback.wet(),
                    "seeded default thresholds"
                );
                fallback
            }
        };

        Ok(Self {
            db,
            current: RwLock::new(current),
        })
    }

    pub async fn current(&self) -> Thresholds {
        *self.current.read().await
    }

    /// Validate, persist, then publish. On any error the previous pair stays
    /// in force both in memory and on disk.
    pub async fn update(&self, dry: i64, wet: i64) -> Result<Thresholds, ThresholdError> {
        let next = Thresholds::new(dry, wet)?;

        let mut current = self.current.write().await;
        self.db
            .set_thresholds(next)
            .await
            .map_err(PersistenceError::from)?;
        *current = next;

        tracing::info!(dry = next.dry(), wet = next.wet(), "thresholds updated");
        Ok(next)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
