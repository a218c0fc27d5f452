use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::thresholds::Thresholds;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    On,
    Off,
}

impl Transition {
    pub fn from_on(on: bool) -> Self {
        if on {
            Transition::On
        } else {
            Transition::Off
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transition::On => "on",
            Transition::Off => "off",
        }
    }
}

impl FromStr for Transition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(Transition::On),
            "off" => Ok(Transition::Off),
            other => bail!("unknown transition '{other}'"),
        }
    }
}

/// Who caused a pump transition or an activity note. Pump events only ever
/// carry `Auto`, `Manual` or `System`; `User` marks configuration changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Auto,
    Manual,
    System,
    User,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Auto => "auto",
            Source::Manual => "manual",
            Source::System => "system",
            Source::User => "user",
        }
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Source::Auto),
            "manual" => Ok(Source::Manual),
            "system" => Ok(Source::System),
            "user" => Ok(Source::User),
            other => bail!("unknown source '{other}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoistureSample {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub percent: u8,
    /// False for a reused or sentinel value written while the sensor failed.
    pub fresh: bool,
}

impl MoistureSample {
    pub fn now(percent: u8) -> Self {
        Self {
            ts: OffsetDateTime::now_utc(),
            percent,
            fresh: true,
        }
    }

    pub fn stale(percent: u8) -> Self {
        Self {
            fresh: false,
            ..Self::now(percent)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub transition: Transition,
    pub source: Source,
}

impl PumpEvent {
    pub fn now(transition: Transition, source: Source) -> Self {
        Self {
            ts: OffsetDateTime::now_utc(),
            transition,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub message: String,
    pub source: Source,
}

impl Note {
    pub fn now(message: impl Into<String>, source: Source) -> Self {
        Self {
            ts: OffsetDateTime::now_utc(),
            message: message.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservoirKind {
    Drain,
    Refill,
}

impl ReservoirKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservoirKind::Drain => "drain",
            ReservoirKind::Refill => "refill",
        }
    }
}

/// One reservoir ledger row. `level_ml` is the level after the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservoirEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: ReservoirKind,
    pub amount_ml: i64,
    pub level_ml: i64,
    pub source: Source,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekdayUsage {
    /// 0 = Sunday.
    pub weekday: u8,
    pub amount_ml: i64,
}

fn from_unix(ts: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).with_context(|| format!("invalid timestamp {ts}"))
}

fn to_percent(value: i64) -> Result<u8> {
    u8::try_from(value)
        .ok()
        .filter(|p| *p <= 100)
        .with_context(|| format!("stored moisture {value} out of range"))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plant/plant_data.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every in-memory connection is its own database, so pin those to one.
        let in_memory = db_url.contains(":memory:");
        let mut pool = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool = pool.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Append-only history
    // ----------------------------

    pub async fn append_moisture(&self, sample: &MoistureSample) -> Result<()> {
        sqlx::query("INSERT INTO moisture (ts, percent, fresh) VALUES (?, ?, ?)")
            .bind(sample.ts.unix_timestamp())
            .bind(i64::from(sample.percent))
            .bind(sample.fresh)
            .execute(&self.pool)
            .await
            .context("append_moisture failed")?;
        Ok(())
    }

    pub async fn append_event(&self, event: &PumpEvent) -> Result<()> {
        sqlx::query("INSERT INTO pump_events (ts, transition, source) VALUES (?, ?, ?)")
            .bind(event.ts.unix_timestamp())
            .bind(event.transition.as_str())
            .bind(event.source.as_str())
            .execute(&self.pool)
            .await
            .context("append_event failed")?;
        Ok(())
    }

    pub async fn append_note(&self, note: &Note) -> Result<()> {
        sqlx::query("INSERT INTO notes (ts, message, source) VALUES (?, ?, ?)")
            .bind(note.ts.unix_timestamp())
            .bind(&note.message)
            .bind(note.source.as_str())
            .execute(&self.pool)
            .await
            .context("append_note failed")?;
        Ok(())
    }

    pub async fn recent_moisture(&self, limit: i64) -> Result<Vec<MoistureSample>> {
        let rows: Vec<(i64, i64, bool)> =
            sqlx::query_as("SELECT ts, percent, fresh FROM moisture ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .context("recent_moisture failed")?;

        // Newest-first from SQL, chronological for callers.
        rows.into_iter()
            .rev()
            .map(|(ts, percent, fresh)| {
                Ok(MoistureSample {
                    ts: from_unix(ts)?,
                    percent: to_percent(percent)?,
                    fresh,
                })
            })
            .collect()
    }

    /// The last `limit` pump transitions in chronological order.
    pub async fn pump_events(&self, limit: i64) -> Result<Vec<PumpEvent>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT ts, transition, source FROM pump_events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("pump_events failed")?;

        rows.into_iter().rev().map(event_from_row).collect()
    }

    /// The last `limit` pump-ON events, newest first.
    pub async fn recent_waterings(&self, limit: i64) -> Result<Vec<PumpEvent>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT ts, transition, source
            FROM pump_events
            WHERE transition = 'on'
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_waterings failed")?;

        rows.into_iter().map(event_from_row).collect()
    }

    pub async fn notes(&self, limit: i64) -> Result<Vec<Note>> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT ts, message, source FROM notes ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .context("notes failed")?;

        rows.into_iter()
            .rev()
            .map(|(ts, message, source)| {
                Ok(Note {
                    ts: from_unix(ts)?,
                    message,
                    source: source.parse()?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Thresholds
    // ----------------------------

    pub async fn get_thresholds(&self) -> Result<Option<Thresholds>> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT dry_threshold, wet_threshold FROM settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("get_thresholds failed")?;

        row.map(|(dry, wet)| {
            Thresholds::new(dry, wet).context("stored thresholds violate dry < wet")
        })
        .transpose()
    }

    pub async fn set_thresholds(&self, thresholds: Thresholds) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (id, dry_threshold, wet_threshold)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              dry_threshold = excluded.dry_threshold,
              wet_threshold = excluded.wet_threshold
            "#,
        )
        .bind(i64::from(thresholds.dry()))
        .bind(i64::from(thresholds.wet()))
        .execute(&self.pool)
        .await
        .context("set_thresholds failed")?;
        Ok(())
    }

    // ----------------------------
    // Reservoir ledger
    // ----------------------------

    /// Level recorded by the most recent ledger entry, if any.
    pub async fn get_reservoir_level(&self) -> Result<Option<i64>> {
        let level: Option<i64> =
            sqlx::query_scalar("SELECT level_ml FROM reservoir ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("get_reservoir_level failed")?;
        Ok(level)
    }

    pub async fn set_reservoir_level(&self, entry: &ReservoirEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservoir (ts, kind, amount_ml, level_ml, source)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.ts.unix_timestamp())
        .bind(entry.kind.as_str())
        .bind(entry.amount_ml)
        .bind(entry.level_ml)
        .bind(entry.source.as_str())
        .execute(&self.pool)
        .await
        .context("set_reservoir_level failed")?;
        Ok(())
    }

    /// Sum of every drain logged after the latest refill.
    pub async fn consumption_since_refill(&self) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_ml), 0)
            FROM reservoir
            WHERE kind = 'drain'
              AND id > COALESCE((SELECT MAX(id) FROM reservoir WHERE kind = 'refill'), 0)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("consumption_since_refill failed")?;
        Ok(total)
    }

    pub async fn water_usage_by_weekday(&self) -> Result<Vec<WeekdayUsage>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT CAST(strftime('%w', ts, 'unixepoch') AS INTEGER) AS weekday,
                   COALESCE(SUM(amount_ml), 0) AS amount_ml
            FROM reservoir
            WHERE kind = 'drain'
            GROUP BY weekday
            ORDER BY weekday
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("water_usage_by_weekday failed")?;

        rows.into_iter()
            .map(|(weekday, amount_ml)| {
                Ok(WeekdayUsage {
                    weekday: u8::try_from(weekday).context("weekday out of range")?,
                    amount_ml,
                })
            })
            .collect()
    }
}

fn event_from_row((ts, transition, source): (i64, String, String)) -> Result<PumpEvent> {
    Ok(PumpEvent {
        ts: from_unix(ts)?,
        transition: transition.parse()?,
        source: source.parse()?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
