//! Append-only sink for samples, pump events, reservoir entries and notes.
//!
//! Records go through one ordered backlog. A write that fails stays at the
//! front and is retried before anything newer, so the stored history keeps
//! the order things happened in. Holding the backlog lock across the write
//! also makes the journal the only writer.

use std::collections::VecDeque;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::warn;

use crate::db::{Db, MoistureSample, Note, PumpEvent, ReservoirEntry, Source};
use crate::error::PersistenceError;

/// Records kept while the database is unavailable.
const BACKLOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Moisture(MoistureSample),
    Pump(PumpEvent),
    Reservoir(ReservoirEntry),
    Note(Note),
}

impl Record {
    fn kind(&self) -> &'static str {
        match self {
            Record::Moisture(_) => "moisture",
            Record::Pump(_) => "pump_event",
            Record::Reservoir(_) => "reservoir",
            Record::Note(_) => "note",
        }
    }
}

pub struct Journal {
    db: Db,
    backlog: Mutex<VecDeque<Record>>,
}

impl Journal {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Queue `record` and write everything pending. On failure the record
    /// stays queued and the error is returned for the caller to report.
    pub async fn append(&self, record: Record) -> Result<(), PersistenceError> {
        let mut backlog = self.backlog.lock().await;
        backlog.push_back(record);

        if backlog.len() > BACKLOG_CAPACITY {
            let dropped = backlog.len() - BACKLOG_CAPACITY;
            backlog.drain(..dropped);
            warn!(dropped, "journal backlog full, oldest records dropped");
        }

        self.flush_locked(&mut backlog).await
    }

    /// Retry whatever is pending without adding anything.
    #[cfg(test)]
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let mut backlog = self.backlog.lock().await;
        self.flush_locked(&mut backlog).await
    }

    pub async fn pending(&self) -> usize {
        self.backlog.lock().await.len()
    }

    pub async fn moisture(&self, sample: MoistureSample) -> Result<(), PersistenceError> {
        self.append(Record::Moisture(sample)).await
    }

    pub async fn pump(&self, event: PumpEvent) -> Result<(), PersistenceError> {
        self.append(Record::Pump(event)).await
    }

    pub async fn reservoir(&self, entry: ReservoirEntry) -> Result<(), PersistenceError> {
        self.append(Record::Reservoir(entry)).await
    }

    pub async fn note(
        &self,
        message: impl Into<String>,
        source: Source,
    ) -> Result<(), PersistenceError> {
        self.append(Record::Note(Note::now(message, source))).await
    }

    async fn flush_locked(&self, backlog: &mut VecDeque<Record>) -> Result<(), PersistenceError> {
        let before = backlog.len();

        while let Some(next) = backlog.front() {
            if let Err(e) = self.write(next).await {
                warn!(
                    kind = next.kind(),
                    pending = backlog.len(),
                    "journal write failed, will retry: {e:#}"
                );
                return Err(PersistenceError(e));
            }
            backlog.pop_front();
        }

        if before > 1 {
            tracing::info!(written = before, "journal backlog flushed");
        }
        Ok(())
    }

    async fn write(&self, record: &Record) -> Result<()> {
        match record {
            Record::Moisture(sample) => self.db.append_moisture(sample).await,
            Record::Pump(event) => self.db.append_event(event).await,
            Record::Reservoir(entry) => self.db.set_reservoir_level(entry).await,
            Record::Note(note) => self.db.append_note(note).await,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
