use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::db::{Source, Transition};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Live view for the dashboard. Nothing in here feeds back into control.
pub struct SystemState {
    pub started_at: Instant,
    pub last_moisture: Option<LastReading>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LastReading {
    pub percent: u8,
    pub fresh: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Moisture,
    Pump,
    Error,
    System,
    Config,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ActivityResponse {
    pub uptime_secs: u64,
    pub last_moisture: Option<LastReading>,
    /// Newest first.
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_moisture: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record the reading a cycle acted on. Only changes make it into the
    /// event feed, otherwise a 1 s loop would flush it within minutes.
    pub fn record_moisture(&mut self, percent: u8, fresh: bool) {
        let changed = self.last_moisture.map(|r| r.percent) != Some(percent);
        self.last_moisture = Some(LastReading {
            percent,
            fresh,
            ts: OffsetDateTime::now_utc(),
        });
        if changed {
            let suffix = if fresh { "" } else { " (stale)" };
            self.push_event(EventKind::Moisture, format!("moisture {percent}%{suffix}"));
        }
    }

    pub fn record_pump(&mut self, transition: Transition, source: Source) {
        self.push_event(
            EventKind::Pump,
            format!(
                "pump {} ({})",
                transition.as_str().to_uppercase(),
                source.as_str()
            ),
        );
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn record_config(&mut self, detail: String) {
        self.push_event(EventKind::Config, detail);
    }

    pub fn to_activity(&self) -> ActivityResponse {
        ActivityResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_moisture: self.last_moisture,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_newest_events() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 5) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 5");

        let activity = st.to_activity();
        assert_eq!(activity.events[0].detail, format!("event {}", MAX_EVENTS + 4));
    }

    #[test]
    fn repeated_moisture_is_not_re_logged() {
        let mut st = SystemState::new();
        st.record_moisture(40, true);
        st.record_moisture(40, true);
        st.record_moisture(41, false);

        assert_eq!(st.events.len(), 2);
        assert_eq!(st.events[1].detail, "moisture 41% (stale)");
        assert_eq!(st.last_moisture.unwrap().percent, 41);
    }

    #[test]
    fn pump_events_name_transition_and_source() {
        let mut st = SystemState::new();
        st.record_pump(Transition::On, Source::Manual);
        assert_eq!(st.events[0].kind, EventKind::Pump);
        assert_eq!(st.events[0].detail, "pump ON (manual)");
    }
}
