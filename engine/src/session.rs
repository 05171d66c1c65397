//! Sync session state.
//!
//! A session is one bounded exchange between two nodes. It starts `Created`,
//! alternates between `Outgoing` and `Incoming` phases in whatever order the
//! peer drives it, and ends `Closed`, either explicitly or by the reaper once
//! it has gone quiet for too long.

use crate::{error::Result, Error, SessionId, Tick};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Outgoing,
    Incoming,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "CREATED",
            SessionStatus::Outgoing => "OUTGOING",
            SessionStatus::Incoming => "INCOMING",
            SessionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(SessionStatus::Created),
            "OUTGOING" => Some(SessionStatus::Outgoing),
            "INCOMING" => Some(SessionStatus::Incoming),
            "CLOSED" => Some(SessionStatus::Closed),
            _ => None,
        }
    }

    /// `Closed` is terminal and nothing returns to `Created`. Staying in the
    /// same phase is allowed so a phase can be driven in several requests.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Closed, _) => false,
            (_, SessionStatus::Created) => false,
            _ => true,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One synchronization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    pub last_connection_time: DateTime<Utc>,
    /// Captured once at start; becomes the outgoing watermark when the
    /// outgoing phase commits.
    pub sync_tick: Tick,
    pub status: SessionStatus,
    /// Set when the session failed; every later request is refused with it.
    pub error: Option<String>,
    pub snapshot_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Watermark the outgoing snapshot started from.
    pub outgoing_since: Option<Tick>,
    /// Whether `outgoing_since` came from the cursor, so completing the pull
    /// must advance it.
    pub advance_outgoing_cursor: bool,
    pub debug_info: serde_json::Value,
}

impl SyncSession {
    pub fn new(id: SessionId, sync_tick: Tick, now: DateTime<Utc>, debug_info: serde_json::Value) -> Self {
        Self {
            id,
            start_time: now,
            last_connection_time: now,
            sync_tick,
            status: SessionStatus::Created,
            error: None,
            snapshot_completed_at: None,
            completed_at: None,
            outgoing_since: None,
            advance_outgoing_cursor: false,
            debug_info,
        }
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_connection_time = now;
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }

    /// No heartbeat for longer than `max_idle`. Closed sessions never lapse.
    pub fn is_lapsed(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        !self.is_closed() && now - self.last_connection_time > max_idle
    }

    pub fn close(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(SessionStatus::Closed)?;
        self.completed_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn session() -> SyncSession {
        SyncSession::new(Uuid::new_v4(), 7, Utc::now(), serde_json::Value::Null)
    }

    #[test]
    fn phases_alternate_then_close() {
        let mut s = session();
        s.transition(SessionStatus::Incoming).unwrap();
        s.transition(SessionStatus::Incoming).unwrap();
        s.transition(SessionStatus::Outgoing).unwrap();
        s.close(Utc::now()).unwrap();
        assert!(s.is_closed());
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn closed_is_terminal() {
        let mut s = session();
        s.close(Utc::now()).unwrap();
        let err = s.transition(SessionStatus::Outgoing).unwrap_err();
        assert_eq!(
            err,
            Error::IllegalTransition {
                from: "CLOSED".into(),
                to: "OUTGOING".into()
            }
        );
        assert!(s.close(Utc::now()).is_err());
    }

    #[test]
    fn never_back_to_created() {
        let mut s = session();
        s.transition(SessionStatus::Outgoing).unwrap();
        assert!(s.transition(SessionStatus::Created).is_err());
    }

    #[test]
    fn lapse_uses_last_connection() {
        let mut s = session();
        let now = s.last_connection_time;
        assert!(!s.is_lapsed(now + Duration::seconds(60), Duration::seconds(120)));
        assert!(s.is_lapsed(now + Duration::seconds(121), Duration::seconds(120)));

        s.touch(now + Duration::seconds(100));
        assert!(!s.is_lapsed(now + Duration::seconds(121), Duration::seconds(120)));

        s.close(now).unwrap();
        assert!(!s.is_lapsed(now + Duration::days(1), Duration::seconds(120)));
    }

    #[test]
    fn status_strings() {
        assert_eq!(SessionStatus::parse("INCOMING"), Some(SessionStatus::Incoming));
        assert_eq!(SessionStatus::Outgoing.as_str(), "OUTGOING");
        let json = serde_json::to_string(&SessionStatus::Created).unwrap();
        assert_eq!(json, "\"CREATED\"");
    }
}
