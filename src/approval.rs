// ✋ Approval Gate
// Pending → Approved | Rejected, decided exactly once per review
//
// State lives in its own SQLite database (not the history database) next to
// the staged batch the reviewer saw and an append-only event log.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::fx::FxRate;
use crate::period::Period;
use crate::record::SieforeRecord;

// ============================================================================
// STATES & DECISIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalState::Pending),
            "approved" => Ok(ApprovalState::Approved),
            "rejected" => Ok(ApprovalState::Rejected),
            other => Err(format!("unknown approval state '{}'", other)),
        }
    }
}

/// External reviewer's verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn target_state(&self) -> ApprovalState {
        match self {
            Decision::Approve => ApprovalState::Approved,
            Decision::Reject => ApprovalState::Rejected,
        }
    }
}

/// One review of one period
///
/// A forced re-review never edits a decided status; it opens the next
/// revision as a separate record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStatus {
    pub period: Period,
    pub revision: u32,
    pub state: ApprovalState,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub record_count: usize,
    pub batch_digest: String,
}

impl ApprovalStatus {
    pub fn is_approved(&self) -> bool {
        self.state == ApprovalState::Approved
    }
}

// ============================================================================
// STAGED BATCH
// ============================================================================

/// Normalized records waiting for a decision, plus the rate used
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedBatch {
    pub period: Period,
    pub fx: FxRate,
    pub records: Vec<SieforeRecord>,
}

impl StagedBatch {
    pub fn new(period: Period, fx: FxRate, records: Vec<SieforeRecord>) -> Self {
        StagedBatch { period, fx, records }
    }

    /// SHA-256 over the serialized records, so the approved batch is the reviewed one
    pub fn digest(&self) -> Result<String> {
        let json = serde_json::to_string(&self.records)?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

// ============================================================================
// EVENTS (audit trail)
// ============================================================================

/// Every state change of a period is recorded as an event
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub period: Period,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(event_type: &str, period: Period, data: serde_json::Value, actor: &str) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            period,
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// GATE
// ============================================================================

pub struct ApprovalGate {
    conn: Connection,
}

impl ApprovalGate {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        setup_state_database(&conn)?;
        Ok(ApprovalGate { conn })
    }

    /// Latest revision for the period, if any review was ever opened
    pub fn current(&self, period: Period) -> Result<Option<ApprovalStatus>> {
        let status = self
            .conn
            .query_row(
                "SELECT period, revision, state, created_at, decided_at, record_count, batch_digest
                 FROM approvals
                 WHERE period = ?1
                 ORDER BY revision DESC
                 LIMIT 1",
                params![period.to_string()],
                status_from_row,
            )
            .optional()?;
        Ok(status)
    }

    /// Every revision for the period, oldest first
    pub fn history(&self, period: Period) -> Result<Vec<ApprovalStatus>> {
        let mut stmt = self.conn.prepare(
            "SELECT period, revision, state, created_at, decided_at, record_count, batch_digest
             FROM approvals
             WHERE period = ?1
             ORDER BY revision ASC",
        )?;
        let statuses = stmt
            .query_map(params![period.to_string()], status_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(statuses)
    }

    /// Stage a batch and open (or refresh) its Pending review
    ///
    /// - no status yet: revision 1, Pending
    /// - Pending: the staged batch is replaced, same revision
    /// - decided: refused with AlreadyDecided unless `force_rereview`, which
    ///   opens the next revision and leaves the decided one untouched
    pub fn open_review(&mut self, batch: &StagedBatch, force_rereview: bool) -> Result<ApprovalStatus> {
        let period = batch.period;
        let digest = batch.digest()?;
        let current = self.current(period)?;
        let now = Utc::now();

        let status = match current {
            Some(existing) if existing.state.is_terminal() && !force_rereview => {
                return Err(PipelineError::AlreadyDecided {
                    period,
                    state: existing.state,
                });
            }
            Some(existing) if existing.state.is_terminal() => ApprovalStatus {
                period,
                revision: existing.revision + 1,
                state: ApprovalState::Pending,
                created_at: now,
                decided_at: None,
                record_count: batch.records.len(),
                batch_digest: digest,
            },
            Some(existing) => ApprovalStatus {
                record_count: batch.records.len(),
                batch_digest: digest,
                ..existing
            },
            None => ApprovalStatus {
                period,
                revision: 1,
                state: ApprovalState::Pending,
                created_at: now,
                decided_at: None,
                record_count: batch.records.len(),
                batch_digest: digest,
            },
        };

        let batch_json = serde_json::to_string(batch)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO approvals (period, revision, state, created_at, decided_at, record_count, batch_digest)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)
             ON CONFLICT(period, revision) DO UPDATE SET
                record_count = excluded.record_count,
                batch_digest = excluded.batch_digest
             WHERE approvals.state = 'pending'",
            params![
                period.to_string(),
                status.revision,
                status.state.as_str(),
                status.created_at.to_rfc3339(),
                status.record_count as i64,
                status.batch_digest,
            ],
        )?;
        tx.execute(
            "INSERT INTO staged_batches (period, staged_at, batch) VALUES (?1, ?2, ?3)
             ON CONFLICT(period) DO UPDATE SET staged_at = excluded.staged_at, batch = excluded.batch",
            params![period.to_string(), now.to_rfc3339(), batch_json],
        )?;
        tx.commit()?;

        info!(%period, revision = status.revision, records = status.record_count, "review opened");
        Ok(status)
    }

    /// Record the reviewer's decision on the current revision
    pub fn decide(&mut self, period: Period, decision: Decision) -> Result<ApprovalStatus> {
        let current = self
            .current(period)?
            .ok_or(PipelineError::NoApproval(period))?;

        if current.state.is_terminal() {
            return Err(PipelineError::AlreadyDecided {
                period,
                state: current.state,
            });
        }

        let decided_at = Utc::now();
        let state = decision.target_state();
        let changed = self.conn.execute(
            "UPDATE approvals SET state = ?1, decided_at = ?2
             WHERE period = ?3 AND revision = ?4 AND state = 'pending'",
            params![state.as_str(), decided_at.to_rfc3339(), period.to_string(), current.revision],
        )?;

        if changed != 1 {
            // Someone else decided between our read and write
            let now = self.current(period)?.map(|s| s.state).unwrap_or(state);
            return Err(PipelineError::AlreadyDecided { period, state: now });
        }

        info!(%period, revision = current.revision, %state, "review decided");
        Ok(ApprovalStatus {
            state,
            decided_at: Some(decided_at),
            ..current
        })
    }

    /// The batch currently staged for the period
    pub fn staged_batch(&self, period: Period) -> Result<StagedBatch> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT batch FROM staged_batches WHERE period = ?1",
                params![period.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let json = json.ok_or(PipelineError::NothingStaged(period))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Insert event into audit trail
    pub fn record_event(&self, event: &Event) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)?;
        self.conn.execute(
            "INSERT INTO events (event_id, timestamp, event_type, period, data, actor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.period.to_string(),
                data_json,
                event.actor,
            ],
        )?;
        Ok(())
    }

    /// Events for a period, newest first
    pub fn events_for_period(&self, period: Period) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, period, data, actor
             FROM events
             WHERE period = ?1
             ORDER BY id DESC",
        )?;

        let events = stmt
            .query_map(params![period.to_string()], |row| {
                let timestamp: String = row.get(1)?;
                let period: String = row.get(3)?;
                let data: String = row.get(4)?;
                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: parse_timestamp(1, &timestamp)?,
                    event_type: row.get(2)?,
                    period: parse_period(3, &period)?,
                    data: serde_json::from_str(&data).map_err(|e| conversion_error(4, e))?,
                    actor: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

fn setup_state_database(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS approvals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            period TEXT NOT NULL,
            revision INTEGER NOT NULL,
            state TEXT NOT NULL CHECK (state IN ('pending', 'approved', 'rejected')),
            created_at TEXT NOT NULL,
            decided_at TEXT,
            record_count INTEGER NOT NULL,
            batch_digest TEXT NOT NULL,
            UNIQUE (period, revision)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staged_batches (
            period TEXT PRIMARY KEY,
            staged_at TEXT NOT NULL,
            batch TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            period TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_period ON events(period)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_period(idx: usize, text: &str) -> rusqlite::Result<Period> {
    Period::parse(text).map_err(|e| conversion_error(idx, e))
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalStatus> {
    let period: String = row.get(0)?;
    let state: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let decided_at: Option<String> = row.get(4)?;
    let record_count: i64 = row.get(5)?;

    Ok(ApprovalStatus {
        period: parse_period(0, &period)?,
        revision: row.get(1)?,
        state: state
            .parse::<ApprovalState>()
            .map_err(|e| conversion_error(2, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?,
        created_at: parse_timestamp(3, &created_at)?,
        decided_at: decided_at.map(|s| parse_timestamp(4, &s)).transpose()?,
        record_count: record_count as usize,
        batch_digest: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Afore, Concept, Fund};
    use rust_decimal::Decimal;

    fn nov() -> Period {
        Period::new(2025, 11).unwrap()
    }

    fn batch(value: i64) -> StagedBatch {
        let fx = FxRate {
            period: nov(),
            rate_value: Decimal::new(185725, 4),
            source_timestamp: Utc::now(),
        };
        let records = vec![SieforeRecord::new(
            nov(),
            Fund::Pensiones,
            Concept::TotalAssets,
            Afore::Coppel,
            Decimal::from(value),
        )];
        StagedBatch::new(nov(), fx, records)
    }

    #[test]
    fn test_open_review_creates_pending() {
        let mut gate = ApprovalGate::open_in_memory().unwrap();
        let status = gate.open_review(&batch(1), false).unwrap();

        assert_eq!(status.state, ApprovalState::Pending);
        assert_eq!(status.revision, 1);
        assert_eq!(status.record_count, 1);
        assert!(status.decided_at.is_none());
        assert_eq!(gate.current(nov()).unwrap(), Some(status));
    }

    #[test]
    fn test_decide_is_once_only() {
        let mut gate = ApprovalGate::open_in_memory().unwrap();
        gate.open_review(&batch(1), false).unwrap();

        let approved = gate.decide(nov(), Decision::Approve).unwrap();
        assert_eq!(approved.state, ApprovalState::Approved);
        assert!(approved.decided_at.is_some());

        let err = gate.decide(nov(), Decision::Reject).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::AlreadyDecided { state: ApprovalState::Approved, .. }
        ));
        assert_eq!(gate.current(nov()).unwrap().unwrap().state, ApprovalState::Approved);
    }

    #[test]
    fn test_decide_without_review() {
        let mut gate = ApprovalGate::open_in_memory().unwrap();
        assert!(matches!(
            gate.decide(nov(), Decision::Approve),
            Err(PipelineError::NoApproval(_))
        ));
    }

    #[test]
    fn test_rerun_after_decision_needs_force() {
        let mut gate = ApprovalGate::open_in_memory().unwrap();
        gate.open_review(&batch(1), false).unwrap();
        gate.decide(nov(), Decision::Reject).unwrap();

        let err = gate.open_review(&batch(2), false).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyDecided { .. }));
        // Nothing re-staged either
        assert_eq!(gate.staged_batch(nov()).unwrap().records[0].value_mxn, Decimal::from(1));

        let reopened = gate.open_review(&batch(2), true).unwrap();
        assert_eq!(reopened.revision, 2);
        assert_eq!(reopened.state, ApprovalState::Pending);

        let history = gate.history(nov()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, ApprovalState::Rejected);
        assert!(history[0].decided_at.is_some());
        assert_eq!(history[1].state, ApprovalState::Pending);
    }

    #[test]
    fn test_pending_rerun_refreshes_batch() {
        let mut gate = ApprovalGate::open_in_memory().unwrap();
        let first = gate.open_review(&batch(1), false).unwrap();
        let second = gate.open_review(&batch(2), false).unwrap();

        assert_eq!(second.revision, 1);
        assert_eq!(second.created_at, first.created_at);
        assert_ne!(second.batch_digest, first.batch_digest);
        assert_eq!(gate.current(nov()).unwrap().unwrap().batch_digest, second.batch_digest);
        assert_eq!(gate.staged_batch(nov()).unwrap().records[0].value_mxn, Decimal::from(2));
    }

    #[test]
    fn test_staged_batch_missing() {
        let gate = ApprovalGate::open_in_memory().unwrap();
        assert!(matches!(gate.staged_batch(nov()), Err(PipelineError::NothingStaged(_))));
    }

    #[test]
    fn test_digest_is_stable() {
        let a = batch(7);
        let b = batch(7);
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);
        assert_ne!(a.digest().unwrap(), batch(8).digest().unwrap());
    }

    #[test]
    fn test_event_log() {
        let gate = ApprovalGate::open_in_memory().unwrap();
        let event = Event::new("review_opened", nov(), serde_json::json!({"records": 3}), "pipeline");
        gate.record_event(&event).unwrap();

        let events = gate.events_for_period(nov()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "review_opened");
        assert_eq!(events[0].data["records"], 3);
        assert!(gate.events_for_period(nov().previous()).unwrap().is_empty());
    }
}
