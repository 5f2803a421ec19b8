//! Transition, compliance and attendance records.

use super::{millis_to_datetime, Persistence};
use crate::types::{
    AttendanceSession, AttendanceStatus, ComplianceRecord, Coord, Severity, TransitionKind,
    ZoneTransitionEvent,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use duckdb::{params, Connection, OptionalExt, Row};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SESSION_COLUMNS: &str = "id, agent_id, work_date, check_in_at, check_out_at, status,
    check_in_lat, check_in_lng, distance_meters";

pub(super) fn insert_transition(conn: &Connection, event: &ZoneTransitionEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO zone_transitions (id, agent_id, zone_id, kind, lat, lng, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            event.id,
            event.agent_id,
            event.zone_id,
            event.kind.as_str(),
            event.lat,
            event.lng,
            event.occurred_at.timestamp_millis(),
        ],
    )
    .with_context(|| format!("Failed to insert transition for agent {}", event.agent_id))?;
    Ok(())
}

impl Persistence {
    /// Most recent transitions first.
    pub fn list_transitions(&self, agent_id: &str, limit: usize) -> Result<Vec<ZoneTransitionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, agent_id, zone_id, kind, lat, lng, occurred_at
             FROM zone_transitions WHERE agent_id = ?
             ORDER BY occurred_at DESC, id DESC LIMIT {}",
            limit
        ))?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, agent_id, zone_id, kind, lat, lng, occurred_at) = row?;
            events.push(ZoneTransitionEvent {
                id,
                agent_id,
                zone_id,
                kind: TransitionKind::from_str(&kind)
                    .ok_or_else(|| anyhow!("unknown transition kind '{}'", kind))?,
                lat,
                lng,
                occurred_at: millis_to_datetime(occurred_at)?,
            });
        }
        Ok(events)
    }

    pub fn insert_compliance_record(&self, record: &ComplianceRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO compliance_records
                (id, agent_id, zone_id, kind, severity, distance_meters, description, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.agent_id,
                record.zone_id,
                record.kind,
                record.severity.as_str(),
                record.distance_meters,
                record.description,
                record.created_at.timestamp_millis(),
            ],
        )
        .with_context(|| format!("Failed to insert compliance record for {}", record.agent_id))?;
        Ok(())
    }

    /// Most recent records first.
    pub fn list_compliance_records(&self, agent_id: &str, limit: usize) -> Result<Vec<ComplianceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, agent_id, zone_id, kind, severity, distance_meters, description, created_at
             FROM compliance_records WHERE agent_id = ?
             ORDER BY created_at DESC, id DESC LIMIT {}",
            limit
        ))?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, agent_id, zone_id, kind, severity, distance_meters, description, created_at) =
                row?;
            records.push(ComplianceRecord {
                id,
                agent_id,
                zone_id,
                kind,
                severity: Severity::from_str(&severity)
                    .ok_or_else(|| anyhow!("unknown severity '{}'", severity))?,
                distance_meters,
                description,
                created_at: millis_to_datetime(created_at)?,
            });
        }
        Ok(records)
    }

    // ---------- Attendance ----------

    pub fn insert_session(&self, session: &AttendanceSession) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO attendance_sessions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                SESSION_COLUMNS
            ),
            params![
                session.id,
                session.agent_id,
                session.date.format(DATE_FORMAT).to_string(),
                session.check_in_at.timestamp_millis(),
                session.check_out_at.map(|t| t.timestamp_millis()),
                session.status.as_str(),
                session.check_in_position.lat,
                session.check_in_position.lng,
                session.distance_meters,
            ],
        )
        .with_context(|| format!("Failed to insert session for {}", session.agent_id))?;
        Ok(())
    }

    /// The open session for `agent_id` on `date`, if any.
    pub fn find_open_session_on(
        &self,
        agent_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceSession>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM attendance_sessions
                     WHERE agent_id = ? AND work_date = ? AND check_out_at IS NULL
                     ORDER BY check_in_at DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![agent_id, date.format(DATE_FORMAT).to_string()],
                SessionRow::from_row,
            )
            .optional()
            .with_context(|| format!("Failed to look up open session for {}", agent_id))?;
        row.map(SessionRow::into_session).transpose()
    }

    /// The most recently opened session still open, on any date.
    pub fn latest_open_session(&self, agent_id: &str) -> Result<Option<AttendanceSession>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM attendance_sessions
                     WHERE agent_id = ? AND check_out_at IS NULL
                     ORDER BY check_in_at DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![agent_id],
                SessionRow::from_row,
            )
            .optional()
            .with_context(|| format!("Failed to look up open session for {}", agent_id))?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Close an open session. Returns `false` if it was already closed.
    pub fn close_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE attendance_sessions SET check_out_at = ?
                 WHERE id = ? AND check_out_at IS NULL",
                params![at.timestamp_millis(), session_id],
            )
            .with_context(|| format!("Failed to close session {}", session_id))?;
        Ok(updated > 0)
    }

    pub fn list_sessions_for_day(
        &self,
        agent_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM attendance_sessions
             WHERE agent_id = ? AND work_date = ?
             ORDER BY check_in_at ASC",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![agent_id, date.format(DATE_FORMAT).to_string()],
            SessionRow::from_row,
        )?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_session()?);
        }
        Ok(sessions)
    }
}

struct SessionRow {
    id: String,
    agent_id: String,
    work_date: String,
    check_in_at: i64,
    check_out_at: Option<i64>,
    status: String,
    check_in_lat: f64,
    check_in_lng: f64,
    distance_meters: Option<f64>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            work_date: row.get(2)?,
            check_in_at: row.get(3)?,
            check_out_at: row.get(4)?,
            status: row.get(5)?,
            check_in_lat: row.get(6)?,
            check_in_lng: row.get(7)?,
            distance_meters: row.get(8)?,
        })
    }

    fn into_session(self) -> Result<AttendanceSession> {
        Ok(AttendanceSession {
            date: NaiveDate::parse_from_str(&self.work_date, DATE_FORMAT)
                .with_context(|| format!("invalid work date '{}'", self.work_date))?,
            status: AttendanceStatus::from_str(&self.status)
                .ok_or_else(|| anyhow!("unknown attendance status '{}'", self.status))?,
            check_in_at: millis_to_datetime(self.check_in_at)?,
            check_out_at: self.check_out_at.map(millis_to_datetime).transpose()?,
            check_in_position: Coord::new(self.check_in_lat, self.check_in_lng),
            distance_meters: self.distance_meters,
            id: self.id,
            agent_id: self.agent_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_record_id, GEOFENCE_BREACH};
    use chrono::Duration;

    fn session(agent_id: &str, date: NaiveDate, at: DateTime<Utc>) -> AttendanceSession {
        AttendanceSession {
            id: new_record_id(),
            agent_id: agent_id.to_string(),
            date,
            check_in_at: at,
            check_out_at: None,
            status: AttendanceStatus::Present,
            check_in_position: Coord::new(5.6, -0.18),
            distance_meters: Some(12.5),
        }
    }

    #[test]
    fn test_compliance_records_most_recent_first() {
        let persistence = Persistence::in_memory().unwrap();
        let base = Utc::now();
        for (i, severity) in [Severity::Warning, Severity::Critical, Severity::Warning]
            .into_iter()
            .enumerate()
        {
            persistence
                .insert_compliance_record(&ComplianceRecord {
                    id: new_record_id(),
                    agent_id: "a1".to_string(),
                    zone_id: "z1".to_string(),
                    kind: GEOFENCE_BREACH.to_string(),
                    severity,
                    distance_meters: 400.0 + i as f64,
                    description: format!("breach {}", i),
                    created_at: base + Duration::seconds(i as i64),
                })
                .unwrap();
        }

        let records = persistence.list_compliance_records("a1", 2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].description, "breach 2");
        assert_eq!(records[1].severity, Severity::Critical);
        assert!(persistence.list_compliance_records("a2", 10).unwrap().is_empty());
    }

    #[test]
    fn test_session_lifecycle() {
        let persistence = Persistence::in_memory().unwrap();
        let now = Utc::now();
        let today = now.date_naive();
        let open = session("a1", today, now);
        persistence.insert_session(&open).unwrap();

        let found = persistence.find_open_session_on("a1", today).unwrap().unwrap();
        assert_eq!(found.id, open.id);
        assert_eq!(found.distance_meters, Some(12.5));
        assert!(persistence
            .find_open_session_on("a1", today.pred_opt().unwrap())
            .unwrap()
            .is_none());

        assert!(persistence.close_session(&open.id, now + Duration::hours(8)).unwrap());
        assert!(!persistence.close_session(&open.id, now + Duration::hours(9)).unwrap());
        assert!(persistence.latest_open_session("a1").unwrap().is_none());

        let sessions = persistence.list_sessions_for_day("a1", today).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_open());
    }

    #[test]
    fn test_latest_open_session_spans_days() {
        let persistence = Persistence::in_memory().unwrap();
        let now = Utc::now();
        let yesterday = now - Duration::days(1);
        let stale = session("a1", yesterday.date_naive(), yesterday);
        persistence.insert_session(&stale).unwrap();

        assert!(persistence
            .find_open_session_on("a1", now.date_naive())
            .unwrap()
            .is_none());
        let latest = persistence.latest_open_session("a1").unwrap().unwrap();
        assert_eq!(latest.id, stale.id);
    }
}
