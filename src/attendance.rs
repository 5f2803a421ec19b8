//! Attendance sessions: clock-in/clock-out with a zone check.
//!
//! Clock-in compares against the zone's raw radius (no safety buffer).
//! At most one open session per agent per UTC day; a closed session is
//! never reopened.

use crate::cache::AgentContextCache;
use crate::error::{FieldError, FieldResult};
use crate::geo;
use crate::persistence::Persistence;
use crate::types::{new_record_id, AttendanceSession, AttendanceStatus, Coord};
use crate::zone_state::AgentLocks;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;

pub struct AttendanceGate {
    persistence: Persistence,
    cache: AgentContextCache,
    locks: AgentLocks,
}

impl AttendanceGate {
    pub fn new(persistence: Persistence, cache: AgentContextCache, locks: AgentLocks) -> Self {
        Self {
            persistence,
            cache,
            locks,
        }
    }

    pub async fn clock_in(
        &self,
        agent_id: &str,
        position: Coord,
        at: DateTime<Utc>,
    ) -> FieldResult<AttendanceSession> {
        let position = geo::validate(position)?;
        let context = self
            .cache
            .get(agent_id)
            .await?
            .ok_or_else(|| FieldError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;

        let (status, distance_meters) = match &context.zone {
            Some(zone) => {
                let distance = geo::distance_meters(position, zone.center)?;
                let present = context.bypass_geofence || distance <= zone.radius_meters;
                let status = if present {
                    AttendanceStatus::Present
                } else {
                    AttendanceStatus::OffSite
                };
                (status, Some(distance))
            }
            None => (AttendanceStatus::Present, None),
        };

        let date = at.date_naive();
        let _guard = self.locks.acquire(agent_id).await;
        if self.persistence.find_open_session_on(agent_id, date)?.is_some() {
            return Err(FieldError::DuplicateClockIn {
                agent_id: agent_id.to_string(),
                date: date.to_string(),
            });
        }

        let session = AttendanceSession {
            id: new_record_id(),
            agent_id: agent_id.to_string(),
            date,
            check_in_at: at,
            check_out_at: None,
            status,
            check_in_position: position,
            distance_meters,
        };
        self.persistence.insert_session(&session)?;

        info!(
            "Agent {} clocked in ({}, {:?} m)",
            agent_id,
            status.as_str(),
            distance_meters.map(|d| d.round())
        );
        Ok(session)
    }

    /// Close the agent's most recent open session.
    pub async fn clock_out(&self, agent_id: &str, at: DateTime<Utc>) -> FieldResult<AttendanceSession> {
        let _guard = self.locks.acquire(agent_id).await;
        let no_open = || FieldError::NoOpenSession {
            agent_id: agent_id.to_string(),
        };

        let mut session = self
            .persistence
            .latest_open_session(agent_id)?
            .ok_or_else(no_open)?;
        if !self.persistence.close_session(&session.id, at)? {
            return Err(no_open());
        }

        session.check_out_at = Some(at);
        info!("Agent {} clocked out of session {}", agent_id, session.id);
        Ok(session)
    }

    pub fn sessions_on(&self, agent_id: &str, date: NaiveDate) -> FieldResult<Vec<AttendanceSession>> {
        Ok(self.persistence.list_sessions_for_day(agent_id, date)?)
    }
}
