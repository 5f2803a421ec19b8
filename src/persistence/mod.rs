//! DuckDB-backed storage for agents, zones and the engine's append-only logs.
//!
//! All timestamps are stored as UTC epoch milliseconds. The connection sits
//! behind a mutex; statements are short and never held across an await.

mod records;

use crate::types::{Agent, AgentContext, Coord, Zone};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection, OptionalExt};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Radius applied to zones stored without a usable radius.
pub const DEFAULT_ZONE_RADIUS_METERS: f64 = 100.0;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS zones (
    id VARCHAR PRIMARY KEY,
    name VARCHAR,
    center_lat DOUBLE NOT NULL,
    center_lng DOUBLE NOT NULL,
    radius_meters DOUBLE
);

CREATE TABLE IF NOT EXISTS agents (
    id VARCHAR PRIMARY KEY,
    assigned_zone_id VARCHAR,
    bypass_geofence BOOLEAN NOT NULL DEFAULT FALSE,
    last_lat DOUBLE,
    last_lng DOUBLE,
    last_seen_at BIGINT,
    fix_lat DOUBLE,
    fix_lng DOUBLE,
    fix_at BIGINT,
    inside_zone BOOLEAN,
    state_changed_at BIGINT,
    last_action_at BIGINT
);

CREATE TABLE IF NOT EXISTS zone_transitions (
    id VARCHAR PRIMARY KEY,
    agent_id VARCHAR NOT NULL,
    zone_id VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    lat DOUBLE NOT NULL,
    lng DOUBLE NOT NULL,
    occurred_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS compliance_records (
    id VARCHAR PRIMARY KEY,
    agent_id VARCHAR NOT NULL,
    zone_id VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    severity VARCHAR NOT NULL,
    distance_meters DOUBLE NOT NULL,
    description VARCHAR NOT NULL,
    created_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_sessions (
    id VARCHAR PRIMARY KEY,
    agent_id VARCHAR NOT NULL,
    work_date VARCHAR NOT NULL,
    check_in_at BIGINT NOT NULL,
    check_out_at BIGINT,
    status VARCHAR NOT NULL,
    check_in_lat DOUBLE NOT NULL,
    check_in_lng DOUBLE NOT NULL,
    distance_meters DOUBLE
);
"#;

/// A position/state write for one agent, applied only if it is not older
/// than the agent's stored `last_seen_at`.
#[derive(Debug, Clone)]
pub struct AgentUpdate {
    pub agent_id: String,
    pub position: Coord,
    pub seen_at: DateTime<Utc>,
    /// Also store the position as the agent's last state-eligible fix.
    pub record_fix: bool,
    /// New `inside_zone` value; `None` leaves the stored value untouched.
    pub inside_zone: Option<bool>,
    /// Set together with `inside_zone` on initialization or a flip.
    pub state_changed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
    default_radius_meters: f64,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("default_radius_meters", &self.default_radius_meters)
            .finish()
    }
}

impl Persistence {
    /// Open (or create) the database at `db_path` and ensure the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        Self::from_connection(conn)
    }

    /// Volatile database, mostly for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            default_radius_meters: DEFAULT_ZONE_RADIUS_METERS,
        })
    }

    pub fn with_default_radius(mut self, radius_meters: f64) -> Self {
        self.default_radius_meters = radius_meters;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    // ---------- Zones ----------

    /// Insert or replace a zone. `radius_meters = None` means "use the default".
    pub fn upsert_zone(
        &self,
        id: &str,
        name: Option<&str>,
        center: Coord,
        radius_meters: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO zones (id, name, center_lat, center_lng, radius_meters)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                center_lat = excluded.center_lat,
                center_lng = excluded.center_lng,
                radius_meters = excluded.radius_meters",
            params![id, name, center.lat, center.lng, radius_meters],
        )
        .with_context(|| format!("Failed to upsert zone {}", id))?;
        Ok(())
    }

    pub fn get_zone(&self, zone_id: &str) -> Result<Option<Zone>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, center_lat, center_lng, radius_meters FROM zones WHERE id = ?",
                params![zone_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("Failed to load zone {}", zone_id))?;

        Ok(row.map(|(id, name, lat, lng, radius)| Zone {
            id,
            name,
            center: Coord::new(lat, lng),
            radius_meters: self.resolve_radius(radius),
        }))
    }

    fn resolve_radius(&self, radius: Option<f64>) -> f64 {
        match radius {
            Some(r) if r.is_finite() && r >= 0.0 => r,
            _ => self.default_radius_meters,
        }
    }

    // ---------- Agents ----------

    /// Provision an agent or update its assignment. Observed state is preserved.
    pub fn upsert_agent(&self, id: &str, zone_id: Option<&str>, bypass_geofence: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agents (id, assigned_zone_id, bypass_geofence)
             VALUES (?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                assigned_zone_id = excluded.assigned_zone_id,
                bypass_geofence = excluded.bypass_geofence",
            params![id, zone_id, bypass_geofence],
        )
        .with_context(|| format!("Failed to upsert agent {}", id))?;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, assigned_zone_id, bypass_geofence, last_lat, last_lng,
                        last_seen_at, fix_lat, fix_lng, fix_at, inside_zone,
                        state_changed_at, last_action_at
                 FROM agents WHERE id = ?",
                params![agent_id],
                |row| {
                    Ok(AgentRow {
                        id: row.get(0)?,
                        assigned_zone_id: row.get(1)?,
                        bypass_geofence: row.get(2)?,
                        last_lat: row.get(3)?,
                        last_lng: row.get(4)?,
                        last_seen_at: row.get(5)?,
                        fix_lat: row.get(6)?,
                        fix_lng: row.get(7)?,
                        fix_at: row.get(8)?,
                        inside_zone: row.get(9)?,
                        state_changed_at: row.get(10)?,
                        last_action_at: row.get(11)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("Failed to load agent {}", agent_id))?;

        row.map(AgentRow::into_agent).transpose()
    }

    /// Resolve what the hot path needs about an agent. A dangling zone
    /// reference degrades to roaming.
    pub fn load_agent_context(&self, agent_id: &str) -> Result<Option<AgentContext>> {
        let Some(agent) = self.get_agent(agent_id)? else {
            return Ok(None);
        };

        let zone = match agent.assigned_zone_id.as_deref() {
            Some(zone_id) => {
                let zone = self.get_zone(zone_id)?;
                if zone.is_none() {
                    tracing::warn!(
                        "Agent {} references unknown zone {}; treating as roaming",
                        agent_id,
                        zone_id
                    );
                }
                zone
            }
            None => None,
        };

        Ok(Some(AgentContext {
            agent_id: agent.id,
            zone,
            bypass_geofence: agent.bypass_geofence,
        }))
    }

    /// Apply a pulse's durable effects in one transaction: the agent row
    /// update and, on a flip, the transition event.
    ///
    /// Returns `false` (and writes nothing) when the stored `last_seen_at` is
    /// newer than `update.seen_at` or the agent doesn't exist.
    pub fn apply_agent_update(
        &self,
        update: &AgentUpdate,
        event: Option<&crate::types::ZoneTransitionEvent>,
    ) -> Result<bool> {
        let seen_at = update.seen_at.timestamp_millis();
        let state_changed_at = update.state_changed_at.map(|t| t.timestamp_millis());
        let fix = update
            .record_fix
            .then(|| (update.position.lat, update.position.lng, seen_at));

        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let updated = tx
            .execute(
                "UPDATE agents SET
                    last_lat = ?,
                    last_lng = ?,
                    last_seen_at = ?,
                    fix_lat = COALESCE(CAST(? AS DOUBLE), fix_lat),
                    fix_lng = COALESCE(CAST(? AS DOUBLE), fix_lng),
                    fix_at = COALESCE(CAST(? AS BIGINT), fix_at),
                    inside_zone = COALESCE(CAST(? AS BOOLEAN), inside_zone),
                    state_changed_at = COALESCE(CAST(? AS BIGINT), state_changed_at)
                 WHERE id = ? AND (last_seen_at IS NULL OR last_seen_at <= ?)",
                params![
                    update.position.lat,
                    update.position.lng,
                    seen_at,
                    fix.map(|(lat, _, _)| lat),
                    fix.map(|(_, lng, _)| lng),
                    fix.map(|(_, _, at)| at),
                    update.inside_zone,
                    state_changed_at,
                    update.agent_id,
                    seen_at,
                ],
            )
            .with_context(|| format!("Failed to update agent {}", update.agent_id))?;

        if updated == 0 {
            tx.rollback().context("Failed to roll back transaction")?;
            return Ok(false);
        }

        if let Some(event) = event {
            records::insert_transition(&tx, event)?;
        }

        tx.commit().context("Failed to commit agent update")?;
        Ok(true)
    }

    /// Stamp a transactional action and return the previous stamp.
    pub fn record_transaction_action(
        &self,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let previous: Option<Option<i64>> = conn
            .query_row(
                "SELECT last_action_at FROM agents WHERE id = ?",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to load agent {}", agent_id))?;

        let Some(previous) = previous else {
            return Err(anyhow!("agent {} not found", agent_id));
        };

        conn.execute(
            "UPDATE agents SET last_action_at = ? WHERE id = ?",
            params![at.timestamp_millis(), agent_id],
        )
        .with_context(|| format!("Failed to stamp action for agent {}", agent_id))?;

        previous.map(millis_to_datetime).transpose()
    }
}

struct AgentRow {
    id: String,
    assigned_zone_id: Option<String>,
    bypass_geofence: bool,
    last_lat: Option<f64>,
    last_lng: Option<f64>,
    last_seen_at: Option<i64>,
    fix_lat: Option<f64>,
    fix_lng: Option<f64>,
    fix_at: Option<i64>,
    inside_zone: Option<bool>,
    state_changed_at: Option<i64>,
    last_action_at: Option<i64>,
}

impl AgentRow {
    fn into_agent(self) -> Result<Agent> {
        let last_position = match (self.last_lat, self.last_lng) {
            (Some(lat), Some(lng)) => Some(Coord::new(lat, lng)),
            _ => None,
        };
        let last_fix = match (self.fix_lat, self.fix_lng, self.fix_at) {
            (Some(lat), Some(lng), Some(at)) => Some((Coord::new(lat, lng), millis_to_datetime(at)?)),
            _ => None,
        };
        Ok(Agent {
            id: self.id,
            assigned_zone_id: self.assigned_zone_id,
            bypass_geofence: self.bypass_geofence,
            last_position,
            last_seen_at: self.last_seen_at.map(millis_to_datetime).transpose()?,
            last_fix,
            inside_zone: self.inside_zone,
            state_changed_at: self.state_changed_at.map(millis_to_datetime).transpose()?,
            last_action_at: self.last_action_at.map(millis_to_datetime).transpose()?,
        })
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_record_id, TransitionKind, ZoneTransitionEvent};
    use chrono::Duration;
    use tempfile::tempdir;

    fn update(agent_id: &str, seen_at: DateTime<Utc>, inside: Option<bool>) -> AgentUpdate {
        AgentUpdate {
            agent_id: agent_id.to_string(),
            position: Coord::new(5.6, -0.18),
            seen_at,
            record_fix: inside.is_some(),
            inside_zone: inside,
            state_changed_at: inside.map(|_| seen_at),
        }
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("field.duckdb");
        let persistence = Persistence::new(&db_path).unwrap();
        persistence.upsert_agent("a1", None, false).unwrap();
        drop(persistence);

        let reopened = Persistence::new(&db_path).unwrap();
        assert!(reopened.get_agent("a1").unwrap().is_some());
    }

    #[test]
    fn test_zone_default_radius() {
        let persistence = Persistence::in_memory().unwrap().with_default_radius(150.0);
        persistence
            .upsert_zone("z1", Some("Depot"), Coord::new(5.6, -0.18), None)
            .unwrap();
        persistence
            .upsert_zone("z2", None, Coord::new(5.6, -0.18), Some(0.0))
            .unwrap();

        assert_eq!(persistence.get_zone("z1").unwrap().unwrap().radius_meters, 150.0);
        assert_eq!(persistence.get_zone("z2").unwrap().unwrap().radius_meters, 0.0);
        assert!(persistence.get_zone("missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_agent_preserves_observed_state() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.upsert_agent("a1", None, false).unwrap();
        let now = Utc::now();
        assert!(persistence
            .apply_agent_update(&update("a1", now, Some(true)), None)
            .unwrap());

        persistence.upsert_agent("a1", Some("z1"), true).unwrap();
        let agent = persistence.get_agent("a1").unwrap().unwrap();
        assert_eq!(agent.assigned_zone_id.as_deref(), Some("z1"));
        assert!(agent.bypass_geofence);
        assert_eq!(agent.inside_zone, Some(true));
        assert_eq!(
            agent.last_seen_at.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn test_context_with_dangling_zone_is_roaming() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.upsert_agent("a1", Some("ghost"), false).unwrap();
        let ctx = persistence.load_agent_context("a1").unwrap().unwrap();
        assert!(ctx.zone.is_none());
        assert!(persistence.load_agent_context("nobody").unwrap().is_none());
    }

    #[test]
    fn test_apply_update_rejects_older_readings() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.upsert_agent("a1", None, false).unwrap();
        let now = Utc::now();

        assert!(persistence
            .apply_agent_update(&update("a1", now, Some(false)), None)
            .unwrap());
        assert!(!persistence
            .apply_agent_update(&update("a1", now - Duration::seconds(5), Some(true)), None)
            .unwrap());
        // Same timestamp is not older.
        assert!(persistence
            .apply_agent_update(&update("a1", now, None), None)
            .unwrap());

        let agent = persistence.get_agent("a1").unwrap().unwrap();
        assert_eq!(agent.inside_zone, Some(false));
    }

    #[test]
    fn test_position_only_update_keeps_last_fix() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.upsert_agent("a1", None, false).unwrap();
        let now = Utc::now();
        persistence
            .apply_agent_update(&update("a1", now, Some(true)), None)
            .unwrap();

        let later = now + Duration::seconds(60);
        let mut noisy = update("a1", later, None);
        noisy.position = Coord::new(5.8, -0.18);
        assert!(persistence.apply_agent_update(&noisy, None).unwrap());

        let agent = persistence.get_agent("a1").unwrap().unwrap();
        assert_eq!(agent.last_position, Some(Coord::new(5.8, -0.18)));
        let (position, at) = agent.last_fix.unwrap();
        assert_eq!(position, Coord::new(5.6, -0.18));
        assert_eq!(at.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_apply_update_unknown_agent_is_noop() {
        let persistence = Persistence::in_memory().unwrap();
        assert!(!persistence
            .apply_agent_update(&update("ghost", Utc::now(), Some(true)), None)
            .unwrap());
    }

    #[test]
    fn test_stale_update_does_not_write_event() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.upsert_agent("a1", Some("z1"), false).unwrap();
        let now = Utc::now();
        persistence
            .apply_agent_update(&update("a1", now, Some(true)), None)
            .unwrap();

        let earlier = now - Duration::seconds(30);
        let event = ZoneTransitionEvent {
            id: new_record_id(),
            agent_id: "a1".to_string(),
            zone_id: "z1".to_string(),
            kind: TransitionKind::Exit,
            lat: 5.6,
            lng: -0.18,
            occurred_at: earlier,
        };
        assert!(!persistence
            .apply_agent_update(&update("a1", earlier, Some(false)), Some(&event))
            .unwrap());
        assert!(persistence.list_transitions("a1", 10).unwrap().is_empty());
    }

    #[test]
    fn test_record_transaction_action_returns_previous() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.upsert_agent("a1", None, false).unwrap();
        let first = Utc::now();
        assert_eq!(persistence.record_transaction_action("a1", first).unwrap(), None);
        let previous = persistence
            .record_transaction_action("a1", first + Duration::seconds(1))
            .unwrap()
            .unwrap();
        assert_eq!(previous.timestamp_millis(), first.timestamp_millis());
        assert!(persistence.record_transaction_action("ghost", first).is_err());
    }
}
