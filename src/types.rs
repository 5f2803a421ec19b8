//! Domain records shared by the engine, persistence and API layers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lng: f64,
}

impl Coord {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// An operating zone: a circle around a center point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: Option<String>,
    pub center: Coord,
    pub radius_meters: f64,
}

/// The durable per-agent record owned by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub assigned_zone_id: Option<String>,
    pub bypass_geofence: bool,
    pub last_position: Option<Coord>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Position and time of the last reading allowed to move zone state.
    /// Position-only readings never replace it.
    pub last_fix: Option<(Coord, DateTime<Utc>)>,
    /// `None` until the first accepted reading establishes the state.
    pub inside_zone: Option<bool>,
    /// When `inside_zone` was last initialized or flipped.
    pub state_changed_at: Option<DateTime<Utc>>,
    pub last_action_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// A freshly provisioned agent with no observations.
    pub fn provisioned(id: impl Into<String>, zone_id: Option<String>, bypass: bool) -> Self {
        Self {
            id: id.into(),
            assigned_zone_id: zone_id,
            bypass_geofence: bypass,
            last_position: None,
            last_seen_at: None,
            last_fix: None,
            inside_zone: None,
            state_changed_at: None,
            last_action_at: None,
        }
    }
}

/// What the context cache holds per agent: everything the hot path needs
/// that doesn't change pulse to pulse.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentContext {
    pub agent_id: String,
    /// `None` for roaming agents and for agents whose zone is missing.
    pub zone: Option<Zone>,
    pub bypass_geofence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    Enter,
    Exit,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Enter => "ENTER",
            TransitionKind::Exit => "EXIT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ENTER" => Some(TransitionKind::Enter),
            "EXIT" => Some(TransitionKind::Exit),
            _ => None,
        }
    }
}

/// Append-only zone enter/exit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneTransitionEvent {
    pub id: String,
    pub agent_id: String,
    pub zone_id: String,
    #[serde(rename = "type")]
    pub kind: TransitionKind,
    pub lat: f64,
    pub lng: f64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WARNING" => Some(Severity::Warning),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

pub const GEOFENCE_BREACH: &str = "GEOFENCE_BREACH";

/// Breach log entry consumed read-only by HR/ops views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRecord {
    pub id: String,
    pub agent_id: String,
    pub zone_id: String,
    pub kind: String,
    pub severity: Severity,
    pub distance_meters: f64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    OffSite,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::OffSite => "OFF_SITE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PRESENT" => Some(AttendanceStatus::Present),
            "OFF_SITE" => Some(AttendanceStatus::OffSite),
            _ => None,
        }
    }
}

/// One shift. Open while `check_out_at` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: String,
    pub agent_id: String,
    pub date: NaiveDate,
    pub check_in_at: DateTime<Utc>,
    pub check_out_at: Option<DateTime<Utc>>,
    pub status: AttendanceStatus,
    pub check_in_position: Coord,
    /// Distance from the zone center at clock-in; `None` for roaming agents.
    pub distance_meters: Option<f64>,
}

impl AttendanceSession {
    pub fn is_open(&self) -> bool {
        self.check_out_at.is_none()
    }
}

/// Generate a time-ordered record id.
pub fn new_record_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
