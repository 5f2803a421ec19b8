//! Error taxonomy for the field-presence engine.

/// All errors surfaced by the engine's components.
///
/// `StaleReading` is part of the taxonomy for completeness but the pulse path
/// never returns it to callers: stale pulses are discarded silently and logged
/// at debug level.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    /// Latitude/longitude was NaN or infinite.
    #[error("invalid coordinate: lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },

    /// A request payload failed validation before reaching geo math.
    #[error("invalid reading: {0}")]
    InvalidReading(String),

    /// The agent has no record in the engine's store.
    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    /// The agent references a zone the zone directory doesn't know.
    #[error("zone not found: {zone_id}")]
    ZoneNotFound { zone_id: String },

    /// An open attendance session already exists for the agent today.
    #[error("agent {agent_id} already has an open session for {date}")]
    DuplicateClockIn { agent_id: String, date: String },

    /// Clock-out was requested without an open session.
    #[error("agent {agent_id} has no open attendance session")]
    NoOpenSession { agent_id: String },

    /// The reading is older than the last accepted pulse.
    #[error("stale reading for agent {agent_id}")]
    StaleReading { agent_id: String },

    /// No current agent could be resolved from the request.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl FieldError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FieldError::InvalidCoordinate { .. } => "invalid_coordinate",
            FieldError::InvalidReading(_) => "invalid_reading",
            FieldError::AgentNotFound { .. } => "agent_not_found",
            FieldError::ZoneNotFound { .. } => "zone_not_found",
            FieldError::DuplicateClockIn { .. } => "duplicate_clock_in",
            FieldError::NoOpenSession { .. } => "no_open_session",
            FieldError::StaleReading { .. } => "stale_reading",
            FieldError::Unauthorized(_) => "unauthorized",
            FieldError::Storage(_) => "storage_error",
        }
    }
}

pub type FieldResult<T> = std::result::Result<T, FieldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = FieldError::DuplicateClockIn {
            agent_id: "a1".to_string(),
            date: "2024-05-01".to_string(),
        };
        assert_eq!(err.code(), "duplicate_clock_in");
        assert!(err.to_string().contains("2024-05-01"));

        let err = FieldError::from(anyhow::anyhow!("disk full"));
        assert_eq!(err.code(), "storage_error");
        assert_eq!(err.to_string(), "disk full");
    }
}
