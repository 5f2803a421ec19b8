//! Accuracy gate: decides how much a GPS reading is allowed to influence
//! zone state and compliance side effects.

use crate::error::{FieldError, FieldResult};
use crate::types::Coord;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// A validated GPS reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub position: Coord,
    pub accuracy_meters: Option<f64>,
    /// Client timestamp, or server receive time when the client sent none.
    pub recorded_at: DateTime<Utc>,
}

impl Reading {
    /// Build a reading, rejecting malformed coordinates and accuracies.
    pub fn new(
        lat: f64,
        lng: f64,
        accuracy_meters: Option<f64>,
        recorded_at: DateTime<Utc>,
    ) -> FieldResult<Self> {
        let position = crate::geo::validate(Coord::new(lat, lng))?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(FieldError::InvalidCoordinate { lat, lng });
        }
        if let Some(accuracy) = accuracy_meters {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(FieldError::InvalidReading(format!(
                    "accuracy_meters must be a non-negative number, got {}",
                    accuracy
                )));
            }
        }
        Ok(Self {
            position,
            accuracy_meters,
            // Storage keeps millisecond precision.
            recorded_at: recorded_at.trunc_subsecs(3),
        })
    }
}

/// How far a reading is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingTrust {
    /// Accuracy reported and within threshold: may set and clear breaches.
    FullyTrusted,
    /// No accuracy metadata: may move zone state, never logs a breach.
    Unverified,
    /// Accuracy worse than threshold: updates position only.
    PositionOnly,
}

impl ReadingTrust {
    pub fn may_change_state(&self) -> bool {
        !matches!(self, ReadingTrust::PositionOnly)
    }

    pub fn may_log_breach(&self) -> bool {
        matches!(self, ReadingTrust::FullyTrusted)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccuracyGate {
    threshold_meters: f64,
}

impl AccuracyGate {
    pub fn new(threshold_meters: f64) -> Self {
        Self { threshold_meters }
    }

    pub fn accept(&self, reading: &Reading) -> ReadingTrust {
        match reading.accuracy_meters {
            None => ReadingTrust::Unverified,
            Some(accuracy) if accuracy <= self.threshold_meters => ReadingTrust::FullyTrusted,
            Some(_) => ReadingTrust::PositionOnly,
        }
    }
}
