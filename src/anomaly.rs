//! Plausibility checks: teleportation, rapid-fire actions and a coarse risk score.
//!
//! Everything here is pure and allocation-free; callers decide what to do
//! with the verdicts.

use crate::config::AnomalyConfig;
use crate::geo;
use crate::types::Coord;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A position at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub position: Coord,
    pub at: DateTime<Utc>,
}

impl Fix {
    pub fn new(position: Coord, at: DateTime<Utc>) -> Self {
        Self { position, at }
    }
}

/// Implied speed between two fixes in km/h, or `None` when time didn't advance.
pub fn implied_speed_kmh(prev: Fix, curr: Fix) -> Option<f64> {
    let elapsed_ms = (curr.at - prev.at).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }
    let meters = geo::distance_meters(prev.position, curr.position).ok()?;
    let mps = meters / (elapsed_ms as f64 / 1000.0);
    Some(mps * 3.6)
}

/// Additive weights for [`AnomalyDetector::risk_score`].
#[derive(Debug, Clone, Copy)]
pub struct RiskWeights {
    pub amount_multiplier: f64,
    pub amount_weight: u32,
    pub drift_meters: f64,
    pub drift_weight: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RiskInputs {
    pub amount: f64,
    pub average_amount: Option<f64>,
    pub distance_from_zone_meters: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    teleport_speed_kmh: f64,
    rapid_fire_interval: Duration,
    weights: RiskWeights,
}

impl AnomalyDetector {
    pub fn new(config: &AnomalyConfig) -> Self {
        Self {
            teleport_speed_kmh: config.teleport_speed_kmh,
            rapid_fire_interval: Duration::from_millis(config.rapid_fire_interval_ms),
            weights: RiskWeights {
                amount_multiplier: config.amount_multiplier,
                amount_weight: config.amount_weight,
                drift_meters: config.drift_meters,
                drift_weight: config.drift_weight,
            },
        }
    }

    /// True when the implied speed exceeds the threshold, or when time
    /// didn't move forward between the fixes.
    pub fn is_teleporting(&self, prev: Fix, curr: Fix) -> bool {
        match implied_speed_kmh(prev, curr) {
            Some(speed) => speed > self.teleport_speed_kmh,
            None => true,
        }
    }

    /// True when `now` is less than the minimum interval after `last_action`.
    pub fn is_rapid_fire(&self, last_action: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_action else {
            return false;
        };
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < self.rapid_fire_interval,
            // Negative gap: clocks disagree, treat as too fast.
            Err(_) => true,
        }
    }

    /// Bounded 0..=100 heuristic score.
    pub fn risk_score(&self, inputs: RiskInputs) -> u8 {
        let w = &self.weights;
        let mut score: u32 = 0;

        if let Some(average) = inputs.average_amount {
            if average > 0.0 && inputs.amount > average * w.amount_multiplier {
                score += w.amount_weight;
            }
        }
        if let Some(distance) = inputs.distance_from_zone_meters {
            if distance > w.drift_meters {
                score += w.drift_weight;
            }
        }

        score.min(100) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(&AnomalyConfig::default())
    }

    #[test]
    fn test_fifty_km_in_one_second_is_teleporting() {
        let t0 = Utc::now();
        let origin = Coord::new(5.6037, -0.1870);
        let prev = Fix::new(origin, t0);
        let curr = Fix::new(
            geo::offset_north(origin, 50_000.0),
            t0 + ChronoDuration::seconds(1),
        );

        let speed = implied_speed_kmh(prev, curr).unwrap();
        assert!((speed - 180_000.0).abs() < 1.0, "got {speed}");
        assert!(detector().is_teleporting(prev, curr));
    }

    #[test]
    fn test_vehicle_speed_is_plausible() {
        let t0 = Utc::now();
        let origin = Coord::new(5.6037, -0.1870);
        // 2 km in 60 s = 120 km/h
        let prev = Fix::new(origin, t0);
        let curr = Fix::new(geo::offset_north(origin, 2_000.0), t0 + ChronoDuration::seconds(60));
        assert!(!detector().is_teleporting(prev, curr));
    }

    #[test]
    fn test_backwards_or_frozen_time_is_anomalous() {
        let t0 = Utc::now();
        let p = Coord::new(5.6037, -0.1870);
        assert!(detector().is_teleporting(Fix::new(p, t0), Fix::new(p, t0)));
        assert!(detector().is_teleporting(
            Fix::new(p, t0),
            Fix::new(p, t0 - ChronoDuration::seconds(1))
        ));
    }

    #[test]
    fn test_rapid_fire() {
        let d = detector();
        let t0 = Utc::now();
        assert!(!d.is_rapid_fire(None, t0));
        assert!(d.is_rapid_fire(Some(t0), t0 + ChronoDuration::milliseconds(1_500)));
        assert!(!d.is_rapid_fire(Some(t0), t0 + ChronoDuration::milliseconds(2_000)));
        assert!(d.is_rapid_fire(Some(t0), t0 - ChronoDuration::seconds(1)));
    }

    #[test]
    fn test_risk_score_weights_and_cap() {
        let d = detector();
        assert_eq!(d.risk_score(RiskInputs::default()), 0);
        assert_eq!(
            d.risk_score(RiskInputs {
                amount: 600.0,
                average_amount: Some(100.0),
                distance_from_zone_meters: Some(50.0),
            }),
            50
        );
        assert_eq!(
            d.risk_score(RiskInputs {
                amount: 100.0,
                average_amount: Some(100.0),
                distance_from_zone_meters: Some(250.0),
            }),
            30
        );
        assert_eq!(
            d.risk_score(RiskInputs {
                amount: 600.0,
                average_amount: Some(100.0),
                distance_from_zone_meters: Some(250.0),
            }),
            80
        );

        let heavy = AnomalyDetector::new(&AnomalyConfig {
            amount_weight: 80,
            drift_weight: 70,
            ..AnomalyConfig::default()
        });
        assert_eq!(
            heavy.risk_score(RiskInputs {
                amount: 600.0,
                average_amount: Some(100.0),
                distance_from_zone_meters: Some(250.0),
            }),
            100
        );
    }
}
