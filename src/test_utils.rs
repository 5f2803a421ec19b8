//! Fixtures shared by unit and integration tests.

use crate::config::AppConfig;
use crate::engine::Services;
use crate::gate::Reading;
use crate::geo;
use crate::persistence::Persistence;
use crate::types::Coord;
use chrono::{DateTime, Utc};

/// Accra, Ghana. Centre of the fixture zone.
pub const ACCRA: Coord = Coord {
    lat: 5.6037,
    lng: -0.1870,
};

pub const TEST_ZONE_ID: &str = "zone-accra";
pub const TEST_ZONE_RADIUS_METERS: f64 = 100.0;

/// Services over an in-memory store with default configuration.
/// Must run inside a tokio runtime.
pub fn test_services() -> Services {
    let persistence = Persistence::in_memory().expect("open in-memory database");
    Services::start(persistence, &AppConfig::default())
}

/// Provision the Accra zone (idempotent) and an agent assigned to it.
pub fn seed_agent(persistence: &Persistence, agent_id: &str, bypass_geofence: bool) {
    persistence
        .upsert_zone(
            TEST_ZONE_ID,
            Some("Accra Central"),
            ACCRA,
            Some(TEST_ZONE_RADIUS_METERS),
        )
        .expect("seed zone");
    persistence
        .upsert_agent(agent_id, Some(TEST_ZONE_ID), bypass_geofence)
        .expect("seed agent");
}

/// A reading `meters_north` of the zone centre.
pub fn pulse_at(meters_north: f64, accuracy_meters: Option<f64>, at: DateTime<Utc>) -> Reading {
    let position = geo::offset_north(ACCRA, meters_north);
    Reading::new(position.lat, position.lng, accuracy_meters, at).expect("valid fixture reading")
}
