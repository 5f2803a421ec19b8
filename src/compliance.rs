//! Breach logging off the pulse path.
//!
//! `record_breach_if_needed` decides synchronously and enqueues; a single
//! background worker performs the writes. Write failures are logged and
//! never reach the caller.

use crate::config::{ComplianceConfig, GeofenceConfig};
use crate::gate::ReadingTrust;
use crate::persistence::Persistence;
use crate::types::{new_record_id, ComplianceRecord, Severity, Zone, GEOFENCE_BREACH};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct CompliancePolicy {
    pub safety_buffer_meters: f64,
    pub escalation_margin_meters: f64,
    pub critical_margin_meters: f64,
    pub standing_breach_cooldown: Duration,
}

impl CompliancePolicy {
    pub fn from_config(geofence: &GeofenceConfig, compliance: &ComplianceConfig) -> Self {
        Self {
            safety_buffer_meters: geofence.safety_buffer_meters,
            escalation_margin_meters: compliance.escalation_margin_meters,
            critical_margin_meters: compliance.critical_margin_meters,
            standing_breach_cooldown: compliance.standing_breach_cooldown(),
        }
    }

    /// Radius plus the live-tracking safety buffer.
    pub fn boundary_meters(&self, zone: &Zone) -> f64 {
        zone.radius_meters + self.safety_buffer_meters
    }

    /// Whether a distance is materially outside the boundary.
    pub fn exceeds_escalation(&self, zone: &Zone, distance_meters: f64) -> bool {
        distance_meters > self.boundary_meters(zone) + self.escalation_margin_meters
    }

    /// Severity depends only on distance and the zone's boundary.
    pub fn classify(&self, zone: &Zone, distance_meters: f64) -> Severity {
        if distance_meters > self.boundary_meters(zone) + self.critical_margin_meters {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }
}

/// Everything the logger needs to decide about one pulse.
#[derive(Debug, Clone)]
pub struct BreachCandidate<'a> {
    pub agent_id: &'a str,
    pub zone: &'a Zone,
    pub distance_meters: f64,
    pub trust: ReadingTrust,
    pub bypass_geofence: bool,
    /// The state machine just produced an EXIT.
    pub fresh_exit: bool,
    /// Stored state after this pulse is "outside".
    pub outside: bool,
    /// When the agent's state last flipped/initialized.
    pub outside_since: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub teleport_suspected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachDispatch {
    NotWarranted,
    Queued(Severity),
    /// Warranted but the queue was full or closed.
    Dropped,
}

enum Command {
    Record(ComplianceRecord),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ComplianceLogger {
    tx: mpsc::Sender<Command>,
    policy: CompliancePolicy,
    /// Observation time of the last breach queued per agent.
    last_logged: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl ComplianceLogger {
    /// Start the background writer. The worker exits once every logger
    /// handle has been dropped and the queue is drained.
    pub fn spawn(
        persistence: Persistence,
        policy: CompliancePolicy,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(persistence, rx));
        let logger = Self {
            tx,
            policy,
            last_logged: Arc::new(Mutex::new(HashMap::new())),
        };
        (logger, handle)
    }

    pub fn policy(&self) -> &CompliancePolicy {
        &self.policy
    }

    /// Decide whether this pulse warrants a breach record and, if so,
    /// enqueue it without waiting.
    pub fn record_breach_if_needed(&self, candidate: &BreachCandidate<'_>) -> BreachDispatch {
        if candidate.bypass_geofence || !candidate.trust.may_log_breach() || !candidate.outside {
            return BreachDispatch::NotWarranted;
        }
        if !self
            .policy
            .exceeds_escalation(candidate.zone, candidate.distance_meters)
        {
            return BreachDispatch::NotWarranted;
        }

        let mut last_logged = match self.last_logged.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = last_logged.get(candidate.agent_id).copied();

        if !candidate.fresh_exit {
            let since = match (previous, candidate.outside_since) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            if let Some(since) = since {
                if candidate.observed_at - since < self.policy.standing_breach_cooldown {
                    return BreachDispatch::NotWarranted;
                }
            }
        }

        let severity = self.policy.classify(candidate.zone, candidate.distance_meters);
        let record = build_record(candidate, severity, &self.policy);

        last_logged.insert(candidate.agent_id.to_string(), candidate.observed_at);
        match self.tx.try_send(Command::Record(record)) {
            Ok(()) => {
                debug!(
                    "Queued {} breach for agent {} ({:.0} m)",
                    severity.as_str(),
                    candidate.agent_id,
                    candidate.distance_meters
                );
                BreachDispatch::Queued(severity)
            }
            Err(err) => {
                // Release the claim so the next pulse can try again.
                match previous {
                    Some(at) => last_logged.insert(candidate.agent_id.to_string(), at),
                    None => last_logged.remove(candidate.agent_id),
                };
                match err {
                    mpsc::error::TrySendError::Full(_) => warn!(
                        "Compliance queue full; dropping breach for agent {}",
                        candidate.agent_id
                    ),
                    mpsc::error::TrySendError::Closed(_) => error!(
                        "Compliance worker stopped; dropping breach for agent {}",
                        candidate.agent_id
                    ),
                }
                BreachDispatch::Dropped
            }
        }
    }

    /// Wait until every record queued before this call has been written
    /// (or has failed).
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| anyhow!("compliance worker is not running"))?;
        ack_rx
            .await
            .map_err(|_| anyhow!("compliance worker stopped before flushing"))
    }
}

fn build_record(
    candidate: &BreachCandidate<'_>,
    severity: Severity,
    policy: &CompliancePolicy,
) -> ComplianceRecord {
    let boundary = policy.boundary_meters(candidate.zone);
    let mut description = if candidate.fresh_exit {
        format!(
            "Left zone {}: {:.0} m from center, {:.0} m beyond the {:.0} m boundary",
            candidate.zone.id,
            candidate.distance_meters,
            candidate.distance_meters - boundary,
            boundary
        )
    } else {
        format!(
            "Still outside zone {}: {:.0} m from center, {:.0} m beyond the {:.0} m boundary",
            candidate.zone.id,
            candidate.distance_meters,
            candidate.distance_meters - boundary,
            boundary
        )
    };
    if candidate.teleport_suspected {
        description.push_str("; implausible movement since previous fix");
    }

    ComplianceRecord {
        id: new_record_id(),
        agent_id: candidate.agent_id.to_string(),
        zone_id: candidate.zone.id.clone(),
        kind: GEOFENCE_BREACH.to_string(),
        severity,
        distance_meters: candidate.distance_meters,
        description,
        created_at: Utc::now(),
    }
}

async fn run_worker(persistence: Persistence, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => match persistence.insert_compliance_record(&record) {
                Ok(()) => info!(
                    "Logged {} breach for agent {} ({:.0} m)",
                    record.severity.as_str(),
                    record.agent_id,
                    record.distance_meters
                ),
                Err(e) => error!(
                    "Failed to write compliance record for agent {}: {:#}",
                    record.agent_id, e
                ),
            },
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Compliance worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Coord;

    fn zone() -> Zone {
        Zone {
            id: "z1".to_string(),
            name: None,
            center: Coord::new(5.6037, -0.1870),
            radius_meters: 200.0,
        }
    }

    fn policy() -> CompliancePolicy {
        CompliancePolicy::from_config(&GeofenceConfig::default(), &ComplianceConfig::default())
    }

    fn candidate<'a>(zone: &'a Zone, distance: f64, at: DateTime<Utc>) -> BreachCandidate<'a> {
        BreachCandidate {
            agent_id: "a1",
            zone,
            distance_meters: distance,
            trust: ReadingTrust::FullyTrusted,
            bypass_geofence: false,
            fresh_exit: true,
            outside: true,
            outside_since: Some(at),
            observed_at: at,
            teleport_suspected: false,
        }
    }

    #[test]
    fn test_severity_is_a_function_of_distance() {
        let p = policy();
        let z = zone();
        assert_eq!(p.boundary_meters(&z), 230.0);
        assert_eq!(p.classify(&z, 400.0), Severity::Warning);
        assert_eq!(p.classify(&z, 730.0), Severity::Warning);
        assert_eq!(p.classify(&z, 731.0), Severity::Critical);
        assert!(!p.exceeds_escalation(&z, 330.0));
        assert!(p.exceeds_escalation(&z, 331.0));
    }

    #[tokio::test]
    async fn test_fresh_exit_is_logged_once() {
        let persistence = Persistence::in_memory().unwrap();
        let (logger, _worker) = ComplianceLogger::spawn(persistence.clone(), policy(), 16);
        let z = zone();
        let now = Utc::now();

        assert_eq!(
            logger.record_breach_if_needed(&candidate(&z, 400.0, now)),
            BreachDispatch::Queued(Severity::Warning)
        );

        // Same pulse replayed: no longer a fresh exit, inside the cooldown.
        let mut replay = candidate(&z, 400.0, now);
        replay.fresh_exit = false;
        assert_eq!(logger.record_breach_if_needed(&replay), BreachDispatch::NotWarranted);

        logger.flush().await.unwrap();
        let records = persistence.list_compliance_records("a1", 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, GEOFENCE_BREACH);
        assert_eq!(records[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_standing_breach_respects_cooldown() {
        let persistence = Persistence::in_memory().unwrap();
        let (logger, _worker) = ComplianceLogger::spawn(persistence.clone(), policy(), 16);
        let z = zone();
        let exited_at = Utc::now();

        let mut standing = candidate(&z, 900.0, exited_at + Duration::minutes(5));
        standing.fresh_exit = false;
        standing.outside_since = Some(exited_at);
        assert_eq!(logger.record_breach_if_needed(&standing), BreachDispatch::NotWarranted);

        standing.observed_at = exited_at + Duration::minutes(16);
        assert_eq!(
            logger.record_breach_if_needed(&standing),
            BreachDispatch::Queued(Severity::Critical)
        );

        standing.observed_at = exited_at + Duration::minutes(20);
        assert_eq!(logger.record_breach_if_needed(&standing), BreachDispatch::NotWarranted);

        standing.observed_at = exited_at + Duration::minutes(32);
        assert_eq!(
            logger.record_breach_if_needed(&standing),
            BreachDispatch::Queued(Severity::Critical)
        );

        logger.flush().await.unwrap();
        assert_eq!(persistence.list_compliance_records("a1", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_gating_conditions() {
        let persistence = Persistence::in_memory().unwrap();
        let (logger, _worker) = ComplianceLogger::spawn(persistence.clone(), policy(), 16);
        let z = zone();
        let now = Utc::now();

        let mut c = candidate(&z, 5_000.0, now);
        c.bypass_geofence = true;
        assert_eq!(logger.record_breach_if_needed(&c), BreachDispatch::NotWarranted);

        let mut c = candidate(&z, 5_000.0, now);
        c.trust = ReadingTrust::Unverified;
        assert_eq!(logger.record_breach_if_needed(&c), BreachDispatch::NotWarranted);

        let mut c = candidate(&z, 5_000.0, now);
        c.trust = ReadingTrust::PositionOnly;
        assert_eq!(logger.record_breach_if_needed(&c), BreachDispatch::NotWarranted);

        // Outside the buffer but not by the escalation margin.
        let c = candidate(&z, 300.0, now);
        assert_eq!(logger.record_breach_if_needed(&c), BreachDispatch::NotWarranted);

        let mut c = candidate(&z, 5_000.0, now);
        c.outside = false;
        assert_eq!(logger.record_breach_if_needed(&c), BreachDispatch::NotWarranted);

        logger.flush().await.unwrap();
        assert!(persistence.list_compliance_records("a1", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teleport_annotates_without_changing_severity() {
        let persistence = Persistence::in_memory().unwrap();
        let (logger, _worker) = ComplianceLogger::spawn(persistence.clone(), policy(), 16);
        let z = zone();

        let mut c = candidate(&z, 400.0, Utc::now());
        c.teleport_suspected = true;
        assert_eq!(
            logger.record_breach_if_needed(&c),
            BreachDispatch::Queued(Severity::Warning)
        );

        logger.flush().await.unwrap();
        let records = persistence.list_compliance_records("a1", 10).unwrap();
        assert_eq!(records[0].severity, Severity::Warning);
        assert!(records[0].description.contains("implausible movement"));
    }

    #[tokio::test]
    async fn test_write_failure_is_isolated() {
        let persistence = Persistence::in_memory().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(run_worker(persistence.clone(), rx));
        let z = zone();
        let record = build_record(&candidate(&z, 400.0, Utc::now()), Severity::Warning, &policy());

        // Duplicate primary key: the second insert fails, the worker keeps going.
        tx.send(Command::Record(record.clone())).await.unwrap();
        tx.send(Command::Record(record)).await.unwrap();
        let next = build_record(&candidate(&z, 800.0, Utc::now()), Severity::Critical, &policy());
        tx.send(Command::Record(next)).await.unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(persistence.list_compliance_records("a1", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_releases_claim() {
        let (tx, _rx) = mpsc::channel(1);
        // Fill the only slot; nothing drains it.
        tx.try_send(Command::Flush(oneshot::channel().0)).ok();
        let logger = ComplianceLogger {
            tx,
            policy: policy(),
            last_logged: Arc::new(Mutex::new(HashMap::new())),
        };
        let z = zone();
        let now = Utc::now();

        assert_eq!(
            logger.record_breach_if_needed(&candidate(&z, 400.0, now)),
            BreachDispatch::Dropped
        );
        assert!(logger.last_logged.lock().unwrap().get("a1").is_none());
    }
}
