//! Pulse ingestion: the hot path that turns a GPS reading into zone state.
//!
//! Per pulse: one context-cache lookup, one agent read and at most one
//! durable write (agent row + optional transition, in one transaction).
//! Breach logging is handed to the compliance worker and never awaited.

use crate::anomaly::{AnomalyDetector, Fix, RiskInputs};
use crate::attendance::AttendanceGate;
use crate::cache::AgentContextCache;
use crate::compliance::{BreachCandidate, BreachDispatch, ComplianceLogger, CompliancePolicy};
use crate::config::AppConfig;
use crate::error::{FieldError, FieldResult};
use crate::gate::{AccuracyGate, Reading, ReadingTrust};
use crate::geo;
use crate::persistence::{AgentUpdate, Persistence};
use crate::types::{new_record_id, Severity, TransitionKind, ZoneTransitionEvent};
use crate::zone_state::{self, AgentLocks, Step, ZoneState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of ingesting one pulse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PulseOutcome {
    /// Best-known state after this pulse (the last confirmed state when the
    /// reading was stale or position-only).
    pub inside_zone: bool,
    /// False until a state-changing reading has been seen.
    pub state_known: bool,
    pub distance_meters: Option<f64>,
    pub boundary_meters: Option<f64>,
    pub trust: ReadingTrust,
    /// Whether the reading was written (false for stale or unknown agents).
    pub accepted: bool,
    pub roaming: bool,
    pub transition: Option<TransitionKind>,
    pub teleport_suspected: bool,
    /// Severity of a breach record queued by this pulse.
    pub breach: Option<Severity>,
}

/// Verdict for a transactional action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionScreen {
    pub rapid_fire: bool,
    pub risk_score: u8,
    pub previous_action_at: Option<DateTime<Utc>>,
}

pub struct FieldEngine {
    persistence: Persistence,
    cache: AgentContextCache,
    locks: AgentLocks,
    gate: AccuracyGate,
    detector: AnomalyDetector,
    compliance: ComplianceLogger,
    safety_buffer_meters: f64,
    max_clock_skew: chrono::Duration,
}

impl FieldEngine {
    pub fn new(
        persistence: Persistence,
        cache: AgentContextCache,
        locks: AgentLocks,
        compliance: ComplianceLogger,
        config: &AppConfig,
    ) -> Self {
        Self {
            persistence,
            cache,
            locks,
            gate: AccuracyGate::new(config.geofence.accuracy_threshold_meters),
            detector: AnomalyDetector::new(&config.anomaly),
            compliance,
            safety_buffer_meters: config.geofence.safety_buffer_meters,
            max_clock_skew: config.geofence.max_clock_skew(),
        }
    }

    pub fn cache(&self) -> &AgentContextCache {
        &self.cache
    }

    pub fn compliance(&self) -> &ComplianceLogger {
        &self.compliance
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub async fn ingest_pulse(&self, agent_id: &str, reading: Reading) -> FieldResult<PulseOutcome> {
        self.check_clock(&reading, Utc::now())?;

        let Some(context) = self.cache.get(agent_id).await? else {
            debug!("Pulse for unknown agent {}; treating as roaming", agent_id);
            return Ok(PulseOutcome::roaming(ReadingTrust::Unverified, false));
        };

        let trust = self.gate.accept(&reading);
        let geometry = match &context.zone {
            Some(zone) => {
                let distance = geo::distance_meters(reading.position, zone.center)?;
                Some((zone, distance, zone.radius_meters + self.safety_buffer_meters))
            }
            None => None,
        };

        let _guard = self.locks.acquire(agent_id).await;

        let Some(agent) = self.persistence.get_agent(agent_id)? else {
            debug!("Agent {} disappeared from storage; treating as roaming", agent_id);
            return Ok(PulseOutcome::roaming(trust, false));
        };
        let stored = ZoneState::from_stored(agent.inside_zone);

        let stale_outcome = |trust| PulseOutcome {
            inside_zone: if geometry.is_some() {
                stored.as_stored().unwrap_or(false)
            } else {
                true
            },
            state_known: stored != ZoneState::Unknown,
            distance_meters: geometry.map(|(_, d, _)| d),
            boundary_meters: geometry.map(|(_, _, b)| b),
            trust,
            accepted: false,
            roaming: geometry.is_none(),
            transition: None,
            teleport_suspected: false,
            breach: None,
        };

        if let Some(last_seen) = agent.last_seen_at {
            if reading.recorded_at < last_seen {
                debug!(
                    "{}",
                    FieldError::StaleReading {
                        agent_id: agent_id.to_string()
                    }
                );
                return Ok(stale_outcome(trust));
            }
        }

        // Only state-eligible readings are compared, and only against the
        // last state-eligible fix.
        let teleport_suspected = match agent.last_fix {
            _ if !trust.may_change_state() => false,
            // Redelivery of the last fix.
            Some((position, at)) if position == reading.position && at == reading.recorded_at => {
                false
            }
            Some((position, at)) => self.detector.is_teleporting(
                Fix::new(position, at),
                Fix::new(reading.position, reading.recorded_at),
            ),
            None => false,
        };
        if teleport_suspected {
            warn!(
                "Implausible movement for agent {}: {:?} -> ({}, {})",
                agent_id,
                agent.last_fix.map(|(position, _)| position),
                reading.position.lat,
                reading.position.lng
            );
        }

        let position_only = AgentUpdate {
            agent_id: agent_id.to_string(),
            position: reading.position,
            seen_at: reading.recorded_at,
            record_fix: trust.may_change_state(),
            inside_zone: None,
            state_changed_at: None,
        };

        let Some((zone, distance, boundary)) = geometry else {
            let accepted = self.persistence.apply_agent_update(&position_only, None)?;
            let mut outcome = PulseOutcome::roaming(trust, accepted);
            outcome.teleport_suspected = teleport_suspected;
            return Ok(outcome);
        };

        if !trust.may_change_state() {
            debug!(
                "Position-only reading for agent {} (accuracy {:?} m)",
                agent_id, reading.accuracy_meters
            );
            if !self.persistence.apply_agent_update(&position_only, None)? {
                return Ok(stale_outcome(trust));
            }
            let mut outcome = stale_outcome(trust);
            outcome.accepted = true;
            outcome.teleport_suspected = teleport_suspected;
            return Ok(outcome);
        }

        let now_inside = context.bypass_geofence || distance <= boundary;
        let step = zone_state::step(stored, now_inside);
        let new_state = step.new_state(stored);

        let event = step.transition().map(|kind| ZoneTransitionEvent {
            id: new_record_id(),
            agent_id: agent_id.to_string(),
            zone_id: zone.id.clone(),
            kind,
            lat: reading.position.lat,
            lng: reading.position.lng,
            occurred_at: reading.recorded_at,
        });
        let changed = step != Step::Unchanged;
        let update = AgentUpdate {
            inside_zone: if changed { new_state.as_stored() } else { None },
            state_changed_at: if changed { Some(reading.recorded_at) } else { None },
            ..position_only
        };

        if !self.persistence.apply_agent_update(&update, event.as_ref())? {
            debug!("Lost update race for agent {}; reading discarded", agent_id);
            return Ok(stale_outcome(trust));
        }

        match step {
            Step::Flip(kind) => info!(
                "Agent {} {} zone {} ({:.0} m, boundary {:.0} m)",
                agent_id,
                kind.as_str(),
                zone.id,
                distance,
                boundary
            ),
            Step::Initialize(inside) => debug!(
                "Agent {} initial zone state: inside={}",
                agent_id, inside
            ),
            Step::Unchanged => {}
        }

        let outside_since = if changed {
            Some(reading.recorded_at)
        } else {
            agent.state_changed_at
        };
        let dispatch = self.compliance.record_breach_if_needed(&BreachCandidate {
            agent_id,
            zone,
            distance_meters: distance,
            trust,
            bypass_geofence: context.bypass_geofence,
            fresh_exit: step == Step::Flip(TransitionKind::Exit),
            outside: new_state == ZoneState::Outside,
            outside_since,
            observed_at: reading.recorded_at,
            teleport_suspected,
        });

        Ok(PulseOutcome {
            inside_zone: new_state == ZoneState::Inside,
            state_known: true,
            distance_meters: Some(distance),
            boundary_meters: Some(boundary),
            trust,
            accepted: true,
            roaming: false,
            transition: step.transition(),
            teleport_suspected,
            breach: match dispatch {
                BreachDispatch::Queued(severity) => Some(severity),
                _ => None,
            },
        })
    }

    /// Reject readings stamped further ahead of `now` than the allowed skew.
    /// One far-future timestamp would otherwise make every later pulse stale.
    fn check_clock(&self, reading: &Reading, now: DateTime<Utc>) -> FieldResult<()> {
        let limit = now.checked_add_signed(self.max_clock_skew).unwrap_or(now);
        if reading.recorded_at > limit {
            return Err(FieldError::InvalidReading(format!(
                "recorded_at {} is more than {} s ahead of server time",
                reading.recorded_at.to_rfc3339(),
                self.max_clock_skew.num_seconds()
            )));
        }
        Ok(())
    }

    /// Plausibility screen for a transactional action (e.g. a sale).
    /// Stamps the action time as a side effect.
    pub async fn screen_transaction(
        &self,
        agent_id: &str,
        amount: f64,
        average_amount: Option<f64>,
        at: DateTime<Utc>,
    ) -> FieldResult<TransactionScreen> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(FieldError::InvalidReading(format!(
                "amount must be a non-negative number, got {}",
                amount
            )));
        }
        if let Some(average) = average_amount {
            if !average.is_finite() || average < 0.0 {
                return Err(FieldError::InvalidReading(format!(
                    "average_amount must be a non-negative number, got {}",
                    average
                )));
            }
        }

        let context = self
            .cache
            .get(agent_id)
            .await?
            .ok_or_else(|| FieldError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;

        let _guard = self.locks.acquire(agent_id).await;
        let agent = self
            .persistence
            .get_agent(agent_id)?
            .ok_or_else(|| FieldError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;

        let previous = self.persistence.record_transaction_action(agent_id, at)?;
        let rapid_fire = self.detector.is_rapid_fire(previous, at);
        if rapid_fire {
            warn!("Rapid-fire transactional action from agent {}", agent_id);
        }

        let distance = match (&context.zone, agent.last_position) {
            (Some(zone), Some(position)) if !context.bypass_geofence => {
                Some(geo::distance_meters(position, zone.center)?)
            }
            _ => None,
        };
        let risk_score = self.detector.risk_score(RiskInputs {
            amount,
            average_amount,
            distance_from_zone_meters: distance,
        });

        Ok(TransactionScreen {
            rapid_fire,
            risk_score,
            previous_action_at: previous,
        })
    }
}

impl PulseOutcome {
    fn roaming(trust: ReadingTrust, accepted: bool) -> Self {
        Self {
            inside_zone: true,
            state_known: false,
            distance_meters: None,
            boundary_meters: None,
            trust,
            accepted,
            roaming: true,
            transition: None,
            teleport_suspected: false,
            breach: None,
        }
    }
}

/// The engine's long-lived components wired together.
pub struct Services {
    pub persistence: Persistence,
    pub engine: Arc<FieldEngine>,
    pub attendance: Arc<AttendanceGate>,
    pub compliance_worker: JoinHandle<()>,
    /// Periodic eviction of expired cache entries and idle agent locks.
    pub maintenance: JoinHandle<()>,
}

impl Services {
    /// Must be called from within a tokio runtime (spawns the compliance
    /// worker and the maintenance task).
    pub fn start(persistence: Persistence, config: &AppConfig) -> Self {
        let persistence = persistence.with_default_radius(config.geofence.default_radius_meters);
        let cache = AgentContextCache::new(Arc::new(persistence.clone()), config.cache.ttl());
        let locks = AgentLocks::new();
        let (compliance, compliance_worker) = ComplianceLogger::spawn(
            persistence.clone(),
            CompliancePolicy::from_config(&config.geofence, &config.compliance),
            config.compliance.queue_capacity,
        );

        let engine = Arc::new(FieldEngine::new(
            persistence.clone(),
            cache.clone(),
            locks.clone(),
            compliance,
            config,
        ));
        let maintenance = spawn_maintenance(cache.clone(), locks.clone());
        let attendance = Arc::new(AttendanceGate::new(persistence.clone(), cache, locks));

        Self {
            persistence,
            engine,
            attendance,
            compliance_worker,
            maintenance,
        }
    }
}

/// Sweep the context cache and per-agent locks once per cache TTL.
fn spawn_maintenance(cache: AgentContextCache, locks: AgentLocks) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cache.ttl());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let expired = cache.purge_expired().await;
            let idle = locks.prune_idle();
            if expired > 0 || idle > 0 {
                debug!(
                    "Evicted {} expired context entries and {} idle agent locks",
                    expired, idle
                );
            }
        }
    })
}
