use crate::core::strategy::{DecisionContext, OvertakeIntent, PitIntent, Policy, StrategyDecision};
use crate::core::track::Track;
use crate::core::vehicle::Vehicle;
use crate::core::weather::WeatherKind;
use serde::Serialize;
use std::collections::VecDeque;

/// Number of decisions kept in the history of an agent.
pub const MAX_HISTORY: usize = 100;

/// ConsultThrottle limits how often an expensive policy is consulted. Between consultations the
/// last decision is reused, unless one of the triggers fires.
/// * `interval` - (s) Maximum race time between two consultations
/// * `low_energy` - Energy level below which a consultation is forced once
/// * `hysteresis` - Band around `low_energy` that has to be crossed to (re)arm the trigger
/// * `overtake_proximity` - (m) A vehicle ahead coming within this gap forces a consultation
/// * `pit_wear`, `pit_energy` - Pit thresholds, crossing one forces a consultation once
#[derive(Debug, Clone, PartialEq)]
pub struct ConsultThrottle {
    pub interval: f64,
    pub low_energy: f64,
    pub hysteresis: f64,
    pub overtake_proximity: f64,
    pub pit_wear: f64,
    pub pit_energy: f64,
    last: Option<ConsultMark>,
}

#[derive(Debug, Clone, PartialEq)]
struct ConsultMark {
    elapsed: f64,
    weather: WeatherKind,
    low_energy_latched: bool,
    opportunity: bool,
    worn: bool,
    depleted: bool,
}

impl ConsultThrottle {
    pub fn new(interval: f64) -> ConsultThrottle {
        ConsultThrottle {
            interval: interval.max(0.0),
            low_energy: 0.2,
            hysteresis: 0.05,
            overtake_proximity: 15.0,
            pit_wear: 0.85,
            pit_energy: 0.15,
            last: None,
        }
    }

    fn has_opportunity(&self, ctx: &DecisionContext) -> bool {
        ctx.surroundings
            .ahead
            .first()
            .map_or(false, |ahead| ahead.distance <= self.overtake_proximity)
    }

    /// should_consult returns true if the policy has to be asked for a new decision.
    pub fn should_consult(&self, ctx: &DecisionContext) -> bool {
        let last = match &self.last {
            Some(last) => last,
            None => return true,
        };
        let energy = ctx.vehicle.energy_level();

        ctx.progress.elapsed - last.elapsed >= self.interval
            || ctx.weather.kind != last.weather
            || (!last.low_energy_latched && energy < self.low_energy - self.hysteresis)
            || (self.has_opportunity(ctx) && !last.opportunity)
            || (!last.worn && ctx.vehicle.tire_wear() > self.pit_wear)
            || (!last.depleted && energy < self.pit_energy)
    }

    /// record stores the state at the time of a consultation.
    pub fn record(&mut self, ctx: &DecisionContext) {
        let energy = ctx.vehicle.energy_level();
        let was_latched = self.last.as_ref().map_or(false, |l| l.low_energy_latched);

        let low_energy_latched = if was_latched {
            energy <= self.low_energy + self.hysteresis
        } else {
            energy < self.low_energy - self.hysteresis
        };

        self.last = Some(ConsultMark {
            elapsed: ctx.progress.elapsed,
            weather: ctx.weather.kind,
            low_energy_latched,
            opportunity: self.has_opportunity(ctx),
            worn: ctx.vehicle.tire_wear() > self.pit_wear,
            depleted: energy < self.pit_energy,
        });
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Summary of the decisions an agent took.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentMetrics {
    pub vehicle_id: u32,
    pub policy: &'static str,
    pub total_decisions: usize,
    pub mean_risk_level: f64,
    pub overtake_attempts: usize,
    pub pit_decisions: usize,
    pub boost_activations: usize,
    pub policy_failures: u64,
}

/// An agent couples a vehicle with the policy that drives it.
#[derive(Debug)]
pub struct Agent {
    pub vehicle: Vehicle,
    policy: Policy,
    active: bool,
    history: VecDeque<StrategyDecision>,
    throttle: Option<ConsultThrottle>,
    cached: Option<StrategyDecision>,
    policy_failures: u64,
}

impl Agent {
    pub fn new(vehicle: Vehicle, policy: Policy) -> Agent {
        Agent {
            vehicle,
            policy,
            active: true,
            history: VecDeque::with_capacity(MAX_HISTORY),
            throttle: None,
            cached: None,
            policy_failures: 0,
        }
    }

    pub fn with_consult_throttle(mut self, throttle: ConsultThrottle) -> Agent {
        self.throttle = Some(throttle);
        self
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn history(&self) -> &VecDeque<StrategyDecision> {
        &self.history
    }

    pub fn last_decision(&self) -> Option<&StrategyDecision> {
        self.history.back()
    }

    /// decide returns the decision for the current step. An inactive agent returns the safe
    /// default. A throttled agent reuses its last decision until a consultation is due. Policy
    /// failures are logged and replaced by the safe default. Only fresh decisions are appended to
    /// the history.
    pub fn decide(&mut self, ctx: &DecisionContext) -> StrategyDecision {
        if !self.active {
            return StrategyDecision::safe_default();
        }

        if let (Some(throttle), Some(cached)) = (&self.throttle, &self.cached) {
            if !throttle.should_consult(ctx) {
                return cached.clone();
            }
        }

        let decision = match self.policy.decide(ctx) {
            Ok(decision) => decision.sanitized(),
            Err(e) => {
                self.policy_failures += 1;
                log::warn!("vehicle {}: {} policy failed: {}", self.vehicle.id, self.policy.name(), e);
                return StrategyDecision::safe_default();
            }
        };

        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(decision.clone());

        if let Some(throttle) = self.throttle.as_mut() {
            throttle.record(ctx);
            self.cached = Some(decision.clone());
        }

        decision
    }

    /// reset clears the history and the cached decision, reactivates the agent and resets the race
    /// state of its vehicle.
    pub fn reset(&mut self, track: &Track, start_offset: f64) {
        self.history.clear();
        self.cached = None;
        self.active = true;
        self.policy_failures = 0;
        if let Some(throttle) = self.throttle.as_mut() {
            throttle.reset();
        }
        self.vehicle.reset_race_state(track, start_offset);
    }

    /// metrics computes the decision statistics from the history.
    pub fn metrics(&self) -> AgentMetrics {
        let total_decisions = self.history.len();
        let mean_risk_level = if total_decisions > 0 {
            self.history.iter().map(|d| d.risk_level).sum::<f64>() / total_decisions as f64
        } else {
            0.0
        };

        AgentMetrics {
            vehicle_id: self.vehicle.id,
            policy: self.policy.name(),
            total_decisions,
            mean_risk_level,
            overtake_attempts: self
                .history
                .iter()
                .filter(|d| d.overtaking == OvertakeIntent::Attempt)
                .count(),
            pit_decisions: self
                .history
                .iter()
                .filter(|d| d.pit_stop != PitIntent::None)
                .count(),
            boost_activations: self.history.iter().filter(|d| d.boost).count(),
            policy_failures: self.policy_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strategy::heuristic::tests::context;
    use crate::core::strategy::heuristic::HeuristicPolicy;
    use crate::core::strategy::remote::{ChannelProvider, RemotePolicy};
    use crate::core::strategy::{SurroundingVehicle, SAFE_RISK_LEVEL};
    use crate::core::vehicle::tests::vehicle_pars;
    use crate::core::weather::Weather;
    use approx::assert_relative_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn heuristic_agent() -> Agent {
        Agent::new(
            Vehicle::new(&vehicle_pars(1)),
            Policy::Heuristic(HeuristicPolicy::default()),
        )
    }

    #[test]
    fn inactive_agent_returns_the_safe_default() {
        let mut agent = heuristic_agent();
        agent.set_active(false);

        let ctx = context(agent.vehicle.clone());
        assert_eq!(agent.decide(&ctx), StrategyDecision::safe_default());
        assert!(agent.history().is_empty());
    }

    #[test]
    fn history_is_capped() {
        let mut agent = heuristic_agent();
        let ctx = context(agent.vehicle.clone());

        for _ in 0..150 {
            agent.decide(&ctx);
        }
        assert_eq!(agent.history().len(), MAX_HISTORY);
        let metrics = agent.metrics();
        assert_eq!(metrics.total_decisions, MAX_HISTORY);
        assert_relative_eq!(metrics.mean_risk_level, 0.5);
        assert_eq!(metrics.overtake_attempts, 0);
        assert_eq!(metrics.pit_decisions, 0);
        assert_eq!(metrics.boost_activations, 0);
    }

    #[test]
    fn failing_policy_yields_the_safe_default() {
        let mut pars = vehicle_pars(1);
        pars.max_speed = 0.0;
        let mut agent = Agent::new(
            Vehicle::new(&pars),
            Policy::Heuristic(HeuristicPolicy::default()),
        );

        let ctx = context(agent.vehicle.clone());
        assert_eq!(agent.decide(&ctx), StrategyDecision::safe_default());
        assert_eq!(agent.metrics().policy_failures, 1);
    }

    #[test]
    fn out_of_range_remote_answers_are_clamped() {
        let provider = ChannelProvider::spawn("reckless", |_| {
            Ok(json!({"throttle": 7, "braking": -2.5, "steering": -3, "riskLevel": "x"}))
        })
        .unwrap();
        let policy = Policy::Remote(RemotePolicy::new(
            Arc::new(provider),
            Duration::from_millis(500),
        ));
        let mut agent = Agent::new(Vehicle::new(&vehicle_pars(1)), policy);

        let ctx = context(agent.vehicle.clone());
        let decision = agent.decide(&ctx);

        assert!(decision.is_valid());
        assert_relative_eq!(decision.throttle, 1.0);
        assert_relative_eq!(decision.braking, 0.0);
        assert_relative_eq!(decision.steering, -1.0);
        assert_relative_eq!(decision.risk_level, SAFE_RISK_LEVEL);
        assert_eq!(agent.last_decision(), Some(&decision));
    }

    #[test]
    fn throttled_agent_reuses_its_decision_until_a_trigger_fires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let provider = ChannelProvider::spawn("counting", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"throttle": 0.8}))
        })
        .unwrap();
        let policy = Policy::Remote(RemotePolicy::new(
            Arc::new(provider),
            Duration::from_millis(500),
        ));
        let mut agent =
            Agent::new(Vehicle::new(&vehicle_pars(1)), policy).with_consult_throttle(ConsultThrottle::new(2.0));

        let mut ctx = context(agent.vehicle.clone());
        agent.decide(&ctx);
        ctx.progress.elapsed = 1.0;
        let cached = agent.decide(&ctx);
        assert_relative_eq!(cached.throttle, 0.8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent.history().len(), 1);

        // weather change
        ctx.weather = Weather {
            kind: WeatherKind::Fog,
            intensity: 0.5,
            ..Weather::default()
        };
        agent.decide(&ctx);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // overtaking opportunity
        ctx.surroundings.ahead.push(SurroundingVehicle {
            id: 2,
            speed: 150.0,
            distance: 15.0,
        });
        agent.decide(&ctx);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // interval elapsed
        ctx.progress.elapsed = 3.5;
        agent.decide(&ctx);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // nothing changed
        ctx.progress.elapsed = 4.0;
        agent.decide(&ctx);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn low_energy_triggers_once_per_crossing() {
        let mut throttle = ConsultThrottle::new(100.0);
        let mut ctx = context(Vehicle::new(&vehicle_pars(1)));

        throttle.record(&ctx);
        ctx.vehicle.energy.level = 0.17;
        assert!(!throttle.should_consult(&ctx));

        ctx.vehicle.energy.level = 0.14;
        assert!(throttle.should_consult(&ctx));
        throttle.record(&ctx);

        ctx.vehicle.energy.level = 0.10;
        assert!(!throttle.should_consult(&ctx));
    }

    #[test]
    fn reset_reactivates_and_clears() {
        let mut agent = heuristic_agent();
        let track = Track::new(&crate::core::track::tests::track_pars(vec![
            crate::core::track::tests::segment_pars(0, crate::core::track::SegmentKind::Straight, 500.0),
        ]));
        let ctx = context(agent.vehicle.clone());
        agent.decide(&ctx);
        agent.set_active(false);
        agent.vehicle.speed = 120.0;

        agent.reset(&track, 0.0);

        assert!(agent.is_active());
        assert!(agent.history().is_empty());
        assert_eq!(agent.vehicle.speed, 0.0);
    }
}
