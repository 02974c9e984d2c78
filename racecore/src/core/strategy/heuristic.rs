use crate::core::strategy::common::{
    assess_overtake, energy_mode, optimal_speed, risk_tolerance, should_pit, steering_target,
};
use crate::core::strategy::{DecisionContext, EnergyMode, PolicyError, StrategyDecision};
use crate::core::track::SegmentKind;

/// (m) Gap window to the vehicle ahead in which boost is used on straights
const BOOST_MIN_GAP: f64 = 5.0;
const BOOST_MAX_GAP: f64 = 50.0;
const BOOST_MIN_RISK: f64 = 0.5;

/// Deterministic local policy: drives towards the optimal segment speed and derives the strategic
/// intents from the shared building blocks.
/// * `response_gain` - (1/(km/h)) Pedal input per km/h of speed error
/// * `base_throttle` - Throttle applied at zero speed error
#[derive(Debug, Clone)]
pub struct HeuristicPolicy {
    pub response_gain: f64,
    pub base_throttle: f64,
}

impl Default for HeuristicPolicy {
    fn default() -> Self {
        HeuristicPolicy {
            response_gain: 0.02,
            base_throttle: 0.2,
        }
    }
}

impl HeuristicPolicy {
    pub fn decide(&self, ctx: &DecisionContext) -> Result<StrategyDecision, PolicyError> {
        let vehicle = &ctx.vehicle;

        if !(vehicle.max_speed > 0.0) {
            return Err(PolicyError::InvalidContext(format!(
                "vehicle {} has no positive top speed",
                vehicle.id
            )));
        }
        if !vehicle.speed.is_finite() || !ctx.segment.length.is_finite() {
            return Err(PolicyError::InvalidContext(format!(
                "non-finite state for vehicle {}",
                vehicle.id
            )));
        }

        let risk = risk_tolerance(vehicle, &ctx.weather);
        let mode = energy_mode(vehicle, &ctx.progress, &ctx.weather, ctx.lap_length);

        let mut target = optimal_speed(vehicle, &ctx.segment, &ctx.weather);
        for hazard in ctx.hazards.iter() {
            target *= 1.0 - 0.5 * hazard.severity.clamp(0.0, 1.0);
        }

        let error = target - vehicle.speed;
        let (mut throttle, braking) = if error >= 0.0 {
            ((self.base_throttle + self.response_gain * error).min(1.0), 0.0)
        } else {
            (0.0, (-self.response_gain * error).min(1.0))
        };

        throttle = match mode {
            EnergyMode::Conservative => 0.85 * throttle,
            EnergyMode::Aggressive => (1.1 * throttle).min(1.0),
            EnergyMode::Balanced => throttle,
        };

        let boost = ctx.segment.kind == SegmentKind::Straight
            && risk > BOOST_MIN_RISK
            && ctx
                .surroundings
                .ahead
                .first()
                .map_or(false, |a| a.distance >= BOOST_MIN_GAP && a.distance <= BOOST_MAX_GAP);

        Ok(StrategyDecision {
            throttle,
            braking,
            steering: steering_target(vehicle, &ctx.segment, ctx.next_segment_heading),
            risk_level: risk,
            overtaking: assess_overtake(vehicle, &ctx.surroundings, &ctx.segment, risk),
            pit_stop: should_pit(vehicle, &ctx.progress),
            boost,
            energy_mode: mode,
        })
    }
}
