//! Building blocks shared by the decision policies.

use crate::core::physics::{calc_traction, grip_limited_speed, target_speed};
use crate::core::strategy::{EnergyMode, OvertakeIntent, PitIntent, RaceProgress, Surroundings};
use crate::core::track::{SegmentKind, TrackSegment};
use crate::core::vehicle::Vehicle;
use crate::core::weather::{Weather, WeatherKind};
use helpers::general::clamp_unit;
use std::f64::consts::{FRAC_PI_2, PI};

/// Below this energy level the risk tolerance is reduced.
const LOW_ENERGY_RISK: f64 = 0.3;

const PIT_WEAR_IMMEDIATE: f64 = 0.85;
const PIT_ENERGY_IMMEDIATE: f64 = 0.15;
const PIT_WEAR_NEXT_LAP: f64 = 0.6;

/// (m) Gap window in which an overtake can be considered
const OVERTAKE_MIN_GAP: f64 = 2.0;
const OVERTAKE_MAX_GAP: f64 = 50.0;
/// (km/h) Speed advantage required for an overtake
const OVERTAKE_MIN_ADVANTAGE: f64 = 5.0;
/// (m) A car behind within this gap makes the vehicle defend
const DEFEND_GAP: f64 = 10.0;
const OVERTAKE_MIN_RISK: f64 = 0.6;

/// Throttle load assumed when projecting the energy need of a lap.
const PROJECTION_LOAD: f64 = 0.8;

/// risk_tolerance derives the accepted risk in [0.0, 1.0] from the aggression of the vehicle,
/// reduced by tire wear, low energy and adverse weather.
pub fn risk_tolerance(vehicle: &Vehicle, weather: &Weather) -> f64 {
    let mut risk = 0.5 + 0.8 * (vehicle.aggression - 0.5);

    risk -= 0.3 * vehicle.tire_wear();

    if vehicle.energy_level() < LOW_ENERGY_RISK {
        risk -= 0.2 * (LOW_ENERGY_RISK - vehicle.energy_level()) / LOW_ENERGY_RISK;
    }

    risk -= match weather.kind {
        WeatherKind::Rain => 0.25 * weather.intensity,
        WeatherKind::Wind | WeatherKind::Fog => 0.1 * weather.intensity,
        WeatherKind::Clear => 0.0,
    };

    clamp_unit(risk)
}

/// optimal_speed returns the speed (km/h) a policy should aim for on a segment, using the same
/// grip limits as the physics model. Wet conditions keep an additional margin.
pub fn optimal_speed(vehicle: &Vehicle, segment: &TrackSegment, weather: &Weather) -> f64 {
    let traction = calc_traction(vehicle, segment, weather);
    let grip_limit = grip_limited_speed(traction, segment, weather);
    let target = target_speed(vehicle, segment, grip_limit);

    if weather.is_wet() {
        target * (1.0 - 0.05 * weather.rain_intensity())
    } else {
        target
    }
}

/// should_pit decides on a pit stop from tire wear and energy level.
pub fn should_pit(vehicle: &Vehicle, progress: &RaceProgress) -> PitIntent {
    if vehicle.is_pitting() {
        return PitIntent::None;
    }

    let laps_remaining = progress.laps_remaining();
    let wear = vehicle.tire_wear();

    if (wear > PIT_WEAR_IMMEDIATE && laps_remaining > 2)
        || vehicle.energy_level() < PIT_ENERGY_IMMEDIATE
    {
        PitIntent::Immediate
    } else if laps_remaining <= 3 && wear > PIT_WEAR_NEXT_LAP {
        PitIntent::NextLap
    } else {
        PitIntent::None
    }
}

/// assess_overtake returns the overtaking intent against the closest vehicle ahead. Without a
/// viable target the intent is none, with a vehicle close behind it is to defend.
pub fn assess_overtake(
    vehicle: &Vehicle,
    surroundings: &Surroundings,
    segment: &TrackSegment,
    risk: f64,
) -> OvertakeIntent {
    let ahead = match surroundings.ahead.first() {
        Some(ahead) => ahead,
        None => return OvertakeIntent::None,
    };

    if ahead.distance <= OVERTAKE_MIN_GAP || ahead.distance >= OVERTAKE_MAX_GAP {
        return OvertakeIntent::None;
    }
    if vehicle.speed - ahead.speed < OVERTAKE_MIN_ADVANTAGE {
        return OvertakeIntent::None;
    }
    if matches!(segment.kind, SegmentKind::Corner | SegmentKind::Hairpin) {
        return OvertakeIntent::None;
    }

    if surroundings
        .behind
        .first()
        .map_or(false, |behind| behind.distance < DEFEND_GAP)
    {
        return OvertakeIntent::Defend;
    }

    if risk > OVERTAKE_MIN_RISK {
        OvertakeIntent::Attempt
    } else {
        OvertakeIntent::None
    }
}

/// energy_mode compares the projected energy need per lap with the energy available per
/// remaining lap.
pub fn energy_mode(
    vehicle: &Vehicle,
    progress: &RaceProgress,
    weather: &Weather,
    lap_length: f64,
) -> EnergyMode {
    if weather.is_wet() {
        return EnergyMode::Conservative;
    }

    let need_per_lap = vehicle.energy.consumption_rate * lap_length / 1000.0 * PROJECTION_LOAD;
    if !(need_per_lap > 0.0) {
        return EnergyMode::Aggressive;
    }

    let available_per_lap = vehicle.energy_level() / progress.laps_remaining().max(1) as f64;
    let ratio = need_per_lap / available_per_lap.max(f64::EPSILON);

    if ratio > 1.0 {
        EnergyMode::Conservative
    } else if ratio < 0.5 {
        EnergyMode::Aggressive
    } else {
        EnergyMode::Balanced
    }
}

/// wrap_angle maps an angle (rad) into [-pi, pi].
fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped.is_finite() {
        wrapped
    } else {
        0.0
    }
}

/// steering_target returns the steering input in [-1.0, 1.0] for the segment type. Corners steer
/// towards the heading of the next segment, chicanes alternate over the segment, and all inputs
/// are damped with increasing speed.
pub fn steering_target(vehicle: &Vehicle, segment: &TrackSegment, next_heading: f64) -> f64 {
    let heading_error = wrap_angle(next_heading - vehicle.heading);

    let raw = match segment.kind {
        SegmentKind::Corner => heading_error / FRAC_PI_2,
        SegmentKind::Hairpin => 1.5 * heading_error / FRAC_PI_2,
        SegmentKind::Chicane => 0.6 * (2.0 * PI * vehicle.sh.get_seg_progress()).sin(),
        SegmentKind::Straight => 0.1 * heading_error / FRAC_PI_2,
    };

    let speed_frac = if vehicle.max_speed > 0.0 {
        (vehicle.speed / vehicle.max_speed).clamp(0.0, 1.0)
    } else {
        0.0
    };

    (raw * (1.0 - 0.5 * speed_frac)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strategy::SurroundingVehicle;
    use crate::core::track::tests::segment_pars;
    use crate::core::vehicle::tests::vehicle_pars;
    use approx::assert_relative_eq;

    fn vehicle_with_aggression(aggression: f64) -> Vehicle {
        let mut pars = vehicle_pars(1);
        pars.aggression = aggression;
        Vehicle::new(&pars)
    }

    fn straight() -> TrackSegment {
        TrackSegment::new(&segment_pars(0, SegmentKind::Straight, 1000.0))
    }

    fn progress(current_lap: u32, total_laps: u32) -> RaceProgress {
        RaceProgress {
            current_lap,
            total_laps,
            elapsed: 0.0,
        }
    }

    fn other(id: u32, speed: f64, distance: f64) -> SurroundingVehicle {
        SurroundingVehicle {
            id,
            speed,
            distance,
        }
    }

    #[test]
    fn risk_follows_aggression_and_conditions() {
        let clear = Weather::default();
        assert_relative_eq!(risk_tolerance(&vehicle_with_aggression(0.5), &clear), 0.5);
        assert_relative_eq!(risk_tolerance(&vehicle_with_aggression(1.0), &clear), 0.9);
        assert_relative_eq!(risk_tolerance(&vehicle_with_aggression(0.0), &clear), 0.1);

        let mut worn = vehicle_with_aggression(1.0);
        worn.tireset.wear = 0.5;
        assert_relative_eq!(risk_tolerance(&worn, &clear), 0.75, epsilon = 1e-12);

        let rain = Weather {
            kind: WeatherKind::Rain,
            intensity: 1.0,
            ..Weather::default()
        };
        assert_relative_eq!(
            risk_tolerance(&vehicle_with_aggression(1.0), &rain),
            0.65,
            epsilon = 1e-12
        );
    }

    #[test]
    fn optimal_speed_is_limited_in_corners() {
        let vehicle = vehicle_with_aggression(0.5);
        let hairpin = TrackSegment::new(&segment_pars(1, SegmentKind::Hairpin, 50.0));

        assert_relative_eq!(optimal_speed(&vehicle, &straight(), &Weather::default()), 300.0);
        assert!(optimal_speed(&vehicle, &hairpin, &Weather::default()) < 100.0);
    }

    #[test]
    fn worn_tires_call_for_an_immediate_stop() {
        let mut vehicle = vehicle_with_aggression(0.5);
        vehicle.tireset.wear = 0.9;
        assert_eq!(should_pit(&vehicle, &progress(1, 10)), PitIntent::Immediate);

        // not worth it in the final two laps
        assert_eq!(should_pit(&vehicle, &progress(9, 10)), PitIntent::NextLap);

        vehicle.tireset.wear = 0.7;
        assert_eq!(should_pit(&vehicle, &progress(1, 10)), PitIntent::None);
        assert_eq!(should_pit(&vehicle, &progress(8, 10)), PitIntent::NextLap);

        vehicle.tireset.wear = 0.1;
        vehicle.energy.level = 0.1;
        assert_eq!(should_pit(&vehicle, &progress(10, 10)), PitIntent::Immediate);
    }

    #[test]
    fn overtake_needs_gap_speed_and_risk() {
        let mut bold = vehicle_with_aggression(1.0);
        bold.speed = 200.0;
        let mut calm = vehicle_with_aggression(0.5);
        calm.speed = 200.0;
        let surroundings = Surroundings {
            ahead: vec![other(2, 180.0, 20.0)],
            ..Surroundings::default()
        };
        let clear = Weather::default();

        let risk_bold = risk_tolerance(&bold, &clear);
        let risk_calm = risk_tolerance(&calm, &clear);
        assert_eq!(
            assess_overtake(&bold, &surroundings, &straight(), risk_bold),
            OvertakeIntent::Attempt
        );
        assert_eq!(
            assess_overtake(&calm, &surroundings, &straight(), risk_calm),
            OvertakeIntent::None
        );

        let corner = TrackSegment::new(&segment_pars(1, SegmentKind::Corner, 100.0));
        assert_eq!(
            assess_overtake(&bold, &surroundings, &corner, risk_bold),
            OvertakeIntent::None
        );

        let too_far = Surroundings {
            ahead: vec![other(2, 180.0, 60.0)],
            ..Surroundings::default()
        };
        assert_eq!(
            assess_overtake(&bold, &too_far, &straight(), risk_bold),
            OvertakeIntent::None
        );

        let pressed = Surroundings {
            ahead: vec![other(2, 180.0, 20.0)],
            behind: vec![other(3, 205.0, 5.0)],
            ..Surroundings::default()
        };
        assert_eq!(
            assess_overtake(&bold, &pressed, &straight(), risk_bold),
            OvertakeIntent::Defend
        );
    }

    #[test]
    fn energy_mode_follows_the_projection() {
        let mut vehicle = vehicle_with_aggression(0.5);
        let clear = Weather::default();

        // 0.01 * 5 km * 0.8 = 0.04 per lap
        vehicle.energy.level = 1.0;
        assert_eq!(
            energy_mode(&vehicle, &progress(1, 10), &clear, 5000.0),
            EnergyMode::Aggressive
        );
        vehicle.energy.level = 0.6;
        assert_eq!(
            energy_mode(&vehicle, &progress(1, 10), &clear, 5000.0),
            EnergyMode::Balanced
        );
        vehicle.energy.level = 0.3;
        assert_eq!(
            energy_mode(&vehicle, &progress(1, 10), &clear, 5000.0),
            EnergyMode::Conservative
        );

        let rain = Weather {
            kind: WeatherKind::Rain,
            intensity: 0.5,
            ..Weather::default()
        };
        vehicle.energy.level = 1.0;
        assert_eq!(
            energy_mode(&vehicle, &progress(1, 10), &rain, 5000.0),
            EnergyMode::Conservative
        );
    }

    #[test]
    fn steering_is_bounded_and_damped() {
        let mut vehicle = vehicle_with_aggression(0.5);
        let hairpin = TrackSegment::new(&segment_pars(1, SegmentKind::Hairpin, 50.0));

        let slow = steering_target(&vehicle, &hairpin, FRAC_PI_2);
        assert_relative_eq!(slow, 1.0);

        vehicle.speed = vehicle.max_speed;
        let corner = TrackSegment::new(&segment_pars(1, SegmentKind::Corner, 50.0));
        let fast = steering_target(&vehicle, &corner, FRAC_PI_2 / 2.0);
        assert_relative_eq!(fast, 0.25, epsilon = 1e-12);

        assert_relative_eq!(steering_target(&vehicle, &straight(), 0.0), 0.0);
    }
}
