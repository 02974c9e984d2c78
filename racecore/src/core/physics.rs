//! Stateless vehicle dynamics: traction, slip, drag, energy drain, regeneration and the
//! speed integration for one timestep. Nothing in here mutates its inputs.

use crate::core::track::{SegmentKind, TrackSegment};
use crate::core::vehicle::{ControlInputs, Vehicle};
use crate::core::weather::{Weather, WeatherKind};
use serde::Serialize;

/// (m/s^2) Gravitational acceleration
pub const GRAVITY: f64 = 9.81;
/// (kg/m^3) Air density at sea level
pub const AIR_DENSITY_SEA_LEVEL: f64 = 1.225;
/// (m) Scale height of the exponential air density model
const AIR_DENSITY_SCALE_HEIGHT: f64 = 8500.0;
/// Slip ratio reached at full traction
pub const IDEAL_SLIP: f64 = 0.1;
pub const MAX_SLIP: f64 = 0.5;
pub const MIN_TRACTION: f64 = 0.1;
pub const MAX_TRACTION: f64 = 1.0;
/// (m/s) Wind speed at full wind intensity
const MAX_WIND_SPEED: f64 = 15.0;

/// Result of one physics step. The orchestrator applies `speed` and `acceleration`, the
/// remaining values are telemetry (and the energy rates used for consumption).
///
/// * `speed` - (km/h) New speed
/// * `acceleration` - (m/s^2) Net acceleration including drag
/// * `traction` - Available traction in [0.1, 1.0]
/// * `slip` - Slip ratio in [0.0, 0.5]
/// * `drag` - (N) Aerodynamic drag force
/// * `battery_drain` - Energy consumption rate (fraction of capacity per km at full load)
/// * `regen` - Regeneration rate (fraction of capacity per second)
/// * `grip_limit` - (km/h) Grip-limited corner speed, `None` on straights
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PhysicsResult {
    pub speed: f64,
    pub acceleration: f64,
    pub traction: f64,
    pub slip: f64,
    pub drag: f64,
    pub battery_drain: f64,
    pub regen: f64,
    pub grip_limit: Option<f64>,
}

impl PhysicsResult {
    pub fn is_finite(&self) -> bool {
        self.speed.is_finite()
            && self.acceleration.is_finite()
            && self.traction.is_finite()
            && self.drag.is_finite()
            && self.battery_drain.is_finite()
            && self.regen.is_finite()
    }
}

/// weather_penalty returns the traction factor due to rain or crosswind.
fn weather_penalty(weather: &Weather, heading: f64) -> f64 {
    match weather.kind {
        WeatherKind::Rain => 1.0 - 0.4 * weather.rain_intensity(),
        WeatherKind::Wind => {
            let crosswind = weather
                .wind_direction
                .map_or(1.0, |dir| (dir - heading).sin().abs());
            1.0 - 0.1 * weather.wind_intensity() * crosswind
        }
        WeatherKind::Clear | WeatherKind::Fog => 1.0,
    }
}

fn altitude_penalty(altitude: f64) -> f64 {
    1.0 - (altitude / 10000.0).clamp(0.0, 0.15)
}

fn banking_bonus(banking_deg: f64) -> f64 {
    1.0 + (banking_deg.to_radians().sin().abs() * 0.6).min(0.2)
}

/// calc_traction returns the available traction for a vehicle on a segment under the given
/// weather, clamped to [0.1, 1.0].
pub fn calc_traction(vehicle: &Vehicle, segment: &TrackSegment, weather: &Weather) -> f64 {
    let tire_factor = (1.0 - 0.5 * vehicle.tireset.wear)
        * vehicle.tireset.compound.grip_factor(weather.rain_intensity());

    let traction = segment.grip
        * segment.grip_factor()
        * vehicle.grip_coefficient
        * tire_factor
        * weather_penalty(weather, segment.heading())
        * altitude_penalty(segment.altitude)
        * banking_bonus(segment.banking);

    if traction.is_finite() {
        traction.clamp(MIN_TRACTION, MAX_TRACTION)
    } else {
        MIN_TRACTION
    }
}

/// calc_slip derives the slip ratio from the traction relative to the ideal slip target.
pub fn calc_slip(traction: f64) -> f64 {
    (IDEAL_SLIP / traction.max(MIN_TRACTION)).min(MAX_SLIP)
}

pub fn air_density(altitude: f64) -> f64 {
    AIR_DENSITY_SEA_LEVEL * (-altitude.max(0.0) / AIR_DENSITY_SCALE_HEIGHT).exp()
}

/// calc_drag returns the aerodynamic drag force (N) at the given speed (km/h). Windy weather adds
/// the headwind component to the relative air speed.
pub fn calc_drag(vehicle: &Vehicle, segment: &TrackSegment, weather: &Weather, speed: f64) -> f64 {
    let headwind = match (weather.kind, weather.wind_direction) {
        (WeatherKind::Wind, Some(dir)) => {
            -weather.wind_intensity() * MAX_WIND_SPEED * (dir - segment.heading()).cos()
        }
        (WeatherKind::Wind, None) => weather.wind_intensity() * MAX_WIND_SPEED,
        _ => 0.0,
    };
    let v_rel = (speed / 3.6 + headwind).max(0.0);

    0.5 * air_density(segment.altitude)
        * vehicle.drag_coefficient
        * segment.drag_factor()
        * vehicle.frontal_area
        * v_rel
        * v_rel
}

/// grip_limited_speed returns the maximum corner speed (km/h) permitted by the traction, `None`
/// on straights.
pub fn grip_limited_speed(traction: f64, segment: &TrackSegment, weather: &Weather) -> Option<f64> {
    segment.effective_corner_radius().map(|radius| {
        (traction * GRAVITY * radius.max(0.0)).sqrt() * 3.6 * (1.0 - 0.2 * weather.rain_intensity())
    })
}

/// target_speed returns the speed (km/h) a vehicle should aim for on a segment: top speed limited
/// by the grip-limited corner speed (derated in chicanes) and derated by the hazard level.
pub fn target_speed(vehicle: &Vehicle, segment: &TrackSegment, grip_limit: Option<f64>) -> f64 {
    let mut target = vehicle.max_speed;

    if let Some(limit) = grip_limit {
        let limit = if segment.kind == SegmentKind::Chicane {
            0.8 * limit
        } else {
            limit
        };
        target = target.min(limit);
    }

    target * (1.0 - 0.3 * segment.hazard_level)
}

/// simulate_step integrates the longitudinal dynamics of a vehicle over one timestep.
pub fn simulate_step(
    vehicle: &Vehicle,
    segment: &TrackSegment,
    weather: &Weather,
    controls: &ControlInputs,
    dt: f64,
) -> PhysicsResult {
    let traction = calc_traction(vehicle, segment, weather);
    let slip = calc_slip(traction);
    let grip_limit = grip_limited_speed(traction, segment, weather);

    let throttle = controls.throttle.clamp(0.0, 1.0);
    let braking = controls.braking.clamp(0.0, 1.0);

    let mut target = target_speed(vehicle, segment, grip_limit);
    if braking > throttle {
        target = target.min(vehicle.speed * (1.0 - 0.5 * braking));
    }

    // close the gap to the target speed within the traction-scaled accel/decel profile
    let gap = target - vehicle.speed;
    let accel_desired = if dt > 0.0 { gap / 3.6 / dt } else { 0.0 };
    let mut acceleration = if gap >= 0.0 {
        accel_desired.min(vehicle.accel_max * traction * throttle.max(0.1))
    } else {
        accel_desired.max(-vehicle.decel_max * traction)
    };

    let drag = calc_drag(vehicle, segment, weather, vehicle.speed);
    if vehicle.mass > 0.0 {
        acceleration -= drag / vehicle.mass;
    }

    let speed = (vehicle.speed + acceleration * dt * 3.6).max(0.0);

    let accel_ratio = if vehicle.accel_max > 0.0 {
        acceleration.abs() / vehicle.accel_max
    } else {
        0.0
    };
    let battery_drain = vehicle.energy.consumption_rate
        * (1.0 + 2.0 * slip)
        * (1.0 + drag / 1000.0)
        * (1.0 + 0.5 * accel_ratio)
        * segment.energy_factor();

    let regen = if acceleration < 0.0 && vehicle.energy.can_regenerate() {
        vehicle.energy.regeneration_rate.unwrap_or(0.0) * braking * (speed / 100.0).min(1.0)
    } else {
        0.0
    };

    PhysicsResult {
        speed,
        acceleration,
        traction,
        slip,
        drag,
        battery_drain,
        regen,
        grip_limit,
    }
}
