use crate::core::physics::PhysicsResult;
use crate::core::state_handler::StateHandler;
use crate::core::strategy::{PolicyPars, StrategyDecision};
use crate::core::tireset::{TireCompound, Tireset};
use crate::core::track::Track;
use helpers::general::clamp_unit;
use serde::{Deserialize, Serialize};

/// Below this energy level a vehicle is not raceable anymore.
pub const MIN_RACEABLE_ENERGY: f64 = 0.05;
/// Above this tire wear a vehicle is not raceable anymore.
pub const MAX_RACEABLE_WEAR: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Car,
    Drone,
    Bike,
    Boat,
    Truck,
}

impl Default for VehicleClass {
    fn default() -> Self {
        VehicleClass::Car
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyKind {
    Battery,
    Fuel,
}

fn default_level() -> f64 {
    1.0
}

/// * `kind` - Battery or fuel
/// * `capacity` - (kWh or l) Capacity, informational
/// * `level` - Initial level as fraction of the capacity in [0.0, 1.0]
/// * `consumption_rate` - Fraction of the capacity consumed per km at full load
/// * `regeneration_rate` - Fraction of the capacity recovered per second of full braking (battery
/// only)
#[derive(Debug, Deserialize, Clone)]
pub struct EnergyPars {
    pub kind: EnergyKind,
    pub capacity: f64,
    #[serde(default = "default_level")]
    pub level: f64,
    pub consumption_rate: f64,
    #[serde(default)]
    pub regeneration_rate: Option<f64>,
}

fn default_turning_radius() -> f64 {
    10.0
}

fn default_grip_coefficient() -> f64 {
    1.0
}

fn default_frontal_area() -> f64 {
    2.0
}

fn default_aggression() -> f64 {
    0.5
}

/// Static performance profile of a vehicle.
/// * `id` - Vehicle number
/// * `name` - Display name
/// * `class` - Behavior class, carried as metadata
/// * `mass` - (kg) Mass
/// * `max_speed` - (km/h) Top speed
/// * `acceleration` - (m/s^2) Maximum acceleration
/// * `deceleration` - (m/s^2) Maximum deceleration
/// * `turning_radius` - (m) Minimum turning radius
/// * `drag_coefficient` - Aerodynamic drag coefficient
/// * `grip_coefficient` - Mechanical grip coefficient in [0.0, 1.0]
/// * `frontal_area` - (m^2) Frontal area
/// * `energy` - Energy model
/// * `tire_compound` - Preferred dry tire compound
/// * `aggression` - Driving aggression in [0.0, 1.0], shifts the risk tolerance
/// * `policy` - Decision policy driving the vehicle
#[derive(Debug, Deserialize, Clone)]
pub struct VehiclePars {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub class: VehicleClass,
    pub mass: f64,
    pub max_speed: f64,
    pub acceleration: f64,
    pub deceleration: f64,
    #[serde(default = "default_turning_radius")]
    pub turning_radius: f64,
    pub drag_coefficient: f64,
    #[serde(default = "default_grip_coefficient")]
    pub grip_coefficient: f64,
    #[serde(default = "default_frontal_area")]
    pub frontal_area: f64,
    pub energy: EnergyPars,
    #[serde(default)]
    pub tire_compound: TireCompound,
    #[serde(default = "default_aggression")]
    pub aggression: f64,
    #[serde(default)]
    pub policy: PolicyPars,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyModel {
    pub kind: EnergyKind,
    pub capacity: f64,
    pub level: f64,
    pub consumption_rate: f64,
    pub regeneration_rate: Option<f64>,
}

impl EnergyModel {
    /// can_regenerate returns true for batteries with a positive regeneration rate.
    pub fn can_regenerate(&self) -> bool {
        self.kind == EnergyKind::Battery && self.regeneration_rate.map_or(false, |r| r > 0.0)
    }

    fn debit(&mut self, fraction: f64) {
        if fraction > 0.0 {
            self.level = clamp_unit(self.level - fraction);
        }
    }

    fn credit(&mut self, fraction: f64) {
        if fraction > 0.0 {
            self.level = clamp_unit(self.level + fraction);
        }
    }

    pub fn refill(&mut self) {
        self.level = 1.0;
    }
}

/// Throttle, braking and steering inputs for one step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlInputs {
    pub throttle: f64,
    pub braking: f64,
    pub steering: f64,
}

impl From<&StrategyDecision> for ControlInputs {
    fn from(decision: &StrategyDecision) -> Self {
        ControlInputs {
            throttle: decision.throttle,
            braking: decision.braking,
            steering: decision.steering,
        }
    }
}

impl ControlInputs {
    fn clamped(&self) -> ControlInputs {
        ControlInputs {
            throttle: clamp_unit(self.throttle),
            braking: clamp_unit(self.braking),
            steering: helpers::general::clamp_or(self.steering, -1.0, 1.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    // static profile
    pub id: u32,
    pub name: String,
    pub class: VehicleClass,
    pub mass: f64,
    pub max_speed: f64,
    pub accel_max: f64,
    pub decel_max: f64,
    pub turning_radius: f64,
    pub drag_coefficient: f64,
    pub grip_coefficient: f64,
    pub frontal_area: f64,
    pub aggression: f64,
    pub dry_compound: TireCompound,
    // mutable race state
    pub energy: EnergyModel,
    pub position: [f64; 2],
    pub heading: f64,
    pub speed: f64,
    pub acceleration: f64,
    pub distance: f64,
    pub tireset: Tireset,
    pub sh: StateHandler,
    pub overtakes: u32,
    pub positions_lost: u32,
    pub laptimes: Vec<f64>,
    pub racetime: f64,
}

impl Vehicle {
    pub fn new(vehicle_pars: &VehiclePars) -> Vehicle {
        Vehicle {
            id: vehicle_pars.id,
            name: vehicle_pars.name.to_owned(),
            class: vehicle_pars.class,
            mass: vehicle_pars.mass,
            max_speed: vehicle_pars.max_speed.max(0.0),
            accel_max: vehicle_pars.acceleration,
            decel_max: vehicle_pars.deceleration,
            turning_radius: vehicle_pars.turning_radius,
            drag_coefficient: vehicle_pars.drag_coefficient,
            grip_coefficient: vehicle_pars.grip_coefficient,
            frontal_area: vehicle_pars.frontal_area,
            aggression: clamp_unit(vehicle_pars.aggression),
            dry_compound: vehicle_pars.tire_compound,
            energy: EnergyModel {
                kind: vehicle_pars.energy.kind,
                capacity: vehicle_pars.energy.capacity,
                level: clamp_unit(vehicle_pars.energy.level),
                consumption_rate: vehicle_pars.energy.consumption_rate.max(0.0),
                regeneration_rate: vehicle_pars.energy.regeneration_rate,
            },
            position: [0.0, 0.0],
            heading: 0.0,
            speed: 0.0,
            acceleration: 0.0,
            distance: 0.0,
            tireset: Tireset::new(vehicle_pars.tire_compound),
            sh: StateHandler::default(),
            overtakes: 0,
            positions_lost: 0,
            laptimes: Vec::new(),
            racetime: 0.0,
        }
    }

    pub fn energy_level(&self) -> f64 {
        self.energy.level
    }

    pub fn tire_wear(&self) -> f64 {
        self.tireset.wear
    }

    pub fn is_pitting(&self) -> bool {
        self.sh.is_pitting()
    }

    /// is_raceable returns false if the vehicle runs out of energy or tires.
    pub fn is_raceable(&self) -> bool {
        self.energy.level > MIN_RACEABLE_ENERGY && self.tireset.wear < MAX_RACEABLE_WEAR
    }

    pub fn best_laptime(&self) -> Option<f64> {
        self.laptimes.iter().copied().fold(None, |best, t| match best {
            Some(b) if b <= t => Some(b),
            _ => Some(t),
        })
    }

    /// place_on_track puts the vehicle `start_offset` meters ahead of the finish line, on whichever
    /// segment that distance falls, heading along the segment. Laps are counted from there on.
    pub fn place_on_track(&mut self, track: &Track, start_offset: f64) {
        let (start_segment, start_progress) = track.locate(start_offset.max(0.0));
        self.sh.initialize_state_handler(start_segment, start_progress);
        self.sync_position(track);
    }

    /// sync_position recalculates the 2D position and heading from the progress on the track.
    pub fn sync_position(&mut self, track: &Track) {
        if let Some(segment) = track.segment(self.sh.get_cur_segment()) {
            self.position = segment.point_at(self.sh.get_seg_progress());
            self.heading = segment.heading();
        }
    }

    /// reset_race_state zeroes all mutable race state: standstill, full energy, fresh tires of
    /// the preferred dry compound, cleared counters and lap time history.
    pub fn reset_race_state(&mut self, track: &Track, start_offset: f64) {
        self.speed = 0.0;
        self.acceleration = 0.0;
        self.distance = 0.0;
        self.energy.refill();
        self.tireset.fit(self.dry_compound);
        self.overtakes = 0;
        self.positions_lost = 0;
        self.laptimes.clear();
        self.racetime = 0.0;
        self.place_on_track(track, start_offset);
    }

    /// advance applies throttle and brake to compute the acceleration, integrates speed and
    /// distance, and updates energy and tire wear. Returns the driven distance (m).
    pub fn advance(&mut self, dt: f64, controls: &ControlInputs) -> f64 {
        if !(dt > 0.0) {
            return 0.0;
        }
        let controls = controls.clamped();

        let accel = controls.throttle * self.accel_max - controls.braking * self.decel_max;
        let speed_prev = self.speed;
        self.speed = (self.speed + accel * dt * 3.6).clamp(0.0, self.max_speed);
        self.acceleration = (self.speed - speed_prev) / 3.6 / dt;

        let distance = 0.5 * (speed_prev + self.speed) / 3.6 * dt;

        let regen = if self.acceleration < 0.0 && self.energy.can_regenerate() {
            self.energy.regeneration_rate.unwrap_or(0.0)
                * controls.braking
                * (self.speed / 100.0).min(1.0)
        } else {
            0.0
        };

        self.wear_and_consume(dt, distance, self.energy.consumption_rate, regen, &controls);
        distance
    }

    /// apply_physics takes over speed and acceleration from the physics model and updates energy
    /// and tire wear accordingly. Returns the driven distance (m).
    pub fn apply_physics(&mut self, dt: f64, result: &PhysicsResult, controls: &ControlInputs) -> f64 {
        if !(dt > 0.0) {
            return 0.0;
        }
        let controls = controls.clamped();

        self.speed = result.speed.clamp(0.0, self.max_speed);
        self.acceleration = result.acceleration;

        let distance = self.speed / 3.6 * dt;
        self.wear_and_consume(dt, distance, result.battery_drain, result.regen, &controls);
        distance
    }

    fn wear_and_consume(
        &mut self,
        dt: f64,
        distance: f64,
        consumption_rate: f64,
        regen_rate: f64,
        controls: &ControlInputs,
    ) {
        self.distance += distance;

        let load = 0.3 + 0.7 * controls.throttle;
        self.energy.debit(consumption_rate * distance / 1000.0 * load);
        self.energy.credit(regen_rate * dt);

        self.tireset.drive(distance, controls.throttle, controls.steering);
    }

    /// perform_pitstop fits fresh tires suited for the given rain intensity and refills the
    /// energy store.
    pub fn perform_pitstop(&mut self, rain_intensity: f64) {
        let compound = TireCompound::for_conditions(self.dry_compound, rain_intensity);
        self.tireset.fit(compound);
        self.energy.refill();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::track::tests::{segment_pars, track_pars};
    use crate::core::track::SegmentKind;
    use approx::assert_relative_eq;

    pub(crate) fn vehicle_pars(id: u32) -> VehiclePars {
        VehiclePars {
            id,
            name: format!("Vehicle {}", id),
            class: VehicleClass::Car,
            mass: 800.0,
            max_speed: 300.0,
            acceleration: 10.0,
            deceleration: 20.0,
            turning_radius: 10.0,
            drag_coefficient: 0.7,
            grip_coefficient: 1.0,
            frontal_area: 1.5,
            energy: EnergyPars {
                kind: EnergyKind::Battery,
                capacity: 50.0,
                level: 1.0,
                consumption_rate: 0.01,
                regeneration_rate: Some(0.002),
            },
            tire_compound: TireCompound::Medium,
            aggression: 0.5,
            policy: PolicyPars::default(),
        }
    }

    #[test]
    fn advance_integrates_speed_and_distance() {
        let mut vehicle = Vehicle::new(&vehicle_pars(1));
        let controls = ControlInputs {
            throttle: 1.0,
            braking: 0.0,
            steering: 0.0,
        };

        let distance = vehicle.advance(1.0, &controls);

        assert_relative_eq!(vehicle.speed, 36.0);
        assert_relative_eq!(vehicle.acceleration, 10.0);
        assert_relative_eq!(distance, 5.0);
        assert!(vehicle.energy_level() < 1.0);
        assert!(vehicle.tire_wear() > 0.0);
    }

    #[test]
    fn speed_stays_within_limits() {
        let mut vehicle = Vehicle::new(&vehicle_pars(1));
        let full = ControlInputs {
            throttle: 7.0,
            braking: 0.0,
            steering: 0.0,
        };
        let brake = ControlInputs {
            throttle: 0.0,
            braking: 1.0,
            steering: 0.0,
        };

        for _ in 0..100 {
            vehicle.advance(1.0, &full);
            assert!(vehicle.speed <= vehicle.max_speed);
        }
        assert_relative_eq!(vehicle.speed, 300.0);

        for _ in 0..100 {
            vehicle.advance(1.0, &brake);
            assert!(vehicle.speed >= 0.0);
        }
        assert_relative_eq!(vehicle.speed, 0.0);
    }

    #[test]
    fn braking_regenerates_batteries_only() {
        let mut battery = Vehicle::new(&vehicle_pars(1));
        battery.speed = 200.0;
        battery.energy.level = 0.5;
        let brake = ControlInputs {
            throttle: 0.0,
            braking: 0.5,
            steering: 0.0,
        };
        let level_before = battery.energy_level();
        let distance = battery.advance(0.1, &brake);
        let consumed = 0.01 * distance / 1000.0 * 0.3;
        assert_relative_eq!(
            battery.energy_level(),
            level_before - consumed + 0.002 * 0.5 * 1.0 * 0.1,
            epsilon = 1e-12
        );

        let mut pars = vehicle_pars(2);
        pars.energy.kind = EnergyKind::Fuel;
        let mut fuel = Vehicle::new(&pars);
        fuel.speed = 200.0;
        fuel.energy.level = 0.5;
        fuel.advance(0.1, &brake);
        assert!(fuel.energy_level() < 0.5);
    }

    #[test]
    fn raceable_thresholds() {
        let mut vehicle = Vehicle::new(&vehicle_pars(1));
        assert!(vehicle.is_raceable());

        vehicle.energy.level = 0.05;
        assert!(!vehicle.is_raceable());

        vehicle.energy.level = 0.5;
        vehicle.tireset.wear = 0.95;
        assert!(!vehicle.is_raceable());
    }

    #[test]
    fn pitstop_refills_and_fits_rain_tires() {
        let mut vehicle = Vehicle::new(&vehicle_pars(1));
        vehicle.energy.level = 0.1;
        vehicle.tireset.wear = 0.9;

        vehicle.perform_pitstop(0.8);

        assert_eq!(vehicle.energy_level(), 1.0);
        assert_eq!(vehicle.tire_wear(), 0.0);
        assert_eq!(vehicle.tireset.compound, TireCompound::Wet);
    }

    #[test]
    fn best_laptime_is_the_minimum() {
        let mut vehicle = Vehicle::new(&vehicle_pars(1));
        assert_eq!(vehicle.best_laptime(), None);
        vehicle.laptimes = vec![62.0, 60.5, 61.0];
        assert_eq!(vehicle.best_laptime(), Some(60.5));
    }

    #[test]
    fn grid_continues_past_a_short_first_segment() {
        let track = Track::new(&track_pars(vec![
            segment_pars(0, SegmentKind::Straight, 4.0),
            segment_pars(1, SegmentKind::Corner, 100.0),
        ]));

        let distances: Vec<f64> = (0..12)
            .map(|idx| {
                let mut vehicle = Vehicle::new(&vehicle_pars(idx + 1));
                vehicle.place_on_track(&track, 0.5 * idx as f64);
                assert_eq!(vehicle.sh.get_compl_lap(), 0);
                vehicle.sh.race_distance(&track)
            })
            .collect();

        for (idx, distance) in distances.iter().enumerate() {
            assert_relative_eq!(*distance, 0.5 * idx as f64, epsilon = 1e-9);
        }
    }
}
