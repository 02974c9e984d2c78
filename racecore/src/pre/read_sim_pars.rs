use crate::core::race::RacePars;
use crate::core::track::{SegmentPars, TrackPars};
use crate::core::vehicle::VehiclePars;
use anyhow::Context;
use helpers::general::InputValueError;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;

/// SimPars is used to store all other parameter structs.
#[derive(Debug, Deserialize, Clone)]
pub struct SimPars {
    pub race_pars: RacePars,
    pub track_pars: TrackPars,
    #[serde(default)]
    pub vehicle_pars_all: Vec<VehiclePars>,
}

fn check_positive(field: String, value: f64) -> Result<(), InputValueError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(InputValueError::new(field, format!("must be positive and finite, got {}", value)))
    }
}

fn check_non_negative(field: String, value: f64) -> Result<(), InputValueError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(InputValueError::new(field, format!("must be non-negative and finite, got {}", value)))
    }
}

fn check_unit(field: String, value: f64) -> Result<(), InputValueError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(InputValueError::new(field, format!("must lie in [0.0, 1.0], got {}", value)))
    }
}

fn validate_segment(idx: usize, segment: &SegmentPars) -> Result<(), InputValueError> {
    let field = |name: &str| format!("track_pars.segments[{}].{}", idx, name);

    match segment.length {
        Some(length) => check_positive(field("length"), length)?,
        None => {
            let dx = segment.end[0] - segment.start[0];
            let dy = segment.end[1] - segment.start[1];
            check_positive(field("start/end"), dx.hypot(dy))?
        }
    }
    check_non_negative(field("grip"), segment.grip)?;
    check_unit(field("hazard_level"), segment.hazard_level)?;
    if let Some(radius) = segment.corner_radius {
        check_positive(field("corner_radius"), radius)?;
    }
    Ok(())
}

fn validate_vehicle(idx: usize, vehicle: &VehiclePars) -> Result<(), InputValueError> {
    let field = |name: &str| format!("vehicle_pars_all[{}].{}", idx, name);

    check_positive(field("mass"), vehicle.mass)?;
    check_positive(field("max_speed"), vehicle.max_speed)?;
    check_positive(field("acceleration"), vehicle.acceleration)?;
    check_positive(field("deceleration"), vehicle.deceleration)?;
    check_non_negative(field("drag_coefficient"), vehicle.drag_coefficient)?;
    check_non_negative(field("frontal_area"), vehicle.frontal_area)?;
    check_unit(field("grip_coefficient"), vehicle.grip_coefficient)?;
    check_unit(field("aggression"), vehicle.aggression)?;
    check_unit(field("energy.level"), vehicle.energy.level)?;
    check_non_negative(field("energy.consumption_rate"), vehicle.energy.consumption_rate)?;
    if let Some(regeneration_rate) = vehicle.energy.regeneration_rate {
        check_non_negative(field("energy.regeneration_rate"), regeneration_rate)?;
    }
    Ok(())
}

impl SimPars {
    /// validate rejects physically impossible parameters. An empty roster or track is not an
    /// error, a race built from it simply cannot be started.
    pub fn validate(&self) -> Result<(), InputValueError> {
        let race_pars = &self.race_pars;
        let rates = &race_pars.event_rates;

        if race_pars.tot_no_laps == 0 {
            return Err(InputValueError::new("race_pars.tot_no_laps", "must be at least 1"));
        }
        check_non_negative("race_pars.grid_spacing_m".to_owned(), race_pars.grid_spacing_m)?;
        check_non_negative(
            "race_pars.collision_proximity_m".to_owned(),
            race_pars.collision_proximity_m,
        )?;
        check_non_negative("race_pars.obstacle_ttl_s".to_owned(), race_pars.obstacle_ttl_s)?;
        check_unit("race_pars.weather.intensity".to_owned(), race_pars.weather.intensity)?;
        for (name, rate) in [
            ("weather_change", rates.weather_change),
            ("breakdown", rates.breakdown),
            ("battery_low", rates.battery_low),
            ("collision", rates.collision),
            ("obstacle", rates.obstacle),
        ] {
            check_non_negative(format!("race_pars.event_rates.{}", name), rate)?;
        }
        for (name, multiplier) in [
            ("boost_multiplier", race_pars.boost_multiplier),
            ("overtake_multiplier", race_pars.overtake_multiplier),
        ] {
            if !(1.0..=1.5).contains(&multiplier) {
                return Err(InputValueError::new(
                    format!("race_pars.{}", name),
                    format!("must lie in [1.0, 1.5], got {}", multiplier),
                ));
            }
        }

        check_non_negative("track_pars.pit_duration".to_owned(), self.track_pars.pit_duration)?;
        for (idx, segment) in self.track_pars.segments.iter().enumerate() {
            validate_segment(idx, segment)?;
        }

        let mut ids = HashSet::new();
        for (idx, vehicle) in self.vehicle_pars_all.iter().enumerate() {
            if !ids.insert(vehicle.id) {
                return Err(InputValueError::new(
                    format!("vehicle_pars_all[{}].id", idx),
                    format!("vehicle id {} is used more than once", vehicle.id),
                ));
            }
            validate_vehicle(idx, vehicle)?;
        }

        Ok(())
    }
}

/// read_sim_pars reads the JSON file and decodes the JSON string into the simulation parameters
/// struct.
pub fn read_sim_pars(filepath: &Path) -> anyhow::Result<SimPars> {
    let fh = OpenOptions::new()
        .read(true)
        .open(filepath)
        .with_context(|| format!("Failed to open parameter file {}!", filepath.display()))?;
    let pars: SimPars = serde_json::from_reader(&fh)
        .with_context(|| format!("Failed to parse parameter file {}!", filepath.display()))?;
    pars.validate()
        .with_context(|| format!("Invalid parameter file {}!", filepath.display()))?;
    Ok(pars)
}
