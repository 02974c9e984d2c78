use helpers::general::lin_interp;
use serde::{Deserialize, Serialize};

/// Wear (fraction of the tire life) accumulated per driven kilometer by a medium compound when
/// rolling without throttle or steering input.
const BASE_WEAR_PER_KM: f64 = 0.01;

/// Rain intensities at which the compound grip levels are specified.
const RAIN_SUPPORT_POINTS: [f64; 3] = [0.0, 0.5, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TireCompound {
    Soft,
    Medium,
    Hard,
    Intermediate,
    Wet,
}

impl Default for TireCompound {
    fn default() -> Self {
        TireCompound::Medium
    }
}

impl TireCompound {
    /// Grip factors at the rain intensities in `RAIN_SUPPORT_POINTS`.
    fn grip_levels(&self) -> [f64; 3] {
        match self {
            TireCompound::Soft => [1.05, 0.75, 0.55],
            TireCompound::Medium => [1.0, 0.75, 0.6],
            TireCompound::Hard => [0.95, 0.72, 0.58],
            TireCompound::Intermediate => [0.88, 0.92, 0.82],
            TireCompound::Wet => [0.78, 0.88, 0.97],
        }
    }

    /// wear_factor returns the wear rate relative to the medium compound.
    pub fn wear_factor(&self) -> f64 {
        match self {
            TireCompound::Soft => 1.4,
            TireCompound::Medium => 1.0,
            TireCompound::Hard => 0.7,
            TireCompound::Intermediate => 1.1,
            TireCompound::Wet => 1.2,
        }
    }

    /// grip_factor returns the compound's grip multiplier for the given rain intensity.
    pub fn grip_factor(&self, rain_intensity: f64) -> f64 {
        lin_interp(
            rain_intensity.clamp(0.0, 1.0),
            &RAIN_SUPPORT_POINTS,
            &self.grip_levels(),
        )
    }

    /// for_conditions returns the compound to fit at a pit stop: rain tires for heavy rain,
    /// intermediates for light rain, the preferred dry compound otherwise.
    pub fn for_conditions(dry_compound: TireCompound, rain_intensity: f64) -> TireCompound {
        if rain_intensity > 0.5 {
            TireCompound::Wet
        } else if rain_intensity > 0.2 {
            TireCompound::Intermediate
        } else {
            dry_compound
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tireset {
    pub compound: TireCompound,
    pub wear: f64,
    pub laps_cur_stint: u32,
}

impl Tireset {
    pub fn new(compound: TireCompound) -> Tireset {
        Tireset {
            compound,
            wear: 0.0,
            laps_cur_stint: 0,
        }
    }

    /// drive accrues wear for the driven distance. Wear grows with throttle and steering
    /// magnitude and never decreases.
    pub fn drive(&mut self, distance: f64, throttle: f64, steering: f64) {
        if !(distance > 0.0) {
            return;
        }

        let load = 1.0 + 0.5 * throttle.abs().min(1.0) + 0.5 * steering.abs().min(1.0);
        let wear_add = BASE_WEAR_PER_KM * distance / 1000.0 * self.compound.wear_factor() * load;

        self.wear = (self.wear + wear_add).clamp(0.0, 1.0);
    }

    /// add_damage increases the wear, e.g. after a collision.
    pub fn add_damage(&mut self, wear_add: f64) {
        if wear_add > 0.0 {
            self.wear = (self.wear + wear_add).min(1.0);
        }
    }

    /// drive_lap increases the stint age by one lap.
    pub fn drive_lap(&mut self) {
        self.laps_cur_stint += 1;
    }

    /// fit mounts a fresh set of tires of the given compound.
    pub fn fit(&mut self, compound: TireCompound) {
        *self = Tireset::new(compound);
    }
}
