//! Decision policies: the decision type, the race context a policy decides on, and the closed set
//! of policy implementations (local heuristic, remote-backed with heuristic fallback).

pub mod common;
pub mod heuristic;
pub mod remote;

use crate::core::track::TrackSegment;
use crate::core::vehicle::Vehicle;
use crate::core::weather::Weather;
use heuristic::HeuristicPolicy;
use helpers::general::clamp_or;
use remote::RemotePolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_AHEAD: usize = 3;
pub const MAX_BEHIND: usize = 3;
pub const MAX_NEARBY: usize = 5;

pub const SAFE_THROTTLE: f64 = 0.5;
pub const SAFE_RISK_LEVEL: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OvertakeIntent {
    None,
    Attempt,
    Defend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitIntent {
    None,
    Immediate,
    NextLap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyMode {
    Aggressive,
    Balanced,
    Conservative,
}

/// normalize lowercases a label and drops separators, so "next_lap", "next-lap" and "nextLap"
/// compare equal.
fn normalize(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl OvertakeIntent {
    pub fn parse_label(label: &str) -> Option<Self> {
        match normalize(label).as_str() {
            "none" => Some(OvertakeIntent::None),
            "attempt" => Some(OvertakeIntent::Attempt),
            "defend" => Some(OvertakeIntent::Defend),
            _ => None,
        }
    }
}

impl PitIntent {
    pub fn parse_label(label: &str) -> Option<Self> {
        match normalize(label).as_str() {
            "none" => Some(PitIntent::None),
            "immediate" => Some(PitIntent::Immediate),
            "nextlap" => Some(PitIntent::NextLap),
            _ => None,
        }
    }
}

impl EnergyMode {
    pub fn parse_label(label: &str) -> Option<Self> {
        match normalize(label).as_str() {
            "aggressive" => Some(EnergyMode::Aggressive),
            "balanced" => Some(EnergyMode::Balanced),
            "conservative" => Some(EnergyMode::Conservative),
            _ => None,
        }
    }
}

/// Control decision of a policy for one step.
///
/// * `throttle`, `braking` - Pedal inputs in [0.0, 1.0]
/// * `steering` - Steering input in [-1.0, 1.0]
/// * `risk_level` - Risk the policy accepts in [0.0, 1.0]
/// * `overtaking` - Overtaking intent
/// * `pit_stop` - Pit intent
/// * `boost` - Boost (DRS-style) activation
/// * `energy_mode` - Energy management mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyDecision {
    pub throttle: f64,
    pub braking: f64,
    pub steering: f64,
    pub risk_level: f64,
    pub overtaking: OvertakeIntent,
    pub pit_stop: PitIntent,
    pub boost: bool,
    pub energy_mode: EnergyMode,
}

impl Default for StrategyDecision {
    fn default() -> Self {
        Self::safe_default()
    }
}

impl StrategyDecision {
    /// safe_default is used whenever no valid decision is available.
    pub fn safe_default() -> Self {
        StrategyDecision {
            throttle: SAFE_THROTTLE,
            braking: 0.0,
            steering: 0.0,
            risk_level: SAFE_RISK_LEVEL,
            overtaking: OvertakeIntent::None,
            pit_stop: PitIntent::None,
            boost: false,
            energy_mode: EnergyMode::Balanced,
        }
    }

    /// sanitized clamps all numeric fields to their ranges. Non-finite values take the value of
    /// the safe default.
    pub fn sanitized(&self) -> Self {
        StrategyDecision {
            throttle: clamp_or(self.throttle, 0.0, 1.0, SAFE_THROTTLE),
            braking: clamp_or(self.braking, 0.0, 1.0, 0.0),
            steering: clamp_or(self.steering, -1.0, 1.0, 0.0),
            risk_level: clamp_or(self.risk_level, 0.0, 1.0, SAFE_RISK_LEVEL),
            ..self.clone()
        }
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.throttle)
            && (0.0..=1.0).contains(&self.braking)
            && (-1.0..=1.0).contains(&self.steering)
            && (0.0..=1.0).contains(&self.risk_level)
    }
}

/// Another vehicle as seen from the deciding vehicle. `distance` (m) is the gap along the track,
/// always positive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurroundingVehicle {
    pub id: u32,
    pub speed: f64,
    pub distance: f64,
}

/// Vehicles around the deciding vehicle, each list ranked by distance (closest first).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Surroundings {
    pub ahead: Vec<SurroundingVehicle>,
    pub behind: Vec<SurroundingVehicle>,
    pub nearby: Vec<SurroundingVehicle>,
}

/// * `current_lap` - Lap currently driven (1-based)
/// * `total_laps` - Race distance in laps
/// * `elapsed` - (s) Race time
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RaceProgress {
    pub current_lap: u32,
    pub total_laps: u32,
    pub elapsed: f64,
}

impl RaceProgress {
    /// laps_remaining returns the number of laps still to be driven including the current one.
    pub fn laps_remaining(&self) -> u32 {
        (self.total_laps + 1).saturating_sub(self.current_lap)
    }
}

/// Obstacle detected on the current or the next segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hazard {
    pub segment: usize,
    pub severity: f64,
    pub distance: f64,
}

/// Immutable snapshot of everything a policy may look at.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionContext {
    pub vehicle: Vehicle,
    pub surroundings: Surroundings,
    pub segment: TrackSegment,
    pub next_segment_heading: f64,
    pub lap_length: f64,
    pub weather: Weather,
    pub progress: RaceProgress,
    pub hazards: Vec<Hazard>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("invalid decision context: {0}")]
    InvalidContext(String),
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_consult_interval() -> f64 {
    2.0
}

/// Policy selection in the vehicle parameters.
/// * `Heuristic` - Local deterministic heuristic
/// * `Remote` - Decisions requested from the named provider, `timeout_ms` per request, cached
/// decisions reused for at most `consult_interval` seconds of race time
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyPars {
    Heuristic,
    Remote {
        provider: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_consult_interval")]
        consult_interval: f64,
    },
}

impl Default for PolicyPars {
    fn default() -> Self {
        PolicyPars::Heuristic
    }
}

/// The decision policies a vehicle can be driven by.
#[derive(Debug)]
pub enum Policy {
    Heuristic(HeuristicPolicy),
    Remote(RemotePolicy),
}

impl Policy {
    pub fn decide(&mut self, ctx: &DecisionContext) -> Result<StrategyDecision, PolicyError> {
        match self {
            Policy::Heuristic(policy) => policy.decide(ctx),
            Policy::Remote(policy) => policy.decide(ctx),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Heuristic(_) => "heuristic",
            Policy::Remote(_) => "remote",
        }
    }
}
