use crate::core::events::{EventKind, Priority, SimEvent};
use crate::core::race::RaceStatus;
use crate::core::strategy::StrategyDecision;
use crate::core::tireset::TireCompound;
use crate::core::vehicle::VehicleClass;
use crate::core::weather::Weather;
use serde::Serialize;

/// (Hz) Maximum rate (in race time) at which snapshots are streamed to a consumer in real-time
/// mode.
pub const MAX_SNAPSHOT_FREQUENCY: f64 = 20.0;

/// Per-vehicle part of a snapshot.
/// * `position` - Position in the running order (1 = leader)
/// * `compl_laps` - Number of completed laps
/// * `segment` - Index of the current track segment
/// * `seg_progress` - Progress on the current segment in [0.0, 1.0)
/// * `race_distance` - (m) Distance covered since the race start
/// * `xy` - (m) Position in the track plane
/// * `heading` - (rad) Heading
/// * `speed` - (km/h) Speed
/// * `energy` - Energy level in [0.0, 1.0]
/// * `tire_wear` - Tire wear in [0.0, 1.0]
/// * `pit_remaining` - (s) Remaining pit standstill time, 0.0 on track
/// * `best_laptime` - (s) Best lap time, if a lap was completed
/// * `last_decision` - Last decision taken by the agent, if any
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleSummary {
    pub id: u32,
    pub name: String,
    pub class: VehicleClass,
    pub position: usize,
    pub compl_laps: u32,
    pub segment: usize,
    pub seg_progress: f64,
    pub race_distance: f64,
    pub xy: [f64; 2],
    pub heading: f64,
    pub speed: f64,
    pub energy: f64,
    pub tire_wear: f64,
    pub compound: TireCompound,
    pub pitting: bool,
    pub pit_remaining: f64,
    pub overtakes: u32,
    pub positions_lost: u32,
    pub best_laptime: Option<f64>,
    pub last_decision: Option<StrategyDecision>,
}

/// Queued event that was not delivered yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEvent {
    pub id: u64,
    pub kind: EventKind,
    pub timestamp: f64,
    pub target: Option<u32>,
    pub priority: Priority,
}

impl From<&SimEvent> for PendingEvent {
    fn from(event: &SimEvent) -> Self {
        PendingEvent {
            id: event.id,
            kind: event.kind,
            timestamp: event.timestamp,
            target: event.target,
            priority: event.priority,
        }
    }
}

/// RaceSnapshot is an owned, read-only projection of the race state after a tick. The tick counter
/// serves as timestamp, such that two runs with the same seed produce identical snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceSnapshot {
    pub tick: u64,
    pub elapsed: f64,
    pub status: RaceStatus,
    pub leader_lap: u32,
    pub tot_no_laps: u32,
    pub weather: Weather,
    pub vehicles: Vec<VehicleSummary>,
    pub pending_events: Vec<PendingEvent>,
}

impl RaceSnapshot {
    pub fn is_final(&self) -> bool {
        self.status == RaceStatus::Finished
    }

    pub fn vehicle(&self, id: u32) -> Option<&VehicleSummary> {
        self.vehicles.iter().find(|v| v.id == id)
    }

    /// leader returns the summary of the vehicle in first position.
    pub fn leader(&self) -> Option<&VehicleSummary> {
        self.vehicles.iter().find(|v| v.position == 1)
    }
}

/// Consumer of the snapshots emitted after every tick.
pub type SnapshotCallback = Box<dyn FnMut(RaceSnapshot) + Send>;
