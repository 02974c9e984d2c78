use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Straight,
    Corner,
    Chicane,
    Hairpin,
}

impl SegmentKind {
    /// is_corner_like returns true for segments that require steering through a single bend.
    pub fn is_corner_like(&self) -> bool {
        matches!(self, SegmentKind::Corner | SegmentKind::Hairpin)
    }

    /// default_corner_radius returns the radius (m) assumed if a segment does not specify one.
    pub fn default_corner_radius(&self) -> Option<f64> {
        match self {
            SegmentKind::Straight => None,
            SegmentKind::Corner => Some(80.0),
            SegmentKind::Chicane => Some(40.0),
            SegmentKind::Hairpin => Some(20.0),
        }
    }
}

fn default_grip() -> f64 {
    1.0
}

/// * `id` - Segment identifier
/// * `start` - (m) Start coordinates [x, y]
/// * `end` - (m) End coordinates [x, y]
/// * `length` - (m) Driven length, if not set the straight-line distance between start and end is
/// used
/// * `kind` - Segment type (straight, corner, chicane, hairpin)
/// * `grip` - Grip level of the surface in [0.0, 1.0]
/// * `corner_radius` - (m) Corner radius, kind-specific default if not set
/// * `altitude` - (m) Altitude above sea level
/// * `banking` - (deg) Banking angle
/// * `hazard_level` - Hazard level in [0.0, 1.0]
/// * `drag_multiplier`, `grip_multiplier`, `energy_multiplier` - Optional segment specific factors
#[derive(Debug, Deserialize, Clone)]
pub struct SegmentPars {
    pub id: u32,
    pub start: [f64; 2],
    pub end: [f64; 2],
    #[serde(default)]
    pub length: Option<f64>,
    pub kind: SegmentKind,
    #[serde(default = "default_grip")]
    pub grip: f64,
    #[serde(default)]
    pub corner_radius: Option<f64>,
    #[serde(default)]
    pub altitude: f64,
    #[serde(default)]
    pub banking: f64,
    #[serde(default)]
    pub hazard_level: f64,
    #[serde(default)]
    pub drag_multiplier: Option<f64>,
    #[serde(default)]
    pub grip_multiplier: Option<f64>,
    #[serde(default)]
    pub energy_multiplier: Option<f64>,
}

fn default_pit_duration() -> f64 {
    20.0
}

/// * `name` - Track name
/// * `segments` - Ordered list of segments, index 0 starts at the finish line
/// * `pit_entry_segment` - Index of the segment on which cars may enter the pits (last segment if
/// not set)
/// * `pit_duration` - (s) Fixed time a car spends in the pits
#[derive(Debug, Deserialize, Clone)]
pub struct TrackPars {
    pub name: String,
    pub segments: Vec<SegmentPars>,
    #[serde(default)]
    pub pit_entry_segment: Option<usize>,
    #[serde(default = "default_pit_duration")]
    pub pit_duration: f64,
}

/// Transient obstacle lying on a segment.
///
/// * `severity` - Fraction of speed lost on contact in [0.0, 1.0]
/// * `appeared_at` - (s) Race time the obstacle appeared
/// * `expires_at` - (s) Race time the obstacle is removed if nobody consumed it
/// * `hit_by` - Vehicles that already hit the obstacle (only relevant for per-vehicle obstacles)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObstacleMarker {
    pub severity: f64,
    pub appeared_at: f64,
    pub expires_at: f64,
    pub hit_by: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackSegment {
    pub id: u32,
    pub start: [f64; 2],
    pub end: [f64; 2],
    pub length: f64,
    pub kind: SegmentKind,
    pub grip: f64,
    pub corner_radius: Option<f64>,
    pub altitude: f64,
    pub banking: f64,
    pub hazard_level: f64,
    pub drag_multiplier: Option<f64>,
    pub grip_multiplier: Option<f64>,
    pub energy_multiplier: Option<f64>,
    pub obstacle: Option<ObstacleMarker>,
}

impl TrackSegment {
    pub fn new(segment_pars: &SegmentPars) -> TrackSegment {
        let dx = segment_pars.end[0] - segment_pars.start[0];
        let dy = segment_pars.end[1] - segment_pars.start[1];

        TrackSegment {
            id: segment_pars.id,
            start: segment_pars.start,
            end: segment_pars.end,
            length: segment_pars
                .length
                .unwrap_or_else(|| (dx * dx + dy * dy).sqrt()),
            kind: segment_pars.kind,
            grip: segment_pars.grip.clamp(0.0, 1.0),
            corner_radius: segment_pars.corner_radius,
            altitude: segment_pars.altitude,
            banking: segment_pars.banking,
            hazard_level: segment_pars.hazard_level.clamp(0.0, 1.0),
            drag_multiplier: segment_pars.drag_multiplier,
            grip_multiplier: segment_pars.grip_multiplier,
            energy_multiplier: segment_pars.energy_multiplier,
            obstacle: None,
        }
    }

    /// heading returns the direction (rad) from the segment start to its end.
    pub fn heading(&self) -> f64 {
        (self.end[1] - self.start[1]).atan2(self.end[0] - self.start[0])
    }

    /// effective_corner_radius returns the radius used for grip-limited speeds, `None` on
    /// straights.
    pub fn effective_corner_radius(&self) -> Option<f64> {
        match self.kind {
            SegmentKind::Straight => None,
            kind => self.corner_radius.or_else(|| kind.default_corner_radius()),
        }
    }

    /// point_at returns the interpolated 2D position for a progress fraction within the segment.
    pub fn point_at(&self, progress: f64) -> [f64; 2] {
        [
            self.start[0] + (self.end[0] - self.start[0]) * progress,
            self.start[1] + (self.end[1] - self.start[1]) * progress,
        ]
    }

    pub fn drag_factor(&self) -> f64 {
        self.drag_multiplier.unwrap_or(1.0)
    }

    pub fn grip_factor(&self) -> f64 {
        self.grip_multiplier.unwrap_or(1.0)
    }

    pub fn energy_factor(&self) -> f64 {
        self.energy_multiplier.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub name: String,
    pub segments: Vec<TrackSegment>,
    pub pit_entry_segment: usize,
    pub pit_duration: f64,
    seg_offsets: Vec<f64>,
    lap_length: f64,
}

impl Track {
    pub fn new(track_pars: &TrackPars) -> Track {
        let segments: Vec<TrackSegment> = track_pars.segments.iter().map(TrackSegment::new).collect();

        // cumulated distance from the finish line to the start of each segment
        let mut seg_offsets = Vec::with_capacity(segments.len());
        let mut lap_length = 0.0;

        for segment in segments.iter() {
            seg_offsets.push(lap_length);
            lap_length += segment.length;
        }

        let last_idx = segments.len().saturating_sub(1);
        let pit_entry_segment = match track_pars.pit_entry_segment {
            Some(idx) if idx <= last_idx => idx,
            Some(idx) => {
                log::warn!(
                    "Pit entry segment {} is not part of track {}, using segment {} instead",
                    idx,
                    track_pars.name,
                    last_idx
                );
                last_idx
            }
            None => last_idx,
        };

        Track {
            name: track_pars.name.to_owned(),
            segments,
            pit_entry_segment,
            pit_duration: track_pars.pit_duration,
            seg_offsets,
            lap_length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, idx: usize) -> Option<&TrackSegment> {
        self.segments.get(idx)
    }

    pub fn lap_length(&self) -> f64 {
        self.lap_length
    }

    pub fn next_segment_idx(&self, idx: usize) -> usize {
        if self.segments.is_empty() {
            0
        } else {
            (idx + 1) % self.segments.len()
        }
    }

    /// distance_at returns the distance (m) from the finish line for a position on the track.
    pub fn distance_at(&self, segment_idx: usize, progress: f64) -> f64 {
        match (self.seg_offsets.get(segment_idx), self.segments.get(segment_idx)) {
            (Some(offset), Some(segment)) => offset + progress * segment.length,
            _ => 0.0,
        }
    }

    /// locate returns segment index and progress fraction of the position the given distance (m)
    /// past the finish line. Distances beyond one lap wrap around.
    pub fn locate(&self, distance: f64) -> (usize, f64) {
        if !(self.lap_length > 0.0) || !distance.is_finite() {
            return (0, 0.0);
        }
        let distance = distance.rem_euclid(self.lap_length);

        for (idx, segment) in self.segments.iter().enumerate() {
            let offset = self.seg_offsets[idx];
            if segment.length > 0.0 && distance < offset + segment.length {
                return (idx, (distance - offset) / segment.length);
            }
        }
        (0, 0.0)
    }

    /// race_distance returns the total distance (m) covered since the race start.
    pub fn race_distance(&self, compl_laps: u32, segment_idx: usize, progress: f64) -> f64 {
        compl_laps as f64 * self.lap_length + self.distance_at(segment_idx, progress)
    }

    /// place_obstacle attaches an obstacle marker to a segment. An existing marker is replaced.
    pub fn place_obstacle(&mut self, segment_idx: usize, marker: ObstacleMarker) -> bool {
        match self.segments.get_mut(segment_idx) {
            Some(segment) => {
                segment.obstacle = Some(marker);
                true
            }
            None => false,
        }
    }

    /// expire_obstacles removes all obstacle markers that have outlived their lifetime.
    pub fn expire_obstacles(&mut self, racetime: f64) {
        for segment in self.segments.iter_mut() {
            if segment
                .obstacle
                .as_ref()
                .map_or(false, |obstacle| obstacle.expires_at <= racetime)
            {
                log::debug!("Obstacle on segment {} expired", segment.id);
                segment.obstacle = None;
            }
        }
    }

    pub fn clear_obstacles(&mut self) {
        for segment in self.segments.iter_mut() {
            segment.obstacle = None;
        }
    }
}
