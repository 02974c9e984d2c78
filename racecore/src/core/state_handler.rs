use crate::core::track::Track;
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    OnTrack,
    PitStandstill,
}

/// StateHandler tracks the progress of a single vehicle on the track (segment, fraction of the
/// segment, completed laps) and its pit state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateHandler {
    // progress on the track
    cur_segment: usize,
    seg_progress: f64,
    // race progress
    compl_lap_prev: u32,
    compl_lap_cur: u32,
    t_lap_start: f64,
    // state machine
    state: State,
    t_pit_remaining: f64,
    pub pit_requested: bool,
}

impl StateHandler {
    /// initialize_state_handler puts the vehicle on the given segment with the given progress
    /// fraction and resets all counters. No lap is counted for the start position.
    pub fn initialize_state_handler(&mut self, start_segment: usize, start_progress: f64) {
        *self = StateHandler {
            cur_segment: start_segment,
            seg_progress: start_progress.clamp(0.0, 1.0 - f64::EPSILON),
            ..StateHandler::default()
        };
    }

    pub fn get_cur_segment(&self) -> usize {
        self.cur_segment
    }

    /// get_seg_progress returns the progress within the current segment in [0.0, 1.0[.
    pub fn get_seg_progress(&self) -> f64 {
        self.seg_progress
    }

    /// get_compl_lap returns the number of completed laps.
    pub fn get_compl_lap(&self) -> u32 {
        self.compl_lap_cur
    }

    /// get_new_lap returns true if a new lap was started in the last progress update.
    pub fn get_new_lap(&self) -> bool {
        self.compl_lap_cur > self.compl_lap_prev
    }

    pub fn is_pitting(&self) -> bool {
        matches!(self.state, State::PitStandstill)
    }

    pub fn get_t_pit_remaining(&self) -> f64 {
        self.t_pit_remaining
    }

    /// race_distance returns the total distance (m) covered since the race start.
    pub fn race_distance(&self, track: &Track) -> f64 {
        track.race_distance(self.compl_lap_cur, self.cur_segment, self.seg_progress)
    }

    /// update_race_prog moves the vehicle forward by `distance` meters. The segment index wraps
    /// modulo the number of segments and the lap counter increments when the vehicle wraps into
    /// segment 0. Returns the distance driven after the last crossing of the finish line, if the
    /// line was crossed in this step.
    pub fn update_race_prog(&mut self, distance: f64, track: &Track) -> Option<f64> {
        self.compl_lap_prev = self.compl_lap_cur;

        if track.is_empty() || !(track.lap_length() > 0.0) || !(distance > 0.0) {
            return None;
        }

        let mut seg_length = track.segments[self.cur_segment].length;
        let mut remaining = self.seg_progress * seg_length + distance;
        let mut dist_after_line = None;

        while remaining >= seg_length {
            remaining -= seg_length;
            self.cur_segment = track.next_segment_idx(self.cur_segment);

            if self.cur_segment == 0 {
                self.compl_lap_cur += 1;
                dist_after_line = Some(remaining);
            }

            seg_length = track.segments[self.cur_segment].length;
        }

        self.seg_progress = if seg_length > 0.0 {
            (remaining / seg_length).clamp(0.0, 1.0 - f64::EPSILON)
        } else {
            0.0
        };

        dist_after_line
    }

    /// register_lap closes the current lap at the given race time and returns its lap time.
    pub fn register_lap(&mut self, t_line: f64) -> f64 {
        let laptime = t_line - self.t_lap_start;
        self.t_lap_start = t_line;
        laptime
    }

    /// enter_pit activates the pit standstill state for the given duration.
    pub fn enter_pit(&mut self, t_standstill: f64) {
        self.state = State::PitStandstill;
        self.t_pit_remaining = t_standstill.max(0.0);
        self.pit_requested = false;
    }

    /// update_pit decrements the remaining standstill time. Returns true if the standstill ended
    /// in this step.
    pub fn update_pit(&mut self, timestep_size: f64) -> bool {
        if !self.is_pitting() {
            return false;
        }

        self.t_pit_remaining -= timestep_size;

        if self.t_pit_remaining <= 1e-9 {
            self.state = State::OnTrack;
            self.t_pit_remaining = 0.0;
            true
        } else {
            false
        }
    }
}

impl Default for StateHandler {
    fn default() -> Self {
        StateHandler {
            cur_segment: 0,
            seg_progress: 0.0,
            compl_lap_prev: 0,
            compl_lap_cur: 0,
            t_lap_start: 0.0,
            state: State::OnTrack,
            t_pit_remaining: 0.0,
            pit_requested: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::track::tests::{segment_pars, track_pars};
    use crate::core::track::SegmentKind;
    use approx::assert_relative_eq;

    fn three_segment_track() -> Track {
        Track::new(&track_pars(vec![
            segment_pars(0, SegmentKind::Straight, 100.0),
            segment_pars(1, SegmentKind::Corner, 50.0),
            segment_pars(2, SegmentKind::Straight, 50.0),
        ]))
    }

    #[test]
    fn progress_wraps_segments_and_counts_laps_once() {
        let track = three_segment_track();
        let mut sh = StateHandler::default();

        assert_eq!(sh.update_race_prog(120.0, &track), None);
        assert_eq!(sh.get_cur_segment(), 1);
        assert_relative_eq!(sh.get_seg_progress(), 0.4);
        assert_eq!(sh.get_compl_lap(), 0);

        let after_line = sh.update_race_prog(100.0, &track);
        assert_eq!(sh.get_cur_segment(), 0);
        assert_eq!(sh.get_compl_lap(), 1);
        assert!(sh.get_new_lap());
        assert_relative_eq!(after_line.unwrap_or(-1.0), 20.0, epsilon = 1e-9);
        assert_relative_eq!(sh.race_distance(&track), 220.0, epsilon = 1e-9);

        sh.update_race_prog(10.0, &track);
        assert!(!sh.get_new_lap());
    }

    #[test]
    fn single_segment_track_counts_every_wrap() {
        let track = Track::new(&track_pars(vec![segment_pars(0, SegmentKind::Straight, 1000.0)]));
        let mut sh = StateHandler::default();

        for _ in 0..10 {
            sh.update_race_prog(250.0, &track);
        }
        assert_eq!(sh.get_compl_lap(), 2);
        assert_eq!(sh.get_cur_segment(), 0);
        assert!(sh.get_seg_progress() < 1.0);
    }

    #[test]
    fn pit_standstill_counts_down() {
        let mut sh = StateHandler::default();
        sh.pit_requested = true;
        sh.enter_pit(0.25);

        assert!(sh.is_pitting());
        assert!(!sh.pit_requested);
        assert!(!sh.update_pit(0.1));
        assert!(!sh.update_pit(0.1));
        assert!(sh.update_pit(0.1));
        assert!(!sh.is_pitting());
        assert!(!sh.update_pit(0.1));
    }

    #[test]
    fn lap_times_are_measured_between_line_crossings() {
        let mut sh = StateHandler::default();
        assert_relative_eq!(sh.register_lap(61.5), 61.5);
        assert_relative_eq!(sh.register_lap(120.0), 58.5);
    }
}
