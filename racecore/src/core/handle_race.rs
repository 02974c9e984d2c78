use crate::core::race::{Race, RaceStatus};
use crate::core::strategy::remote::ProviderRegistry;
use crate::interfaces::snapshot_interface::{RaceSnapshot, MAX_SNAPSHOT_FREQUENCY};
use crate::post::race_result::RaceResult;
use crate::pre::read_sim_pars::SimPars;
use flume::Sender;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// (s) Wall time between two iterations of the real-time loop.
const FRAME_DURATION: Duration = Duration::from_millis(10);

/// handle_race creates and simulates a race on the basis of the inserted parameters, and returns
/// the results for post-processing.
///
/// Without a sender the race is simulated headless as fast as possible. With a sender it is
/// simulated in real-time (scaled by the speed multiplier) and snapshots are sent at most with
/// `MAX_SNAPSHOT_FREQUENCY` in race time, plus the final one. In both modes the race is aborted
/// once `max_racetime` (s) of race time has passed.
pub fn handle_race(
    sim_pars: &SimPars,
    providers: &ProviderRegistry,
    timestep_size: f64,
    print_debug: bool,
    tx: Option<&Sender<RaceSnapshot>>,
    speed_multiplier: f64,
    max_racetime: Option<f64>,
) -> anyhow::Result<RaceResult> {
    if !(timestep_size > 0.0) {
        anyhow::bail!("Timestep size must be positive, got {}!", timestep_size);
    }

    let mut race = Race::new(
        &sim_pars.race_pars,
        &sim_pars.track_pars,
        &sim_pars.vehicle_pars_all,
        providers,
        timestep_size,
    );

    if !race.start() {
        anyhow::bail!("Race on {} could not be started!", sim_pars.track_pars.name);
    }

    let exceeded = |race: &Race| max_racetime.map_or(false, |t_max| race.cur_racetime() >= t_max);

    match tx {
        None => {
            let mut t_race_update_print = 0.0;

            while race.status() == RaceStatus::Running && !exceeded(&race) {
                race.tick(timestep_size);

                if print_debug && race.cur_racetime() > t_race_update_print + 9.9999 {
                    log::debug!(
                        "Simulating... Current race time is {:.3}s, leader is in lap {}",
                        race.cur_racetime(),
                        race.world.leader_lap() + 1
                    );
                    t_race_update_print = race.cur_racetime();
                }
            }
        }
        Some(tx) => {
            // snapshots are forwarded with a limited frequency, the final one always
            let tx_snapshots = tx.clone();
            let mut t_race_update_snapshot = f64::NEG_INFINITY;
            race.set_snapshot_callback(move |snapshot| {
                if snapshot.is_final()
                    || snapshot.elapsed > t_race_update_snapshot + 1.0 / MAX_SNAPSHOT_FREQUENCY - 0.001
                {
                    t_race_update_snapshot = snapshot.elapsed;
                    if tx_snapshots.send(snapshot).is_err() {
                        log::trace!("Snapshot receiver disconnected");
                    }
                }
            });
            race.set_speed_multiplier(speed_multiplier);

            let mut t_last = Instant::now();
            while race.status() == RaceStatus::Running && !exceeded(&race) {
                let t_start = Instant::now();
                race.advance(t_start.duration_since(t_last).as_secs_f64());
                t_last = t_start;

                if tx.is_disconnected() {
                    log::warn!("Snapshot receiver disconnected, stopping the race");
                    race.stop();
                    break;
                }

                // sleep until the frame is finished in real-time as well
                match FRAME_DURATION.checked_sub(t_start.elapsed()) {
                    Some(t_sleep) => sleep(t_sleep),
                    None => log::debug!("Could not keep up with real-time!"),
                }
            }

            race.clear_snapshot_callback();
            if race.status() != RaceStatus::Finished && !tx.is_disconnected() {
                // the unfinished race still gets a last snapshot
                tx.send(race.snapshot()).ok();
            }
        }
    }

    if race.status() != RaceStatus::Finished {
        log::warn!(
            "Race was stopped after {:.3}s before the leader completed {} laps",
            race.cur_racetime(),
            race.tot_no_laps
        );
        race.stop();
    }

    Ok(race.race_result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::race::tests::race_pars;
    use crate::core::track::tests::{segment_pars, track_pars};
    use crate::core::track::SegmentKind;
    use crate::core::vehicle::tests::vehicle_pars;

    fn sim_pars(no_vehicles: u32) -> SimPars {
        SimPars {
            race_pars: race_pars(2),
            track_pars: track_pars(vec![
                segment_pars(0, SegmentKind::Straight, 300.0),
                segment_pars(1, SegmentKind::Corner, 100.0),
            ]),
            vehicle_pars_all: (1..=no_vehicles).map(vehicle_pars).collect(),
        }
    }

    #[test]
    fn headless_race_runs_to_the_finish() {
        let result =
            handle_race(&sim_pars(3), &ProviderRegistry::new(), 0.1, false, None, 1.0, None)
                .unwrap();

        assert!(result.finished);
        assert_eq!(result.classification.len(), 3);
        assert_eq!(result.classification[0].laps, 2);
        assert_eq!(result.classification[0].position, 1);
    }

    #[test]
    fn maximum_racetime_aborts_the_race() {
        let result = handle_race(
            &sim_pars(1),
            &ProviderRegistry::new(),
            0.1,
            false,
            None,
            1.0,
            Some(5.0),
        )
        .unwrap();

        assert!(!result.finished);
        assert!(result.elapsed >= 5.0 && result.elapsed < 5.2);
    }

    #[test]
    fn empty_roster_cannot_be_raced() {
        assert!(
            handle_race(&sim_pars(0), &ProviderRegistry::new(), 0.1, false, None, 1.0, None)
                .is_err()
        );
    }

    #[test]
    fn realtime_race_streams_snapshots() {
        let (tx, rx) = flume::unbounded();
        let result = handle_race(
            &sim_pars(1),
            &ProviderRegistry::new(),
            0.1,
            false,
            Some(&tx),
            10.0,
            Some(1.0),
        )
        .unwrap();
        drop(tx);

        let snapshots: Vec<RaceSnapshot> = rx.drain().collect();
        assert!(!result.finished);
        assert!(!snapshots.is_empty());
        assert!(snapshots.windows(2).all(|w| w[0].tick <= w[1].tick));
    }
}
