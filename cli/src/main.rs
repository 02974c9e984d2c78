use anyhow::Context;
use clap::Parser;
use racecore::core::handle_race::handle_race;
use racecore::core::strategy::remote::{ChannelProvider, DecisionRequest, ProviderRegistry};
use racecore::core::track::SegmentKind;
use racecore::interfaces::snapshot_interface::RaceSnapshot;
use racecore::pre::read_sim_pars::{read_sim_pars, SimPars};
use racecore::pre::sim_opts::SimOpts;
use rayon::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// coach answers decision requests of vehicles configured with the remote provider "coach". It
/// pushes harder than the local heuristic on straights and pits early on worn tires.
fn coach(request: &DecisionRequest) -> Result<Value, String> {
    let speed_frac = if request.max_speed > 0.0 {
        request.speed / request.max_speed
    } else {
        return Err(format!("vehicle {} has no top speed", request.vehicle_id));
    };

    let (throttle, braking) = match request.segment.kind {
        SegmentKind::Straight => (1.0, 0.0),
        SegmentKind::Chicane => (0.6, 0.0),
        SegmentKind::Corner if speed_frac > 0.6 => (0.0, 0.4),
        SegmentKind::Hairpin if speed_frac > 0.35 => (0.0, 0.8),
        _ => (0.4, 0.0),
    };
    let closing_in = request
        .ahead
        .first()
        .map_or(false, |a| a.distance < 20.0 && request.speed > a.speed + 5.0);
    let pit = if request.tire_wear > 0.8 || request.energy < 0.2 {
        "immediate"
    } else {
        "none"
    };

    Ok(json!({
        "throttle": throttle,
        "braking": braking,
        "riskLevel": if closing_in { 0.8 } else { 0.5 },
        "overtake": if closing_in { "attempt" } else { "none" },
        "pitStop": pit,
        "boost": closing_in && request.segment.kind == SegmentKind::Straight,
        "energyMode": if request.energy < 0.4 { "conservative" } else { "balanced" },
    }))
}

/// provider_registry creates the decision providers available to remote-backed vehicles. Every
/// race gets its own registry, such that parallel races do not share provider workers.
fn provider_registry() -> anyhow::Result<ProviderRegistry> {
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(
        ChannelProvider::spawn("coach", coach).context("Failed to start decision provider!")?,
    ));
    Ok(providers)
}

fn print_snapshot(snapshot: &RaceSnapshot) {
    let mut vehicles: Vec<_> = snapshot.vehicles.iter().collect();
    vehicles.sort_by_key(|v| v.position);

    let order: Vec<String> = vehicles
        .iter()
        .map(|v| {
            format!(
                "{}.#{} {:.0}km/h{}",
                v.position,
                v.id,
                v.speed,
                if v.pitting { " (pit)" } else { "" }
            )
        })
        .collect();

    println!(
        "{:8.2}s lap {:2}/{} {:?} | {}",
        snapshot.elapsed,
        (snapshot.leader_lap + 1).min(snapshot.tot_no_laps),
        snapshot.tot_no_laps,
        snapshot.weather.kind,
        order.join("  ")
    );
}

fn main() -> anyhow::Result<()> {
    // PRE-PROCESSING ------------------------------------------------------------------------------
    // get simulation options from the command line arguments
    let sim_opts: SimOpts = SimOpts::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if sim_opts.debug { "debug" } else { "info" },
    ))
    .init();

    if !(0.001..=1.0).contains(&sim_opts.timestep_size) {
        anyhow::bail!(
            "Timestep size {}s is not in the range [0.001, 1.0]!",
            sim_opts.timestep_size
        );
    }

    // get simulation parameters
    log::info!("Reading simulation parameters from {}", sim_opts.parfile_path.display());
    let mut sim_pars: SimPars = read_sim_pars(&sim_opts.parfile_path)?;
    if let Some(seed) = sim_opts.seed {
        sim_pars.race_pars.seed = Some(seed);
    }

    log::info!(
        "Simulating {} laps on {} with {} vehicles and a time step size of {:.3}s",
        sim_pars.race_pars.tot_no_laps,
        sim_pars.track_pars.name,
        sim_pars.vehicle_pars_all.len(),
        sim_opts.timestep_size
    );

    // EXECUTION -----------------------------------------------------------------------------------
    let race_result = if !sim_opts.realtime {
        // headless case, independent runs in parallel
        let t_start = Instant::now();
        let no_sim_runs = sim_opts.no_sim_runs.max(1);

        let results = (0..no_sim_runs)
            .into_par_iter()
            .map(|run| {
                let mut run_pars = sim_pars.clone();
                run_pars.race_pars.seed = sim_pars
                    .race_pars
                    .seed
                    .map(|seed| seed.wrapping_add(run as u64));

                handle_race(
                    &run_pars,
                    &provider_registry()?,
                    sim_opts.timestep_size,
                    sim_opts.debug,
                    None,
                    1.0,
                    sim_opts.max_racetime,
                )
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        log::info!(
            "Execution time of {} run(s): {}ms (average {:.3}ms per run)",
            no_sim_runs,
            t_start.elapsed().as_millis(),
            t_start.elapsed().as_secs_f64() * 1000.0 / no_sim_runs as f64
        );

        if results.len() > 1 {
            for result in results.iter() {
                if let Some(winner) = result.winner() {
                    log::info!(
                        "Seed {}: winner #{} {} after {:.3}s",
                        result.seed,
                        winner.vehicle_id,
                        winner.name,
                        winner.racetime
                    );
                }
            }
        }

        results
            .into_iter()
            .next()
            .context("Simulation did not return a result!")?
    } else {
        // real-time case, the race runs in its own thread and streams snapshots
        let (tx, rx) = flume::unbounded();
        let sim_opts_thread = sim_opts.clone();
        let sim_pars_thread = sim_pars.clone();

        let race_thread = thread::spawn(move || {
            handle_race(
                &sim_pars_thread,
                &provider_registry()?,
                sim_opts_thread.timestep_size,
                false,
                Some(&tx),
                sim_opts_thread.speed_multiplier,
                sim_opts_thread.max_racetime,
            )
        });

        // print about one snapshot per second of race time
        let mut t_last_print = f64::NEG_INFINITY;
        for snapshot in rx.iter() {
            if snapshot.is_final() || snapshot.elapsed >= t_last_print + 1.0 {
                print_snapshot(&snapshot);
                t_last_print = snapshot.elapsed;
            }
        }

        race_thread
            .join()
            .map_err(|_| anyhow::anyhow!("Race thread panicked!"))??
    };

    // POST-PROCESSING -----------------------------------------------------------------------------
    race_result.print_results()?;

    if let Some(csv_path) = &sim_opts.csv_path {
        race_result.write_csv(csv_path)?;
        log::info!("Result written to {}", csv_path.display());
    }

    Ok(())
}
