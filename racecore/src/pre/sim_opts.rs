use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(
    version = "0.1.0",
    name = "racecore",
    about = "A time-discrete multi-vehicle race simulation with pluggable decision policies"
)]
pub struct SimOpts {
    // FLAGS ---------------------------------------------------------------------------------------
    /// Activate debug logging
    #[clap(short, long)]
    pub debug: bool,

    /// Activate real-time mode - the race is simulated in real-time and snapshots are printed
    #[clap(short, long)]
    pub realtime: bool,

    // OPTIONS -------------------------------------------------------------------------------------
    /// Set path to the simulation parameter file
    #[clap(short, long)]
    pub parfile_path: PathBuf,

    /// Set number of simulation runs (only for headless mode, ignored in real-time mode)
    #[clap(short, long, default_value = "1")]
    pub no_sim_runs: u32,

    /// Set ratio of simulated to wall time in real-time mode, clamped to [0.1, 10.0]
    #[clap(short, long, default_value = "1.0")]
    pub speed_multiplier: f64,

    /// Set simulation timestep size in seconds, should be in the range [0.001, 1.0]
    #[clap(short, long, default_value = "0.1")]
    pub timestep_size: f64,

    /// Set random seed of the first run, run i uses seed + i (overrides the parameter file)
    #[clap(long)]
    pub seed: Option<u64>,

    /// Set path of a CSV file the result of the first run is written to
    #[clap(short, long)]
    pub csv_path: Option<PathBuf>,

    /// Set maximum simulated race time in seconds after which an unfinished race is aborted
    #[clap(short, long)]
    pub max_racetime: Option<f64>,
}
