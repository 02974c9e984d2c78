use crate::core::agent::AgentMetrics;
use crate::core::events::EventKind;
use anyhow::Context;
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;

/// One line of the classification.
/// * `position` - Final position (1 = winner)
/// * `laps` - Number of completed laps
/// * `race_distance` - (m) Distance covered since the race start
/// * `racetime` - (s) Sum of the completed lap times
/// * `best_laptime` - (s) Best lap time, if a lap was completed
/// * `laptimes` - (s) Lap times in driven order
/// * `metrics` - Decision statistics of the agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationEntry {
    pub position: usize,
    pub vehicle_id: u32,
    pub name: String,
    pub laps: u32,
    pub race_distance: f64,
    pub racetime: f64,
    pub best_laptime: Option<f64>,
    pub laptimes: Vec<f64>,
    pub overtakes: u32,
    pub positions_lost: u32,
    pub metrics: AgentMetrics,
}

/// Delivered event as kept in the race log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceEvent {
    pub kind: EventKind,
    pub time_s: f64,
    /// Lap of the leader at the time of the event (1-based)
    pub lap: u32,
    pub vehicles: Vec<u32>,
}

/// RaceResult contains all race information that is required for post-processing the results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceResult {
    pub track_name: String,
    pub tot_no_laps: u32,
    pub seed: u64,
    pub finished: bool,
    pub elapsed: f64,
    pub classification: Vec<ClassificationEntry>,
    pub events: Vec<RaceEvent>,
}

impl RaceResult {
    /// max_no_laps returns the highest number of completed laps in the classification.
    fn max_no_laps(&self) -> usize {
        self.classification
            .iter()
            .map(|e| e.laptimes.len())
            .max()
            .unwrap_or(0)
    }

    /// winner returns the classification entry in first position.
    pub fn winner(&self) -> Option<&ClassificationEntry> {
        self.classification.first()
    }

    /// format_laptime_table returns the lap times as a table, one line per lap and one column per
    /// vehicle. Laps a vehicle did not complete are left empty.
    pub fn format_laptime_table(&self) -> anyhow::Result<String> {
        let mut table = String::from("lap");
        for entry in self.classification.iter() {
            write!(&mut table, ", {:>9}", format!("#{}", entry.vehicle_id))?;
        }
        writeln!(&mut table)?;

        for lap in 0..self.max_no_laps() {
            write!(&mut table, "{:3}", lap + 1)?;
            for entry in self.classification.iter() {
                match entry.laptimes.get(lap) {
                    Some(laptime) => write!(&mut table, ", {:8.3}s", laptime)?,
                    None => write!(&mut table, ", {:>9}", "")?,
                }
            }
            writeln!(&mut table)?;
        }

        Ok(table)
    }

    /// print_results prints the classification, the lap times and the event summary to the
    /// console output.
    pub fn print_results(&self) -> anyhow::Result<()> {
        println!(
            "RESULT: {} after {:.3}s ({} of {} laps{})",
            self.track_name,
            self.elapsed,
            self.classification.first().map_or(0, |e| e.laps),
            self.tot_no_laps,
            if self.finished { "" } else { ", not finished" }
        );

        println!("RESULT: Classification");
        for entry in self.classification.iter() {
            let best = entry
                .best_laptime
                .map_or_else(|| "-".to_owned(), |t| format!("{:.3}s", t));
            println!(
                "{:3}. #{:<3} {:<20} {:3} laps {:10.3}s  best {:>9}  overtakes {:2}  lost {:2}  \
                 decisions {:5} ({})",
                entry.position,
                entry.vehicle_id,
                entry.name,
                entry.laps,
                entry.racetime,
                best,
                entry.overtakes,
                entry.positions_lost,
                entry.metrics.total_decisions,
                entry.metrics.policy
            );
        }

        println!("RESULT: Lap times");
        println!("{}", self.format_laptime_table()?);

        if !self.events.is_empty() {
            println!("RESULT: Events");
            for event in self.events.iter() {
                println!(
                    "{:9.3}s lap {:3} {:?} {:?}",
                    event.time_s, event.lap, event.kind, event.vehicles
                );
            }
        }

        Ok(())
    }

    /// write_csv writes one line per vehicle with its classification and lap times.
    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create result file {}!", path.display()))?;

        let no_laps = self.max_no_laps();
        let mut header: Vec<String> = [
            "position",
            "vehicle_id",
            "name",
            "laps",
            "race_distance_m",
            "racetime_s",
            "best_laptime_s",
            "overtakes",
            "positions_lost",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        header.extend((1..=no_laps).map(|lap| format!("lap_{}", lap)));
        writer.write_record(&header)?;

        for entry in self.classification.iter() {
            let mut record = vec![
                entry.position.to_string(),
                entry.vehicle_id.to_string(),
                entry.name.to_owned(),
                entry.laps.to_string(),
                format!("{:.3}", entry.race_distance),
                format!("{:.3}", entry.racetime),
                entry
                    .best_laptime
                    .map_or_else(String::new, |t| format!("{:.3}", t)),
                entry.overtakes.to_string(),
                entry.positions_lost.to_string(),
            ];
            record.extend((0..no_laps).map(|lap| {
                entry
                    .laptimes
                    .get(lap)
                    .map_or_else(String::new, |t| format!("{:.3}", t))
            }));
            writer.write_record(&record)?;
        }

        writer
            .flush()
            .with_context(|| format!("Failed to write result file {}!", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(position: usize, vehicle_id: u32, laptimes: Vec<f64>) -> ClassificationEntry {
        ClassificationEntry {
            position,
            vehicle_id,
            name: format!("Vehicle {}", vehicle_id),
            laps: laptimes.len() as u32,
            race_distance: 1000.0 * laptimes.len() as f64,
            racetime: laptimes.iter().sum(),
            best_laptime: laptimes.iter().copied().reduce(f64::min),
            laptimes,
            overtakes: 0,
            positions_lost: 0,
            metrics: AgentMetrics {
                vehicle_id,
                policy: "heuristic",
                total_decisions: 10,
                mean_risk_level: 0.5,
                overtake_attempts: 0,
                pit_decisions: 0,
                boost_activations: 0,
                policy_failures: 0,
            },
        }
    }

    fn result() -> RaceResult {
        RaceResult {
            track_name: "Testring".to_owned(),
            tot_no_laps: 2,
            seed: 1,
            finished: true,
            elapsed: 50.0,
            classification: vec![entry(1, 2, vec![24.5, 23.9]), entry(2, 1, vec![25.1])],
            events: Vec::new(),
        }
    }

    #[test]
    fn laptime_table_leaves_missing_laps_empty() {
        let table = result().format_laptime_table().unwrap();
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("#2"));
        assert!(lines[1].contains("24.500s"));
        assert!(lines[1].contains("25.100s"));
        assert!(lines[2].contains("23.900s"));
        assert!(!lines[2].contains("25.100s"));
    }

    #[test]
    fn csv_has_one_column_per_lap() {
        let path = std::env::temp_dir().join(format!("racecore_result_{}.csv", std::process::id()));
        result().write_csv(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header = reader.headers().unwrap().clone();
        assert_eq!(header.len(), 11);
        assert_eq!(&header[10], "lap_2");

        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][1], "2");
        assert_eq!(&records[1][10], "");

        std::fs::remove_file(&path).unwrap();
    }
}
