use super::error::EngineError;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

/// Where a rank spends its wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Setup,
    Neighbor,
    Force,
    Mesh,
    Communication,
    Update,
    Output,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Setup,
        Stage::Neighbor,
        Stage::Force,
        Stage::Mesh,
        Stage::Communication,
        Stage::Update,
        Stage::Output,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Neighbor => "neighbor search",
            Self::Force => "force",
            Self::Mesh => "long-range mesh",
            Self::Communication => "communication",
            Self::Update => "update",
            Self::Output => "output",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRow {
    pub stage: &'static str,
    pub seconds: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountingSummary {
    pub wall: Duration,
    pub steps: u64,
    /// Simulated nanoseconds per day of wall time; only for dynamics.
    pub ns_per_day: Option<f64>,
    pub stages: Vec<StageRow>,
}

/// Wall-time accounting of one rank.
#[derive(Debug, Clone)]
pub struct Accounting {
    totals: [Duration; Stage::ALL.len()],
    steps: u64,
    started: Instant,
    /// Time step in ps; zero when steps are not simulated time.
    dt: f64,
}

impl Accounting {
    pub fn new(dt: f64) -> Self {
        Self {
            totals: [Duration::ZERO; Stage::ALL.len()],
            steps: 0,
            started: Instant::now(),
            dt,
        }
    }

    pub fn add(&mut self, stage: Stage, elapsed: Duration) {
        self.totals[stage.index()] += elapsed;
    }

    pub fn time<T>(&mut self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.add(stage, start.elapsed());
        result
    }

    pub fn count_step(&mut self) {
        self.steps += 1;
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn stage_total(&self, stage: Stage) -> Duration {
        self.totals[stage.index()]
    }

    /// Restarts all counters, so that the summary excludes start-up effects.
    pub fn reset(&mut self, step: i64) {
        info!(step, "Resetting the performance counters.");
        self.totals = [Duration::ZERO; Stage::ALL.len()];
        self.steps = 0;
        self.started = Instant::now();
    }

    pub fn summary(&self) -> AccountingSummary {
        let wall = self.started.elapsed();
        let wall_s = wall.as_secs_f64();
        let stages = Stage::ALL
            .iter()
            .map(|&stage| {
                let seconds = self.totals[stage.index()].as_secs_f64();
                StageRow {
                    stage: stage.name(),
                    seconds,
                    percent: if wall_s > 0.0 { 100.0 * seconds / wall_s } else { 0.0 },
                }
            })
            .collect();
        let ns_per_day = (self.dt > 0.0 && self.steps > 0 && wall_s > 0.0)
            .then(|| self.steps as f64 * self.dt * 1e-3 * 86_400.0 / wall_s);
        AccountingSummary {
            wall,
            steps: self.steps,
            ns_per_day,
            stages,
        }
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        for row in summary.stages.iter().filter(|r| r.seconds > 0.0) {
            info!(stage = row.stage, seconds = row.seconds, percent = row.percent, "Stage time.");
        }
        info!(
            wall_seconds = summary.wall.as_secs_f64(),
            steps = summary.steps,
            ns_per_day = summary.ns_per_day.unwrap_or(0.0),
            "Performance."
        );
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), EngineError> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in self.summary().stages {
            writer.serialize(row)?;
        }
        writer.flush().map_err(|e| EngineError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_times_accumulate_and_reset() {
        let mut accounting = Accounting::new(0.002);
        accounting.add(Stage::Force, Duration::from_millis(30));
        accounting.add(Stage::Force, Duration::from_millis(20));
        accounting.count_step();
        assert_eq!(accounting.stage_total(Stage::Force), Duration::from_millis(50));
        assert_eq!(accounting.steps(), 1);

        accounting.reset(10);
        assert_eq!(accounting.stage_total(Stage::Force), Duration::ZERO);
        assert_eq!(accounting.steps(), 0);
    }

    #[test]
    fn minimization_has_no_simulated_time() {
        let mut accounting = Accounting::new(0.0);
        accounting.count_step();
        std::thread::sleep(Duration::from_millis(2));
        assert!(accounting.summary().ns_per_day.is_none());
    }

    #[test]
    fn csv_export_has_one_row_per_stage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounting.csv");
        let mut accounting = Accounting::new(0.002);
        accounting.time(Stage::Update, || std::thread::sleep(Duration::from_millis(1)));
        accounting.write_csv(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, ["stage", "seconds", "percent"]);
        let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), Stage::ALL.len());
        assert_eq!(&rows[5][0], "update");
    }
}
