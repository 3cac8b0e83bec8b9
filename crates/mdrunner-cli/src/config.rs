pub mod defaults;

use crate::cli::{AppendOutput, RunArgs};
use crate::error::{CliError, Result};
use defaults::DefaultsConfig;
use mdrunner::engine::config::{
    self as core_config, GpuPolicy, LongRangeRanks, RankOrder, RunRequest, RunRequestBuilder,
    StepOverride, TuningConstants,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialResourcesConfig {
    ranks: Option<usize>,
    threads: Option<usize>,
    threads_per_rank: Option<usize>,
    long_range_threads: Option<usize>,
    long_range_ranks: Option<i64>,
    decomposition_grid: Option<[usize; 3]>,
    rank_order: Option<String>,
    gpu: Option<String>,
    gpu_ids: Option<Vec<usize>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialRunSection {
    nsteps: Option<i64>,
    nstlist: Option<i32>,
    max_hours: Option<f64>,
    reproducible: Option<bool>,
    rerun: Option<PathBuf>,
    trajectory: Option<PathBuf>,
    matrix: Option<PathBuf>,
    accounting_csv: Option<PathBuf>,
    reset_step: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialCheckpointConfig {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    period_minutes: Option<f64>,
    append: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialTuningConfig {
    cpu_ok: Option<f64>,
    cpu_max: Option<f64>,
    wide_simd_ok: Option<f64>,
    wide_simd_max: Option<f64>,
    gpu_ok: Option<f64>,
    gpu_max: Option<f64>,
    reference_nstlist: Option<i32>,
    candidates: Option<Vec<i32>>,
}

impl PartialTuningConfig {
    fn merge(self) -> TuningConstants {
        let d = TuningConstants::default();
        TuningConstants {
            cpu_ok: self.cpu_ok.unwrap_or(d.cpu_ok),
            cpu_max: self.cpu_max.unwrap_or(d.cpu_max),
            wide_simd_ok: self.wide_simd_ok.unwrap_or(d.wide_simd_ok),
            wide_simd_max: self.wide_simd_max.unwrap_or(d.wide_simd_max),
            gpu_ok: self.gpu_ok.unwrap_or(d.gpu_ok),
            gpu_max: self.gpu_max.unwrap_or(d.gpu_max),
            reference_nstlist: self.reference_nstlist.unwrap_or(d.reference_nstlist),
            candidates: self.candidates.unwrap_or(d.candidates),
        }
    }
}

/// A run configuration file as written by the user; every field is optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRunConfig {
    resources: Option<PartialResourcesConfig>,
    run: Option<PartialRunSection>,
    checkpoint: Option<PartialCheckpointConfig>,
    tuning: Option<PartialTuningConfig>,
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid value for {}: {}", key, value)))
}

fn config_error(e: core_config::ConfigError) -> CliError {
    CliError::Config(e.to_string())
}

impl PartialRunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    /// Combines the file with `-S` overrides, command-line flags and built-in defaults,
    /// in decreasing precedence: flag, `-S`, file, default.
    pub fn merge_with_cli(mut self, args: &RunArgs, threads: Option<usize>) -> Result<RunRequest> {
        self.apply_set_values(&args.set_values)?;
        let defaults = DefaultsConfig::default();

        let resources = self.resources.take().unwrap_or_default();
        let run = self.run.take().unwrap_or_default();
        let checkpoint = self.checkpoint.take().unwrap_or_default();
        let tuning = self.tuning.take().unwrap_or_default().merge();

        let gpu_policy: GpuPolicy = args
            .gpu_policy
            .as_deref()
            .or(resources.gpu.as_deref())
            .unwrap_or(defaults.gpu_policy)
            .parse()
            .map_err(config_error)?;
        let rank_order: RankOrder = args
            .rank_order
            .as_deref()
            .or(resources.rank_order.as_deref())
            .unwrap_or(defaults.rank_order)
            .parse()
            .map_err(config_error)?;
        let long_range_ranks = LongRangeRanks::from_request(
            args.long_range_ranks
                .or(resources.long_range_ranks)
                .unwrap_or(defaults.long_range_ranks),
        )
        .map_err(config_error)?;

        let mut builder = RunRequestBuilder::new()
            .input_path(args.input.clone())
            .gpu_policy(gpu_policy)
            .rank_order(rank_order)
            .long_range_ranks(long_range_ranks)
            .reproducible(args.reproducible || run.reproducible.unwrap_or(false))
            .checkpoint_output(
                args.checkpoint_output
                    .clone()
                    .or(checkpoint.output)
                    .unwrap_or_else(|| PathBuf::from(defaults.checkpoint_output)),
            )
            .checkpoint_period_minutes(
                args.checkpoint_period
                    .or(checkpoint.period_minutes)
                    .unwrap_or(defaults.checkpoint_period_minutes),
            )
            .matrix_output(
                args.matrix
                    .clone()
                    .or(run.matrix)
                    .unwrap_or_else(|| PathBuf::from(defaults.matrix_output)),
            )
            .tuning(tuning);
        builder = Self::merge_append(builder, args.append, checkpoint.append, defaults.append);

        if let Some(n) = args.ranks.or(resources.ranks) {
            builder = builder.requested_ranks(n);
        }
        if let Some(n) = threads.or(resources.threads) {
            builder = builder.total_threads(n);
        }
        if let Some(n) = args.threads_per_rank.or(resources.threads_per_rank) {
            builder = builder.threads_per_rank(n);
        }
        if let Some(n) = args.long_range_threads.or(resources.long_range_threads) {
            builder = builder.long_range_threads(n);
        }
        let grid = Self::merge_grid(
            args.decomposition_grid.as_deref(),
            resources.decomposition_grid,
        )?;
        if let Some(grid) = grid {
            builder = builder.decomposition_grid(grid);
        }
        if let Some(ids) = args.gpu_ids.clone().or(resources.gpu_ids) {
            builder = builder.gpu_ids(ids);
        }
        if let Some(n) = args.nsteps.or(run.nsteps) {
            builder = builder.nsteps(StepOverride::try_from(n).map_err(config_error)?);
        }
        if let Some(n) = args.nstlist.or(run.nstlist) {
            builder = builder.nstlist_override(n);
        }
        if let Some(h) = args.max_hours.or(run.max_hours) {
            builder = builder.max_hours(h);
        }
        if let Some(path) = args.rerun.clone().or(run.rerun) {
            builder = builder.rerun(path);
        }
        if let Some(path) = args.trajectory.clone().or(run.trajectory) {
            builder = builder.trajectory_output(path);
        }
        if let Some(path) = args.accounting_csv.clone().or(run.accounting_csv) {
            builder = builder.accounting_csv(path);
        }
        if let Some(step) = args.reset_step.or(run.reset_step) {
            builder = builder.reset_counters_at(step);
        }
        if let Some(path) = args.checkpoint_input.clone().or(checkpoint.input) {
            builder = builder.checkpoint_input(path);
        }

        builder.build().map_err(config_error)
    }

    fn merge_append(
        builder: RunRequestBuilder,
        cli_flags: AppendOutput,
        file_val: Option<bool>,
        default: bool,
    ) -> RunRequestBuilder {
        if cli_flags.append {
            builder.append(true)
        } else if cli_flags.noappend {
            builder.append(false)
        } else {
            builder.append(file_val.unwrap_or(default))
        }
    }

    fn merge_grid(
        cli: Option<&[usize]>,
        file_val: Option<[usize; 3]>,
    ) -> Result<Option<[usize; 3]>> {
        match cli {
            Some(&[x, y, z]) => Ok(Some([x, y, z])),
            Some(other) => Err(CliError::Argument(format!(
                "--dd takes three cell counts, got {}",
                other.len()
            ))),
            None => Ok(file_val),
        }
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };

            match key {
                "resources.ranks" => {
                    self.resources.get_or_insert_with(Default::default).ranks =
                        Some(parse_value(key, value)?);
                }
                "resources.threads" => {
                    self.resources.get_or_insert_with(Default::default).threads =
                        Some(parse_value(key, value)?);
                }
                "resources.threads-per-rank" => {
                    self.resources.get_or_insert_with(Default::default).threads_per_rank =
                        Some(parse_value(key, value)?);
                }
                "resources.long-range-ranks" => {
                    self.resources.get_or_insert_with(Default::default).long_range_ranks =
                        Some(parse_value(key, value)?);
                }
                "resources.gpu" => {
                    self.resources.get_or_insert_with(Default::default).gpu = Some(value.to_string());
                }
                "resources.rank-order" => {
                    self.resources.get_or_insert_with(Default::default).rank_order =
                        Some(value.to_string());
                }
                "run.nsteps" => {
                    self.run.get_or_insert_with(Default::default).nsteps =
                        Some(parse_value(key, value)?);
                }
                "run.nstlist" => {
                    self.run.get_or_insert_with(Default::default).nstlist =
                        Some(parse_value(key, value)?);
                }
                "run.max-hours" => {
                    self.run.get_or_insert_with(Default::default).max_hours =
                        Some(parse_value(key, value)?);
                }
                "run.reproducible" => {
                    self.run.get_or_insert_with(Default::default).reproducible =
                        Some(parse_value(key, value)?);
                }
                "checkpoint.output" => {
                    self.checkpoint.get_or_insert_with(Default::default).output =
                        Some(PathBuf::from(value));
                }
                "checkpoint.period-minutes" => {
                    self.checkpoint.get_or_insert_with(Default::default).period_minutes =
                        Some(parse_value(key, value)?);
                }
                "checkpoint.append" => {
                    self.checkpoint.get_or_insert_with(Default::default).append =
                        Some(parse_value(key, value)?);
                }
                "tuning.reference-nstlist" => {
                    self.tuning.get_or_insert_with(Default::default).reference_nstlist =
                        Some(parse_value(key, value)?);
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use once_cell::sync::Lazy;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    static TEST_DIR: Lazy<TempDir> = Lazy::new(|| tempdir().expect("Failed to create temp dir"));

    fn write_config_file(name: &str, content: &str) -> PathBuf {
        let file_path = TEST_DIR.path().join(name);
        fs::write(&file_path, content).unwrap();
        file_path
    }

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut args = vec!["mdrunner", "run", "-s", "topol.tpr"];
        args.extend_from_slice(extra);
        match Cli::parse_from(args).command {
            Commands::Run(run) => run,
            _ => panic!("Expected 'run' subcommand"),
        }
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let request = PartialRunConfig::default()
            .merge_with_cli(&run_args(&[]), None)
            .unwrap();
        assert_eq!(request.input_path, PathBuf::from("topol.tpr"));
        assert_eq!(request.gpu_policy, GpuPolicy::Auto);
        assert_eq!(request.long_range_ranks, LongRangeRanks::Auto);
        assert_eq!(request.checkpoint_output, PathBuf::from("state.cpt"));
        assert_eq!(request.checkpoint_period_minutes, 15.0);
        assert!(request.append);
        assert_eq!(request.requested_ranks, None);
        assert_eq!(request.tuning, TuningConstants::default());
    }

    #[test]
    fn file_values_are_loaded() {
        let path = write_config_file(
            "file_values.toml",
            r#"
            [resources]
            ranks = 4
            long-range-ranks = 1
            gpu = "cpu"
            decomposition-grid = [3, 1, 1]

            [run]
            nsteps = 5000
            max-hours = 2.5

            [checkpoint]
            output = "restart.cpt"
            append = false

            [tuning]
            cpu-ok = 1.02
            candidates = [20, 40]
            "#,
        );
        let request = PartialRunConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&run_args(&[]), Some(8))
            .unwrap();
        assert_eq!(request.requested_ranks, Some(4));
        assert_eq!(request.total_threads, Some(8));
        assert_eq!(request.long_range_ranks, LongRangeRanks::Count(1));
        assert_eq!(request.gpu_policy, GpuPolicy::Disabled);
        assert_eq!(request.decomposition_grid, Some([3, 1, 1]));
        assert_eq!(request.nsteps, StepOverride::Steps(5000));
        assert_eq!(request.max_hours, Some(2.5));
        assert_eq!(request.checkpoint_output, PathBuf::from("restart.cpt"));
        assert!(!request.append);
        assert_eq!(request.tuning.cpu_ok, 1.02);
        assert_eq!(request.tuning.cpu_max, TuningConstants::default().cpu_max);
        assert_eq!(request.tuning.candidates, vec![20, 40]);
    }

    #[test]
    fn cli_flags_override_set_values_which_override_the_file() {
        let path = write_config_file(
            "precedence.toml",
            r#"
            [resources]
            ranks = 2

            [run]
            nsteps = 100
            nstlist = 20
            "#,
        );
        let args = run_args(&[
            "--ntmpi",
            "6",
            "-S",
            "resources.ranks=3",
            "-S",
            "run.nsteps=200",
            "--nb",
            "gpu",
            "--noappend",
            "--dd",
            "3",
            "2",
            "1",
        ]);
        let request = PartialRunConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&args, None)
            .unwrap();
        assert_eq!(request.requested_ranks, Some(6));
        assert_eq!(request.nsteps, StepOverride::Steps(200));
        assert_eq!(request.nstlist_override, Some(20));
        assert_eq!(request.gpu_policy, GpuPolicy::Forced);
        assert_eq!(request.decomposition_grid, Some([3, 2, 1]));
        assert!(!request.append);
    }

    #[test]
    fn negative_step_counts_follow_the_command_line_convention() {
        let request = PartialRunConfig::default()
            .merge_with_cli(&run_args(&["--nsteps", "-1", "--npme", "-1"]), None)
            .unwrap();
        assert_eq!(request.nsteps, StepOverride::Infinite);
        assert_eq!(request.long_range_ranks, LongRangeRanks::Auto);

        let result =
            PartialRunConfig::default().merge_with_cli(&run_args(&["--nsteps", "-3"]), None);
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let mut config = PartialRunConfig::default();
        assert!(matches!(
            config.apply_set_values(&["run.nsteps".to_string()]),
            Err(CliError::Config(_))
        ));
        assert!(matches!(
            config.apply_set_values(&["run.nsteps=many".to_string()]),
            Err(CliError::Config(_))
        ));
        assert!(matches!(
            config.apply_set_values(&["physics.cutoff=1.2".to_string()]),
            Err(CliError::Config(_))
        ));

        let result =
            PartialRunConfig::default().merge_with_cli(&run_args(&["--nb", "tpu"]), None);
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let path = write_config_file("unknown.toml", "[run]\nsteps = 10\n");
        assert!(matches!(
            PartialRunConfig::from_file(&path),
            Err(CliError::FileParsing { .. })
        ));
    }
}
