use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Whether accelerators should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPolicy {
    /// Use a compatible accelerator when one is available.
    #[default]
    Auto,
    /// Fail unless an accelerator can be used.
    Forced,
    Disabled,
}

impl FromStr for GpuPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "gpu" | "forced" => Ok(Self::Forced),
            "cpu" | "off" => Ok(Self::Disabled),
            _ => Err(ConfigError::InvalidValue {
                name: "gpu policy",
                reason: format!("'{}' is not one of auto, gpu (forced), cpu (off)", s),
            }),
        }
    }
}

impl fmt::Display for GpuPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Forced => "gpu",
            Self::Disabled => "cpu",
        })
    }
}

/// How ranks with long-range duty are placed among all ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RankOrder {
    /// One long-range rank after each group of spatial ranks it serves.
    #[default]
    Interleave,
    /// All spatial ranks first, then all long-range ranks.
    PpFirst,
}

impl FromStr for RankOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interleave" => Ok(Self::Interleave),
            "pp-first" | "pp_pme" => Ok(Self::PpFirst),
            _ => Err(ConfigError::InvalidValue {
                name: "rank order",
                reason: format!("'{}' is not one of interleave, pp-first", s),
            }),
        }
    }
}

impl fmt::Display for RankOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interleave => "interleave",
            Self::PpFirst => "pp-first",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LongRangeRanks {
    /// Let the duty assigner decide.
    #[default]
    Auto,
    Count(usize),
}

impl LongRangeRanks {
    /// `-1` selects the automatic choice, as on the command line.
    pub fn from_request(value: i64) -> Result<Self, ConfigError> {
        match value {
            -1 => Ok(Self::Auto),
            n if n >= 0 => Ok(Self::Count(n as usize)),
            n => Err(ConfigError::InvalidValue {
                name: "long-range ranks",
                reason: format!("{} is neither -1 (auto) nor a rank count", n),
            }),
        }
    }

    pub fn requested(self) -> usize {
        match self {
            Self::Auto => 0,
            Self::Count(n) => n,
        }
    }
}

/// A command-line override of the number of steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StepOverride {
    #[default]
    None,
    Infinite,
    Steps(i64),
}

impl TryFrom<i64> for StepOverride {
    type Error = ConfigError;

    /// `-2` keeps the input value, `-1` runs forever, anything else negative is invalid.
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -2 => Ok(Self::None),
            -1 => Ok(Self::Infinite),
            n if n >= 0 => Ok(Self::Steps(n)),
            n => Err(ConfigError::InvalidValue {
                name: "nsteps",
                reason: format!("Invalid nsteps value passed on the command line: {}", n),
            }),
        }
    }
}

/// Cost envelopes and candidates of the list-interval search.
///
/// Each pair gives the acceptable and the maximum relative increase of the pair-list
/// cost caused by the larger buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningConstants {
    pub cpu_ok: f64,
    pub cpu_max: f64,
    pub wide_simd_ok: f64,
    pub wide_simd_max: f64,
    pub gpu_ok: f64,
    pub gpu_max: f64,
    pub reference_nstlist: i32,
    /// Ascending list intervals to try.
    pub candidates: Vec<i32>,
}

impl Default for TuningConstants {
    fn default() -> Self {
        Self {
            cpu_ok: 1.05,
            cpu_max: 1.09,
            wide_simd_ok: 1.22,
            wide_simd_max: 1.30,
            gpu_ok: 1.20,
            gpu_max: 1.30,
            reference_nstlist: 10,
            candidates: vec![20, 25, 40],
        }
    }
}

impl TuningConstants {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pairs = [
            (self.cpu_ok, self.cpu_max),
            (self.wide_simd_ok, self.wide_simd_max),
            (self.gpu_ok, self.gpu_max),
        ];
        if pairs.iter().any(|&(ok, max)| ok < 1.0 || max < ok) {
            return Err(ConfigError::InvalidValue {
                name: "tuning",
                reason: "cost ratios must satisfy 1 <= ok <= max".to_string(),
            });
        }
        if self.reference_nstlist < 1
            || self.candidates.is_empty()
            || self.candidates.windows(2).any(|w| w[0] >= w[1])
            || self.candidates[0] <= self.reference_nstlist
        {
            return Err(ConfigError::InvalidValue {
                name: "tuning",
                reason: "candidates must ascend strictly and exceed the reference interval"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// A complete request to run one simulation. Immutable once bootstrap begins; every
/// spawned rank receives its own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub input_path: PathBuf,
    /// Number of ranks to run with; `None` lets the planner decide.
    pub requested_ranks: Option<usize>,
    pub total_threads: Option<usize>,
    pub threads_per_rank: Option<usize>,
    pub long_range_threads: Option<usize>,
    pub decomposition_grid: Option<[usize; 3]>,
    pub long_range_ranks: LongRangeRanks,
    pub rank_order: RankOrder,
    pub gpu_policy: GpuPolicy,
    pub gpu_ids: Option<Vec<usize>>,
    pub nstlist_override: Option<i32>,
    pub nsteps: StepOverride,
    pub checkpoint_input: Option<PathBuf>,
    pub checkpoint_output: PathBuf,
    /// Minutes between checkpoints; negative disables periodic checkpoints.
    pub checkpoint_period_minutes: f64,
    pub append: bool,
    pub max_hours: Option<f64>,
    pub reproducible: bool,
    pub rerun: Option<PathBuf>,
    pub trajectory_output: Option<PathBuf>,
    pub matrix_output: PathBuf,
    pub accounting_csv: Option<PathBuf>,
    pub reset_counters_at: Option<i64>,
    pub tuning: TuningConstants,
}

impl RunRequest {
    /// Copy handed to a spawned rank; it must never spawn again.
    pub fn for_spawned_rank(&self) -> Self {
        Self {
            requested_ranks: Some(1),
            ..self.clone()
        }
    }
}

#[derive(Default)]
pub struct RunRequestBuilder {
    input_path: Option<PathBuf>,
    requested_ranks: Option<usize>,
    total_threads: Option<usize>,
    threads_per_rank: Option<usize>,
    long_range_threads: Option<usize>,
    decomposition_grid: Option<[usize; 3]>,
    long_range_ranks: Option<LongRangeRanks>,
    rank_order: Option<RankOrder>,
    gpu_policy: Option<GpuPolicy>,
    gpu_ids: Option<Vec<usize>>,
    nstlist_override: Option<i32>,
    nsteps: Option<StepOverride>,
    checkpoint_input: Option<PathBuf>,
    checkpoint_output: Option<PathBuf>,
    checkpoint_period_minutes: Option<f64>,
    append: bool,
    max_hours: Option<f64>,
    reproducible: bool,
    rerun: Option<PathBuf>,
    trajectory_output: Option<PathBuf>,
    matrix_output: Option<PathBuf>,
    accounting_csv: Option<PathBuf>,
    reset_counters_at: Option<i64>,
    tuning: Option<TuningConstants>,
}

impl RunRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_path(mut self, path: PathBuf) -> Self {
        self.input_path = Some(path);
        self
    }
    pub fn requested_ranks(mut self, ranks: usize) -> Self {
        self.requested_ranks = Some(ranks);
        self
    }
    pub fn total_threads(mut self, threads: usize) -> Self {
        self.total_threads = Some(threads);
        self
    }
    pub fn threads_per_rank(mut self, threads: usize) -> Self {
        self.threads_per_rank = Some(threads);
        self
    }
    pub fn long_range_threads(mut self, threads: usize) -> Self {
        self.long_range_threads = Some(threads);
        self
    }
    pub fn decomposition_grid(mut self, grid: [usize; 3]) -> Self {
        self.decomposition_grid = Some(grid);
        self
    }
    pub fn long_range_ranks(mut self, ranks: LongRangeRanks) -> Self {
        self.long_range_ranks = Some(ranks);
        self
    }
    pub fn rank_order(mut self, order: RankOrder) -> Self {
        self.rank_order = Some(order);
        self
    }
    pub fn gpu_policy(mut self, policy: GpuPolicy) -> Self {
        self.gpu_policy = Some(policy);
        self
    }
    pub fn gpu_ids(mut self, ids: Vec<usize>) -> Self {
        self.gpu_ids = Some(ids);
        self
    }
    pub fn nstlist_override(mut self, nstlist: i32) -> Self {
        self.nstlist_override = Some(nstlist);
        self
    }
    pub fn nsteps(mut self, nsteps: StepOverride) -> Self {
        self.nsteps = Some(nsteps);
        self
    }
    pub fn checkpoint_input(mut self, path: PathBuf) -> Self {
        self.checkpoint_input = Some(path);
        self
    }
    pub fn checkpoint_output(mut self, path: PathBuf) -> Self {
        self.checkpoint_output = Some(path);
        self
    }
    pub fn checkpoint_period_minutes(mut self, minutes: f64) -> Self {
        self.checkpoint_period_minutes = Some(minutes);
        self
    }
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
    pub fn max_hours(mut self, hours: f64) -> Self {
        self.max_hours = Some(hours);
        self
    }
    pub fn reproducible(mut self, reproducible: bool) -> Self {
        self.reproducible = reproducible;
        self
    }
    pub fn rerun(mut self, path: PathBuf) -> Self {
        self.rerun = Some(path);
        self
    }
    pub fn trajectory_output(mut self, path: PathBuf) -> Self {
        self.trajectory_output = Some(path);
        self
    }
    pub fn matrix_output(mut self, path: PathBuf) -> Self {
        self.matrix_output = Some(path);
        self
    }
    pub fn accounting_csv(mut self, path: PathBuf) -> Self {
        self.accounting_csv = Some(path);
        self
    }
    pub fn reset_counters_at(mut self, step: i64) -> Self {
        self.reset_counters_at = Some(step);
        self
    }
    pub fn tuning(mut self, tuning: TuningConstants) -> Self {
        self.tuning = Some(tuning);
        self
    }

    pub fn build(self) -> Result<RunRequest, ConfigError> {
        let positive = |name: &'static str, value: Option<usize>| match value {
            Some(0) => Err(ConfigError::InvalidValue {
                name,
                reason: "must be at least 1".to_string(),
            }),
            other => Ok(other),
        };
        let requested_ranks = positive("ranks", self.requested_ranks)?;
        let total_threads = positive("threads", self.total_threads)?;
        let threads_per_rank = positive("threads per rank", self.threads_per_rank)?;
        let long_range_threads = positive("long-range threads", self.long_range_threads)?;

        if let Some(grid) = self.decomposition_grid {
            if grid.iter().any(|&n| n == 0) {
                return Err(ConfigError::InvalidValue {
                    name: "decomposition grid",
                    reason: format!("{:?} has an empty dimension", grid),
                });
            }
        }
        if let Some(n) = self.nstlist_override {
            if n <= 0 {
                return Err(ConfigError::InvalidValue {
                    name: "nstlist",
                    reason: format!("{} is not a positive interval", n),
                });
            }
        }
        if let Some(h) = self.max_hours {
            if h <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    name: "max hours",
                    reason: format!("{} is not a positive duration", h),
                });
            }
        }
        let tuning = self.tuning.unwrap_or_default();
        tuning.validate()?;

        Ok(RunRequest {
            input_path: self
                .input_path
                .ok_or(ConfigError::MissingParameter("input_path"))?,
            requested_ranks,
            total_threads,
            threads_per_rank,
            long_range_threads,
            decomposition_grid: self.decomposition_grid,
            long_range_ranks: self.long_range_ranks.unwrap_or_default(),
            rank_order: self.rank_order.unwrap_or_default(),
            gpu_policy: self.gpu_policy.unwrap_or_default(),
            gpu_ids: self.gpu_ids,
            nstlist_override: self.nstlist_override,
            nsteps: self.nsteps.unwrap_or_default(),
            checkpoint_input: self.checkpoint_input,
            checkpoint_output: self
                .checkpoint_output
                .unwrap_or_else(|| PathBuf::from("state.cpt")),
            checkpoint_period_minutes: self.checkpoint_period_minutes.unwrap_or(15.0),
            append: self.append,
            max_hours: self.max_hours,
            reproducible: self.reproducible,
            rerun: self.rerun,
            trajectory_output: self.trajectory_output,
            matrix_output: self
                .matrix_output
                .unwrap_or_else(|| PathBuf::from("hessian.mtx")),
            accounting_csv: self.accounting_csv,
            reset_counters_at: self.reset_counters_at,
            tuning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_input_and_fills_defaults() {
        assert_eq!(
            RunRequestBuilder::new().build(),
            Err(ConfigError::MissingParameter("input_path"))
        );
        let request = RunRequestBuilder::new()
            .input_path("run.tpr".into())
            .build()
            .unwrap();
        assert_eq!(request.gpu_policy, GpuPolicy::Auto);
        assert_eq!(request.long_range_ranks, LongRangeRanks::Auto);
        assert_eq!(request.nsteps, StepOverride::None);
        assert_eq!(request.checkpoint_output, PathBuf::from("state.cpt"));
        assert_eq!(request.checkpoint_period_minutes, 15.0);
    }

    #[test]
    fn step_override_follows_command_line_convention() {
        assert_eq!(StepOverride::try_from(-2), Ok(StepOverride::None));
        assert_eq!(StepOverride::try_from(-1), Ok(StepOverride::Infinite));
        assert_eq!(StepOverride::try_from(500), Ok(StepOverride::Steps(500)));
        assert!(StepOverride::try_from(-3).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = || RunRequestBuilder::new().input_path("run.tpr".into());
        assert!(base().requested_ranks(0).build().is_err());
        assert!(base().nstlist_override(0).build().is_err());
        assert!(base().decomposition_grid([2, 0, 1]).build().is_err());
        let tuning = TuningConstants {
            candidates: vec![25, 20],
            ..Default::default()
        };
        assert!(base().tuning(tuning).build().is_err());
    }

    #[test]
    fn spawned_copy_never_spawns_again() {
        let request = RunRequestBuilder::new()
            .input_path("run.tpr".into())
            .requested_ranks(4)
            .build()
            .unwrap();
        let copy = request.for_spawned_rank();
        assert_eq!(copy.requested_ranks, Some(1));
        assert_eq!(copy.input_path, request.input_path);
    }

    #[test]
    fn policies_parse_from_their_names() {
        assert_eq!("gpu".parse::<GpuPolicy>(), Ok(GpuPolicy::Forced));
        assert_eq!("CPU".parse::<GpuPolicy>(), Ok(GpuPolicy::Disabled));
        assert_eq!("forced".parse::<GpuPolicy>(), Ok(GpuPolicy::Forced));
        assert_eq!("Off".parse::<GpuPolicy>(), Ok(GpuPolicy::Disabled));
        assert!("maybe".parse::<GpuPolicy>().is_err());
        assert_eq!("pp-first".parse::<RankOrder>(), Ok(RankOrder::PpFirst));
        assert!("cartesian".parse::<RankOrder>().is_err());
        assert_eq!(LongRangeRanks::from_request(-1), Ok(LongRangeRanks::Auto));
        assert_eq!(LongRangeRanks::from_request(2), Ok(LongRangeRanks::Count(2)));
    }
}
