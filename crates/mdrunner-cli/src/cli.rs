use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "mdrunner developers",
    version,
    about = "mdrunner - Plans, launches and coordinates parallel molecular dynamics runs.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Total number of threads for the run.
    /// Defaults to the number of hardware threads.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from a run input file.
    Run(RunArgs),
    /// Build a run input file from a system description.
    Prepare(PrepareArgs),
    /// Print a summary of a run input, checkpoint, trajectory or matrix file.
    Dump(DumpArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    // --- Core Arguments ---
    /// Path to the run input file (.tpr, .tpa or .tpb).
    #[arg(short = 's', long, required = true, value_name = "PATH")]
    pub input: PathBuf,

    /// Path to a run configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    // --- Resource Overrides ---
    /// Number of ranks to run with.
    #[arg(long = "ntmpi", value_name = "INT")]
    pub ranks: Option<usize>,

    /// Threads per rank.
    #[arg(long = "ntomp", value_name = "INT")]
    pub threads_per_rank: Option<usize>,

    /// Threads per rank with long-range duty only.
    #[arg(long = "ntomp-pme", value_name = "INT")]
    pub long_range_threads: Option<usize>,

    /// Number of ranks dedicated to long-range interactions; -1 decides automatically.
    #[arg(long = "npme", value_name = "INT", allow_negative_numbers = true)]
    pub long_range_ranks: Option<i64>,

    /// Decomposition grid as three cell counts along x, y and z.
    #[arg(long = "dd", num_args = 3, value_names = ["NX", "NY", "NZ"])]
    pub decomposition_grid: Option<Vec<usize>>,

    /// Placement of long-range ranks: interleave or pp-first.
    #[arg(long, value_name = "ORDER")]
    pub rank_order: Option<String>,

    /// Accelerator policy: auto, gpu (alias forced) or cpu (alias off).
    #[arg(long = "nb", value_name = "POLICY")]
    pub gpu_policy: Option<String>,

    /// Accelerator ids handed to the spatial ranks in order, e.g. 0,0,1,1.
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub gpu_ids: Option<Vec<usize>>,

    // --- Run Overrides ---
    /// Number of steps; -1 runs forever, -2 keeps the value from the run input.
    #[arg(long, value_name = "INT", allow_negative_numbers = true)]
    pub nsteps: Option<i64>,

    /// Pair-list refresh interval, replacing the automatic search.
    #[arg(long, value_name = "INT")]
    pub nstlist: Option<i32>,

    /// Stop after this many hours of wall time.
    #[arg(long = "maxh", value_name = "HOURS")]
    pub max_hours: Option<f64>,

    /// Prefer binary-identical results over speed.
    #[arg(long = "reprod")]
    pub reproducible: bool,

    /// Recompute energies for the frames of a trajectory instead of simulating.
    #[arg(long, value_name = "PATH")]
    pub rerun: Option<PathBuf>,

    /// Trajectory output file.
    #[arg(short = 'o', long, value_name = "PATH")]
    pub trajectory: Option<PathBuf>,

    /// Hessian output file of normal-mode runs.
    #[arg(long = "mtx", value_name = "PATH")]
    pub matrix: Option<PathBuf>,

    /// Write the wall-time accounting table to a CSV file.
    #[arg(long, value_name = "PATH")]
    pub accounting_csv: Option<PathBuf>,

    /// Reset the performance counters at this step.
    #[arg(long = "resetstep", value_name = "INT")]
    pub reset_step: Option<i64>,

    // --- Checkpoint Overrides ---
    /// Checkpoint to continue from.
    #[arg(long = "cpi", value_name = "PATH")]
    pub checkpoint_input: Option<PathBuf>,

    /// Checkpoint output file.
    #[arg(long = "cpo", value_name = "PATH")]
    pub checkpoint_output: Option<PathBuf>,

    /// Minutes between checkpoints; negative disables periodic checkpoints.
    #[arg(long = "cpt", value_name = "MINUTES", allow_negative_numbers = true)]
    pub checkpoint_period: Option<f64>,

    /// Override `checkpoint.append` from the config file.
    #[command(flatten)]
    pub append: AppendOutput,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S run.nsteps=5000
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Mutually exclusive flags for appending to the outputs of a continued run.
#[derive(Args, Debug, Clone, Copy)]
#[group(required = false, multiple = false)]
pub struct AppendOutput {
    /// Append to the existing output files when continuing from a checkpoint.
    #[arg(long)]
    pub append: bool,
    /// Start new output files when continuing from a checkpoint.
    #[arg(long)]
    pub noappend: bool,
}

/// Arguments for the `prepare` subcommand.
#[derive(Args, Debug)]
pub struct PrepareArgs {
    /// Path to the system description in TOML format.
    #[arg(short = 'f', long, required = true, value_name = "PATH")]
    pub description: PathBuf,

    /// Path for the run input file; the extension selects the encoding.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub output: PathBuf,
}

/// Arguments for the `dump` subcommand.
#[derive(Args, Debug)]
pub struct DumpArgs {
    /// The file to summarize.
    #[arg(required = true, value_name = "PATH")]
    pub path: PathBuf,
}
