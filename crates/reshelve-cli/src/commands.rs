use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "reshelve")]
#[command(about = "Plan and apply large file tree reorganizations", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Index a directory tree into a metadata stream
    Scan(ScanArgs),
    /// Compile a move plan from a metadata stream
    Plan(PlanArgs),
    /// Execute a plan or an undo plan
    Apply(ApplyArgs),
    /// Scan, plan and apply in one go
    Run(RunArgs),
    /// Write the inverse of a plan without executing it
    Invert(InvertArgs),
    /// Print configuration values
    PrintConfig,
}

/// Scan filters shared by `scan` and `run`.
#[derive(Debug, Clone, Args)]
pub struct ScanFilterArgs {
    /// Skip files smaller than this many bytes
    #[arg(long)]
    pub min_size: Option<u64>,
    /// Only index these extensions (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub ext_include: Option<Vec<String>>,
    /// Never index these extensions (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub ext_exclude: Option<Vec<String>>,
    /// Also index files whose names start with a dot
    #[arg(long)]
    pub include_hidden: bool,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Root of the tree to index
    pub root: PathBuf,
    /// Where to write the metadata stream
    #[arg(short, long, default_value = "metadata.ndjson")]
    pub output: PathBuf,
    #[command(flatten)]
    pub filters: ScanFilterArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlanModeArg {
    Rules,
    Direct,
}

/// Where a plan's destinations come from, shared by `plan` and `run`.
#[derive(Debug, Clone, Args)]
pub struct PlanSourceArgs {
    #[arg(long, value_enum, default_value_t = PlanModeArg::Rules)]
    pub mode: PlanModeArg,
    /// Rule set as JSON (`{"rules": [...]}` or a bare array)
    #[arg(long, conflicts_with = "decisions")]
    pub rules: Option<PathBuf>,
    /// External advisor command; request on stdin, response on stdout
    #[arg(long)]
    pub advisor_cmd: Option<String>,
    /// Prepared direct-mode decisions document
    #[arg(long)]
    pub decisions: Option<PathBuf>,
    /// Save the rules the advisor designed
    #[arg(long)]
    pub save_rules: Option<PathBuf>,
    /// Destination root; defaults to the scanned root
    #[arg(long)]
    pub dest: Option<PathBuf>,
    /// Seconds to wait between direct-mode advisor batches
    #[arg(long)]
    pub delay: Option<f64>,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Metadata stream produced by `scan`
    #[arg(short, long, default_value = "metadata.ndjson")]
    pub metadata: PathBuf,
    #[command(flatten)]
    pub source: PlanSourceArgs,
    #[arg(long)]
    pub allow_cross_device: bool,
    /// Do not ask for confirmation
    #[arg(long)]
    pub auto: bool,
    #[arg(short, long, default_value = "plan.ndjson")]
    pub output: PathBuf,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Plan or undo plan to execute
    pub plan: PathBuf,
    /// Tree to check and clean up; defaults to the root in the plan manifest
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Validate every move without touching the filesystem
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub allow_cross_device: bool,
    /// Do not ask for confirmation
    #[arg(long)]
    pub auto: bool,
    /// Undo plan location; defaults to `<plan>.undo.ndjson`
    #[arg(long)]
    pub undo_out: Option<PathBuf>,
    /// Write the execution report as JSON
    #[arg(long)]
    pub report_out: Option<PathBuf>,
    /// Keep directories emptied by the moves
    #[arg(long)]
    pub no_cleanup: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Root of the tree to reorganize
    pub root: PathBuf,
    #[command(flatten)]
    pub filters: ScanFilterArgs,
    #[command(flatten)]
    pub source: PlanSourceArgs,
    /// Apply the plan already at `--plan-out` instead of planning again
    #[arg(long, alias = "skip-llm")]
    pub reuse_plan: bool,
    #[arg(long, default_value = "metadata.ndjson")]
    pub metadata_out: PathBuf,
    #[arg(long, default_value = "plan.ndjson")]
    pub plan_out: PathBuf,
    #[arg(long, default_value = "report.json")]
    pub report_out: PathBuf,
    /// Validate every move without touching the filesystem
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub allow_cross_device: bool,
    /// Do not ask for confirmation
    #[arg(long)]
    pub auto: bool,
    /// Keep directories emptied by the moves
    #[arg(long)]
    pub no_cleanup: bool,
}

#[derive(Debug, Args)]
pub struct InvertArgs {
    pub plan: PathBuf,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}
