use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, error};

use sweeper::config::{AgePolicy, AgeThreshold, EpochBasis, SweepConfig, TimestampPolicy};
use sweeper::probe::Prober;
use sweeper::remove::{format_size, Remover, RemoveStatus, StdinPrompt};
use sweeper::sweep::Engine;
use sweeper::usage::UsageSurvey;

/// Age-based cleanup for shared scratch filesystems
#[derive(Parser)]
#[command(name = "sweeper")]
#[command(about = "Remove directory trees whose contents have all aged out", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease log verbosity (-q for warnings only, -qq for errors)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan directories and remove trees whose contents all aged out
    Sweep(SweepArgs),
    /// Remove files and directories, optionally prompting per entity
    Rm(RmArgs),
    /// Report disk usage, rate-limited
    Du(DuArgs),
}

#[derive(Args)]
struct SweepArgs {
    /// Age threshold in days
    #[arg(short = 'd', long, default_value = "30")]
    days: u32,

    /// Measure ages from the most recent midnight instead of now
    #[arg(short = 'm', long, conflicts_with = "noon")]
    midnight: bool,

    /// Measure ages from the most recent noon instead of now
    #[arg(short = 'n', long)]
    noon: bool,

    /// Judge age by access time only
    #[arg(short = 'A', long, conflicts_with = "mtime")]
    atime: bool,

    /// Judge age by modification time only
    #[arg(short = 'M', long)]
    mtime: bool,

    /// Also remove entities owned by root
    #[arg(short = 'r', long)]
    include_root: bool,

    /// Actually remove things; without this the run is a dry run
    #[arg(short = 'D', long)]
    do_it: bool,

    /// Continue with remaining arguments after a failure
    #[arg(short = 'k', long)]
    keep_going: bool,

    /// Socket files do not short-circuit directory removal
    #[arg(short = 's', long)]
    ignore_sockets: bool,

    /// FIFO files do not short-circuit directory removal
    #[arg(short = 'p', long)]
    ignore_pipes: bool,

    /// Path to exclude from cleanup (repeatable)
    #[arg(short = 'e', long = "exclude", value_name = "PATH")]
    excluded_paths: Vec<PathBuf>,

    /// User whose entities are excluded, by name or uid (repeatable)
    #[arg(short = 'E', long = "exclude-user", value_name = "USER")]
    excluded_users: Vec<String>,

    /// Group whose entities are excluded, by name or gid (repeatable)
    #[arg(short = 'G', long = "exclude-group", value_name = "GROUP")]
    excluded_groups: Vec<String>,

    /// Allow plain files as command-line arguments
    #[arg(short = 'F', long)]
    allow_files: bool,

    /// Limit stat calls to this many per second
    #[arg(short = 'S', long, value_name = "RATE")]
    stat_limit: Option<f64>,

    /// Limit unlink/rmdir calls to this many per second
    #[arg(short = 'U', long, value_name = "RATE")]
    unlink_limit: Option<f64>,

    /// Report achieved call rates at exit
    #[arg(short = 'R', long)]
    rate_report: bool,

    /// Write the work log to this sqlite file instead of memory
    #[arg(short = 'w', long, value_name = "FILE")]
    work_log: Option<PathBuf>,

    /// Keep the work log file after a successful run
    #[arg(short = 'K', long, requires = "work_log")]
    keep_work_log: bool,

    /// Scan and queue only; do not process the work log
    #[arg(short = 'o', long)]
    work_log_only: bool,

    /// Directories to sweep
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InteractiveMode {
    Never,
    Once,
    Always,
}

#[derive(Args)]
struct RmArgs {
    /// Remove directories and their contents recursively
    #[arg(short = 'r', long)]
    recursive: bool,

    /// Prompt before every removal (same as --interactive=always)
    #[arg(short = 'i', conflicts_with = "once")]
    always: bool,

    /// Prompt once before a recursive or many-argument removal
    #[arg(short = 'I')]
    once: bool,

    /// When to prompt for confirmation
    #[arg(long, value_enum)]
    interactive: Option<InteractiveMode>,

    /// Print the total bytes removed at exit
    #[arg(short = 's', long)]
    summary: bool,

    /// Report summary sizes in kiB
    #[arg(short = 'k', long, conflicts_with = "human_readable")]
    kilobytes: bool,

    /// Report summary sizes in human-readable units
    #[arg(short = 'H', long)]
    human_readable: bool,

    /// Limit unlink/rmdir calls to this many per second
    #[arg(short = 'U', long, value_name = "RATE")]
    unlink_limit: Option<f64>,

    /// Report achieved call rates at exit
    #[arg(short = 'R', long)]
    rate_report: bool,

    /// Files and directories to remove
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Args)]
struct DuArgs {
    /// Report sizes in human-readable units
    #[arg(short = 'H', long, conflicts_with = "kilobytes")]
    human_readable: bool,

    /// Report sizes in kiB
    #[arg(short = 'k', long)]
    kilobytes: bool,

    /// Limit stat calls to this many per second
    #[arg(short = 'S', long, value_name = "RATE")]
    stat_limit: Option<f64>,

    /// Report achieved call rates at exit
    #[arg(short = 'R', long)]
    rate_report: bool,

    /// Paths to size
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (q, _) if q >= 2 => "error",
        (1, _) => "warn",
        (_, 0) => "info",
        (_, 1) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("sweeper started with verbosity level: {}", cli.verbose);

    let result = match cli.command {
        Commands::Sweep(args) => run_sweep(args),
        Commands::Rm(args) => run_rm(args),
        Commands::Du(args) => run_du(args),
    };

    if let Err(e) = result {
        error!("Fatal error: {e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run_sweep(args: SweepArgs) -> anyhow::Result<()> {
    let basis = if args.midnight {
        EpochBasis::Midnight
    } else if args.noon {
        EpochBasis::Noon
    } else {
        EpochBasis::Now
    };
    let timestamp_policy = if args.atime {
        TimestampPolicy::Atime
    } else if args.mtime {
        TimestampPolicy::Mtime
    } else {
        TimestampPolicy::Max
    };

    let mut excluded_paths = HashSet::new();
    for path in &args.excluded_paths {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("Bad exclusion path {}", path.display()))?;
        excluded_paths.insert(canonical);
    }

    let config = SweepConfig {
        age: AgePolicy {
            threshold: AgeThreshold::new(args.days, basis),
            timestamp_policy,
            exclude_root: !args.include_root,
        },
        ignore_sockets: args.ignore_sockets,
        ignore_pipes: args.ignore_pipes,
        excluded_paths,
        excluded_uids: resolve_users(&args.excluded_users)?,
        excluded_gids: resolve_groups(&args.excluded_groups)?,
        dry_run: !args.do_it,
        keep_going: args.keep_going,
        worklog_path: args.work_log,
        keep_worklog: args.keep_work_log,
        worklog_only: args.work_log_only,
        allow_files: args.allow_files,
        stat_limit: args.stat_limit,
        unlink_limit: args.unlink_limit,
        rate_report: args.rate_report,
    };

    let mut engine = Engine::new(config);
    engine.announce();
    engine.run(&args.paths)?;
    Ok(())
}

fn run_rm(args: RmArgs) -> anyhow::Result<()> {
    let mode = args.interactive.unwrap_or(if args.always {
        InteractiveMode::Always
    } else if args.once {
        InteractiveMode::Once
    } else {
        InteractiveMode::Never
    });

    if mode == InteractiveMode::Once && (args.recursive || args.paths.len() >= 3) {
        let what = if args.recursive {
            format!("remove {} argument(s) recursively", args.paths.len())
        } else {
            format!("remove {} arguments", args.paths.len())
        };
        let mut prompt = StdinPrompt::new("sweeper rm");
        use sweeper::remove::Prompt;
        if !prompt.confirm(&what) {
            return Ok(());
        }
    }

    let mut prober = Prober::new();
    let mut remover = Remover::new();
    if let Some(limit) = args.unlink_limit {
        remover.set_rate_limit(limit);
    }
    remover.track_bytes(args.summary);

    let mut failures = 0usize;
    for path in &args.paths {
        if mode == InteractiveMode::Always {
            let mut prompt = StdinPrompt::new("sweeper rm");
            match remover.remove_interactive(&mut prober, path, args.recursive, &mut prompt) {
                RemoveStatus::Succeeded | RemoveStatus::Declined => {}
                RemoveStatus::Failed => failures += 1,
            }
        } else {
            if !args.recursive && prober.is_directory(path) {
                error!("cannot remove '{}': Is a directory", path.display());
                failures += 1;
                continue;
            }
            if let Err(e) = remover.remove(&mut prober, path) {
                error!("{e}");
                failures += 1;
            }
        }
    }

    remover.profile(args.rate_report);
    if args.summary {
        println!(
            "Removed {}",
            format_size(remover.bytes_freed(), args.human_readable || args.kilobytes, args.kilobytes)
        );
    }
    if failures > 0 {
        bail!("{failures} argument(s) could not be removed");
    }
    Ok(())
}

fn run_du(args: DuArgs) -> anyhow::Result<()> {
    let mut survey = UsageSurvey::new(args.human_readable || args.kilobytes, args.kilobytes);
    if let Some(limit) = args.stat_limit {
        survey.set_rate_limit(limit);
    }
    survey.set_rate_report(args.rate_report);

    let mut failures = 0usize;
    let mut grand_total = 0u64;
    for path in &args.paths {
        match survey.report(path) {
            Ok(total) => grand_total += total,
            Err(e) => {
                error!("Unable to size {} ({e})", path.display());
                failures += 1;
            }
        }
    }
    if args.paths.len() > 1 {
        survey.report_grand_total(grand_total);
    }
    survey.finish();
    if failures > 0 {
        bail!("{failures} argument(s) could not be sized");
    }
    Ok(())
}

/// Accept either a numeric uid or an account name.
fn resolve_users(specs: &[String]) -> anyhow::Result<BTreeSet<u32>> {
    let mut uids = BTreeSet::new();
    for spec in specs {
        if let Ok(uid) = spec.parse::<u32>() {
            uids.insert(uid);
            continue;
        }
        let user = nix::unistd::User::from_name(spec)
            .with_context(|| format!("Unable to look up user {spec}"))?;
        match user {
            Some(user) => uids.insert(user.uid.as_raw()),
            None => bail!("Unknown user: {spec}"),
        };
    }
    Ok(uids)
}

fn resolve_groups(specs: &[String]) -> anyhow::Result<BTreeSet<u32>> {
    let mut gids = BTreeSet::new();
    for spec in specs {
        if let Ok(gid) = spec.parse::<u32>() {
            gids.insert(gid);
            continue;
        }
        let group = nix::unistd::Group::from_name(spec)
            .with_context(|| format!("Unable to look up group {spec}"))?;
        match group {
            Some(group) => gids.insert(group.gid.as_raw()),
            None => bail!("Unknown group: {spec}"),
        };
    }
    Ok(gids)
}
