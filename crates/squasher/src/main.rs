use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{LevelFilter, debug};

use squasher::{
    commands::{SquashOptions, WriteOptions, run_circular, run_delete_squashed, run_squash},
    config::Config,
    resolver::ModuleResolver,
};

/// Squash Django migrations into fresh modules that replace the old history.
#[derive(Parser, Debug)]
#[command(name = "squasher", version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace and full dry-run output)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Project root; defaults to the current directory
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Configuration file applied over the user and project configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    squash: SquashArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Squash the migrations of every selected app (the default)
    Squash(SquashArgs),
    /// Delete migrations already replaced by a squash and drop references to them
    DeleteSquashed(DeleteSquashedArgs),
    /// Report migrations, and apps of the proposed history, that depend on each other
    Circular(CircularArgs),
}

#[derive(Args, Debug)]
struct SquashArgs {
    /// JSON export of the framework's diff against an empty history
    #[arg(long, value_name = "FILE")]
    changes: Option<PathBuf>,

    /// Only squash the specified apps
    #[arg(long, value_name = "APP", num_args = 1..)]
    only: Vec<String>,

    /// Leave an app alone; nothing squashed may depend on it changing
    #[arg(long, value_name = "APP", num_args = 1..)]
    ignore_app: Vec<String>,

    /// Show what would be written without touching any file
    #[arg(long)]
    dry_run: bool,

    /// Name of the squashed migrations; strftime formats such as "%Y%m%d" are expanded
    #[arg(long, value_name = "NAME")]
    squashed_name: Option<String>,

    /// Start generated modules with a header comment
    #[arg(long)]
    include_header: bool,
}

#[derive(Args, Debug)]
struct DeleteSquashedArgs {
    /// Apps to clean up; all project apps when omitted
    #[arg(value_name = "APP")]
    app_labels: Vec<String>,

    /// Comma separated apps to leave alone
    #[arg(long, value_name = "APPS", value_delimiter = ',')]
    exclude_apps: Vec<String>,
}

#[derive(Args, Debug)]
struct CircularArgs {
    /// JSON export of the framework's diff; enables the app-level check
    #[arg(long, value_name = "FILE")]
    changes: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let project_root = match cli.project_root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to determine the current directory")?,
    };
    let mut config = Config::load(Some(&project_root), cli.config.as_deref())?;
    let base_dir = std::env::current_dir().unwrap_or_else(|_| project_root.clone());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match cli.command.unwrap_or(Command::Squash(cli.squash)) {
        Command::DeleteSquashed(args) => {
            let resolver = ModuleResolver::new(config);
            let options = WriteOptions {
                dry_run: false,
                verbosity: cli.verbose,
                include_header: resolver.config().include_header,
                base_dir,
            };
            run_delete_squashed(
                &resolver,
                &args.app_labels,
                &args.exclude_apps,
                &options,
                &mut out,
            )?;
        }
        Command::Circular(args) => {
            let resolver = ModuleResolver::new(config);
            run_circular(&resolver, args.changes.as_deref(), &mut out)?;
        }
        Command::Squash(args) => {
            let Some(changes) = args.changes else {
                bail!("--changes is required to squash migrations");
            };
            if args.include_header {
                config.include_header = true;
            }
            debug!("Configuration: {config:?}");
            let resolver = ModuleResolver::new(config);
            let options = SquashOptions {
                changes,
                only: args.only,
                ignore_apps: args.ignore_app,
                squashed_name: args.squashed_name,
                write: WriteOptions {
                    dry_run: args.dry_run,
                    verbosity: cli.verbose,
                    include_header: resolver.config().include_header,
                    base_dir,
                },
            };
            run_squash(&resolver, &options, &mut out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}
