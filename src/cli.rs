use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};
use crate::error::classify;
use crate::logging;

#[derive(Parser, Debug)]
#[command(
    name = "crawl-archiver",
    version,
    about = "Decide which crawls to keep and commit them to object storage"
)]
pub struct Cli {
    /// Print reports as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decide and archive every discovered crawl
    Archive(ArchiveArgs),
    /// Show resolved paths, configuration and environment
    Status,
    /// Inspect or edit the idempotency cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    /// Delete objects left under staging/ by interrupted commits
    GcStaging(GcStagingArgs),
}

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    /// Decide without uploading, recording or deleting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Re-decide crawls that already have a terminal cache entry
    #[arg(long)]
    pub ignore_cache: bool,

    /// Bucket URL: file:///path or s3://bucket/prefix
    #[arg(long, env = "ARCHIVER_BUCKET")]
    pub bucket: Option<String>,

    /// Directory holding <source_id>/<YYYYMMDD_HHMMSS> crawl directories
    #[arg(long, env = "ARCHIVER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory holding <source_id>/*.log crawl logs
    #[arg(long, env = "ARCHIVER_CRAWL_LOGS_DIR")]
    pub logs_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List every cache entry
    List,
    /// Forget one crawl so the next run decides it again
    Invalidate {
        /// <source_id>/YYYYMMDD_HHMMSS
        crawl_id: String,
    },
    /// Drop entries whose crawl directory no longer exists
    Prune,
}

#[derive(Args, Debug)]
pub struct GcStagingArgs {
    /// List staged objects without deleting them
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, env = "ARCHIVER_BUCKET")]
    pub bucket: Option<String>,
}

fn dispatch(command: Command) -> Result<CommandReport> {
    match command {
        Command::Archive(args) => commands::archive::run(&commands::archive::ArchiveOptions {
            dry_run: args.dry_run,
            ignore_cache: args.ignore_cache,
            bucket: args.bucket,
            data_dir: args.data_dir,
            logs_dir: args.logs_dir,
        }),
        Command::Status => commands::status::run(),
        Command::Cache { action } => {
            let action = match action {
                CacheCommand::List => commands::cache::CacheAction::List,
                CacheCommand::Invalidate { crawl_id } => {
                    commands::cache::CacheAction::Invalidate { crawl_id }
                }
                CacheCommand::Prune => commands::cache::CacheAction::Prune,
            };
            commands::cache::run(&action)
        }
        Command::GcStaging(args) => {
            commands::gc_staging::run(&commands::gc_staging::GcStagingOptions {
                dry_run: args.dry_run,
                bucket: args.bucket,
            })
        }
    }
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

/// Parses arguments and runs one command. Returns the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json);

    match dispatch(cli.command) {
        Ok(report) => {
            print_report(&report, cli.json)?;
            Ok(if report.ok { 0 } else { 1 })
        }
        Err(err) => {
            if let Some(typed) = classify(&err) {
                tracing::error!(code = typed.code().as_str(), "command failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_cache_invalidate_with_global_flags() {
        let cli = Cli::try_parse_from([
            "crawl-archiver",
            "cache",
            "invalidate",
            "scotland/20200902_052458",
            "--json",
        ])
        .expect("parse");
        assert!(cli.json);
        match cli.command {
            Command::Cache {
                action: CacheCommand::Invalidate { crawl_id },
            } => assert_eq!(crawl_id, "scotland/20200902_052458"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
