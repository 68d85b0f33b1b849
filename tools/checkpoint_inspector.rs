// Checkpoint inspector: lists the checkpoints under a checkpoint root, shows the
// pair recovery would choose, and optionally garbage collects older checkpoints.
//
// Usage:
//   cargo run --bin checkpoint_inspector -- <checkpoint_dir> [list|plan|gc] [--json]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use oxicpr::checkpoint::{
    CheckpointManager, CheckpointToken, IndexCommitMetadata, LocalCheckpointManager,
    LogCommitMetadata,
};
use oxicpr::cpr::{collect_garbage, RecoveryPlanner};
use oxicpr::error::RecoveryError;

#[derive(Parser, Debug)]
#[command(name = "checkpoint_inspector")]
#[command(about = "Inspect oxicpr checkpoint directories", long_about = None)]
struct Args {
    /// Checkpoint root directory
    #[arg(value_name = "DIR")]
    checkpoint_dir: PathBuf,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// List every committed index and log checkpoint
    List,
    /// Show the pair recovery would choose, without purging anything
    Plan,
    /// Delete checkpoints older than the pair recovery would choose
    Gc,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum Entry {
    Index {
        token: CheckpointToken,
        metadata: Option<IndexCommitMetadata>,
        error: Option<String>,
    },
    Log {
        token: CheckpointToken,
        metadata: Option<LogCommitMetadata>,
        error: Option<String>,
    },
}

fn list(manager: &LocalCheckpointManager) -> std::io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for token in manager.index_checkpoint_tokens()? {
        let decoded = manager.index_commit_metadata(token)?.map(|bytes| {
            IndexCommitMetadata::decode(&bytes).map_err(|e| e.to_string())
        });
        let (metadata, error) = split(decoded);
        entries.push(Entry::Index {
            token,
            metadata,
            error,
        });
    }
    for token in manager.log_checkpoint_tokens()? {
        let decoded = manager
            .log_commit_metadata(token)?
            .map(|bytes| LogCommitMetadata::decode(&bytes).map_err(|e| e.to_string()));
        let (metadata, error) = split(decoded);
        entries.push(Entry::Log {
            token,
            metadata,
            error,
        });
    }
    Ok(entries)
}

fn split<M>(decoded: Option<Result<M, String>>) -> (Option<M>, Option<String>) {
    match decoded {
        Some(Ok(meta)) => (Some(meta), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, Some("metadata missing".to_string())),
    }
}

fn print_entries(entries: &[Entry]) {
    for entry in entries {
        match entry {
            Entry::Index {
                token,
                metadata: Some(m),
                ..
            } => println!(
                "index {token} v{} table_size={} entries={} start={} snapshot={}B",
                m.version, m.table_size, m.num_entries, m.checkpoint_start_address, m.snapshot_len
            ),
            Entry::Log {
                token,
                metadata: Some(m),
                ..
            } => println!(
                "log   {token} v{} {} index={} begin={} final={} sessions={}",
                m.version,
                m.kind.as_str(),
                m.index_token
                    .map_or_else(|| "none".to_string(), |t| t.to_string()),
                m.begin_address,
                m.final_address,
                m.session_states.len()
            ),
            Entry::Index { token, error, .. } => {
                println!("index {token} unreadable: {}", error.as_deref().unwrap_or("?"))
            }
            Entry::Log { token, error, .. } => {
                println!("log   {token} unreadable: {}", error.as_deref().unwrap_or("?"))
            }
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let manager = LocalCheckpointManager::new(&args.checkpoint_dir)?;
    let planner = RecoveryPlanner::new(&manager);

    match args.command.unwrap_or(Command::List) {
        Command::List => {
            let entries = list(&manager)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_entries(&entries);
            }
        }
        Command::Plan => {
            let report = match planner.plan() {
                Ok(plan) => plan.report,
                Err(RecoveryError::NoValidCheckpoint { report }) => *report,
                Err(e) => return Err(e.into()),
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
        }
        Command::Gc => {
            let plan = planner.plan()?;
            let report = collect_garbage(&manager, plan.pair, &[]);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "kept {}, removed {} checkpoint(s), skipped {}",
                    plan.pair,
                    report.removed(),
                    report.skipped.len()
                );
                for failure in &report.failures {
                    println!("  failed: {failure}");
                }
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
