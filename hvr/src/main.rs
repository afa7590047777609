//! Hardware Validation Runner - operator CLI
//!
//! Inspects and clears the step checkpoint, validates tool parameters and
//! removes a leftover post-reboot resume entry. Step sequences themselves
//! are built against the `hvr-harness` library.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hvr_common::{CheckpointStore, LogConfig, ToolSchema, init_logging};
use hvr_harness::{HostControl, SystemHost, builtin_profiles, profile_by_name};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const DEFAULT_CHECKPOINT: &str = "hvr_state.json";
const DEFAULT_ENTRY: &str = "hvr-resume";

#[derive(Parser)]
#[command(name = "hvr")]
#[command(author, version, about = "Hardware Validation Runner - operator tools")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or clear the step checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// List tools or validate tool parameters
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage the post-reboot resume entry
    Resume {
        #[command(subcommand)]
        action: ResumeAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the persisted execution state as JSON
    Show {
        #[arg(long, env = "HVR_CHECKPOINT", default_value = DEFAULT_CHECKPOINT)]
        path: PathBuf,
    },
    /// Delete the checkpoint so the next run starts fresh
    Clear {
        #[arg(long, env = "HVR_CHECKPOINT", default_value = DEFAULT_CHECKPOINT)]
        path: PathBuf,

        /// Clear even while a reboot hand-off is pending
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// List every tool and its parameters
    List,
    /// Validate `key=value` overrides and print the resulting configuration
    Check {
        /// Tool name (burnin, smartcheck, powercycle, cdi)
        tool: String,

        /// Overrides as key=value
        overrides: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ResumeAction {
    /// Remove the startup entry that relaunches the runner after reboot
    Deregister {
        /// Entry name used when the runner registered itself
        #[arg(long, default_value = DEFAULT_ENTRY)]
        name: String,

        /// Startup directory (defaults to the platform's)
        #[arg(long)]
        startup_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env()
        .context("invalid logging environment")?
        .verbose(cli.verbose);
    // Held until exit so buffered file logs are flushed.
    let _guard = init_logging(&log_config).context("failed to initialise logging")?;

    match cli.command {
        Command::Checkpoint { action } => match action {
            CheckpointAction::Show { path } => {
                println!("{}", show_checkpoint(&CheckpointStore::new(path))?);
            }
            CheckpointAction::Clear { path, force } => {
                clear_checkpoint(&CheckpointStore::new(path), force)?;
            }
        },
        Command::Config { action } => match action {
            ConfigAction::List => print!("{}", list_tools()),
            ConfigAction::Check { tool, overrides } => {
                println!("{}", check_config(&tool, &overrides)?);
            }
        },
        Command::Resume { action } => match action {
            ResumeAction::Deregister { name, startup_dir } => {
                let host = match startup_dir {
                    Some(dir) => SystemHost::with_startup_dir(name, dir),
                    None => SystemHost::new(name)?,
                };
                debug!(entry = %host.entry_path().display(), "Deregistering resume entry");
                host.deregister_resume()?;
                println!("Removed {}", host.entry_path().display());
            }
        },
    }
    Ok(())
}

fn show_checkpoint(store: &CheckpointStore) -> Result<String> {
    if !store.exists() {
        return Ok(format!("No checkpoint at {}", store.path().display()));
    }
    let state = store.load();
    Ok(serde_json::to_string_pretty(&state)?)
}

fn clear_checkpoint(store: &CheckpointStore, force: bool) -> Result<()> {
    if !store.exists() {
        info!(path = %store.path().display(), "No checkpoint to clear");
        return Ok(());
    }
    let mut state = store.load();
    if state.is_recovering {
        if !force {
            bail!(
                "{} is waiting for a post-reboot resume; pass --force to clear it anyway",
                store.path().display()
            );
        }
        warn!(path = %store.path().display(), "Clearing checkpoint with a pending resume");
        state.is_recovering = false;
        store.save(&state)?;
    }
    store.delete()?;
    Ok(())
}

fn check_config(tool: &str, pairs: &[String]) -> Result<String> {
    let Some(profile) = profile_by_name(tool) else {
        let profiles = builtin_profiles();
        let known: Vec<&str> = profiles.iter().map(|p| p.name()).collect();
        bail!("unknown tool '{tool}' (known: {})", known.join(", "));
    };
    match profile.schema().validate_pairs(pairs) {
        Ok(config) => Ok(serde_json::to_string_pretty(&config.to_json())?),
        Err(e) => {
            let mut report = String::new();
            for issue in &e.issues {
                let _ = writeln!(report, "  {issue}");
            }
            bail!("{} invalid parameter(s) for {}:\n{report}", e.issues.len(), e.tool)
        }
    }
}

fn list_tools() -> String {
    let mut out = String::new();
    for profile in builtin_profiles() {
        let _ = writeln!(out, "{}", profile.name());
        describe_schema(&mut out, &profile.schema());
    }
    out
}

fn describe_schema(out: &mut String, schema: &ToolSchema) {
    for spec in schema.params() {
        let _ = writeln!(
            out,
            "  {:<28} {:<7} default: {}  {}",
            spec.name, spec.ty, spec.default, spec.description
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvr_common::ExecutionState;
    use tempfile::TempDir;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["hvr", "config", "check", "smartcheck", "dut_id=3"]).unwrap();
        match cli.command {
            Command::Config {
                action: ConfigAction::Check { tool, overrides },
            } => {
                assert_eq!(tool, "smartcheck");
                assert_eq!(overrides, ["dut_id=3"]);
            }
            _ => panic!("wrong subcommand"),
        }

        let cli = Cli::try_parse_from(["hvr", "-v", "checkpoint", "clear", "--force"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Command::Checkpoint {
                action: CheckpointAction::Clear { force: true, .. }
            }
        ));
    }

    #[test]
    fn show_reports_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"));
        assert!(show_checkpoint(&store).unwrap().starts_with("No checkpoint"));

        let mut state = ExecutionState::default();
        state.mark_completed("burnin");
        store.save(&state).unwrap();
        assert!(show_checkpoint(&store).unwrap().contains("burnin"));
    }

    #[test]
    fn clear_needs_force_while_recovering() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"));
        let state = ExecutionState {
            is_recovering: true,
            reboot_count: 1,
            ..ExecutionState::default()
        };
        store.save(&state).unwrap();

        assert!(clear_checkpoint(&store, false).is_err());
        assert!(store.exists());
        clear_checkpoint(&store, true).unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn check_config_reports_every_issue() {
        let json = check_config("powercycle", &["cycle_count=25".to_string()]).unwrap();
        assert!(json.contains("\"cycle_count\": 25"));

        let err = check_config(
            "smartcheck",
            &["dut_id=42".to_string(), "bogus=1".to_string()],
        )
        .unwrap_err()
        .to_string();
        assert!(err.starts_with("2 invalid parameter(s)"));
        assert!(err.contains("dut_id"));
        assert!(err.contains("bogus"));

        let err = check_config("memtest", &[]).unwrap_err().to_string();
        assert!(err.contains("unknown tool 'memtest'"));
        assert!(err.contains("burnin") && err.contains("powercycle"));
    }

    #[test]
    fn list_covers_builtin_tools() {
        let listing = list_tools();
        for tool in ["burnin", "smartcheck", "powercycle", "cdi"] {
            assert!(listing.lines().any(|l| l == tool));
        }
        assert!(listing.contains("test_drive_letter"));
    }
}
