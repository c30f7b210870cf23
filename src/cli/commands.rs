//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - declarative infrastructure reconciliation.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the settings file.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the declarations file (overrides the settings).
    #[arg(short, long, global = true, env = "CONVERGE_DECLARATIONS")]
    pub declarations: Option<PathBuf>,

    /// Workspace to operate on (defaults to the selected workspace).
    #[arg(short, long, global = true)]
    pub workspace: Option<String>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate settings and declarations.
    Validate,

    /// Compute and display a plan.
    Plan {
        /// Save the plan to a file for a later apply.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Read live objects before planning.
        #[arg(long)]
        refresh: Option<bool>,

        /// Plan the destruction of every managed instance.
        #[arg(long)]
        destroy: bool,
    },

    /// Apply a saved plan, or plan and apply.
    Apply {
        /// Saved plan to apply.
        plan: Option<PathBuf>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum provider operations in flight.
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Destroy every managed instance.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check recorded state against live objects.
    Refresh {
        /// Write the live values to state.
        #[arg(long)]
        accept: bool,
    },

    /// Inspect or edit recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Adopt an existing remote object.
    Import {
        /// Address to record the object under.
        address: String,

        /// Remote object identifier.
        id: String,
    },

    /// Manage workspaces.
    Workspace {
        /// Workspace subcommand.
        #[command(subcommand)]
        command: WorkspaceCommands,
    },

    /// Remove a stuck state lock.
    ForceUnlock {
        /// Lock ID to remove.
        lock_id: String,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List recorded instances.
    List {
        /// Only list instances under this address.
        prefix: Option<String>,
    },

    /// Show one recorded instance.
    Show {
        /// Instance address.
        address: String,
    },

    /// Move recorded instances to a new address.
    Mv {
        /// Source address.
        from: String,

        /// Destination address.
        to: String,
    },

    /// Forget recorded instances without deleting them.
    Rm {
        /// Address to forget.
        address: String,
    },
}

/// Workspace subcommands.
#[derive(Subcommand, Debug)]
pub enum WorkspaceCommands {
    /// Create a workspace.
    New {
        /// Workspace name.
        name: String,
    },

    /// Select a workspace.
    Select {
        /// Workspace name.
        name: String,
    },

    /// Delete an empty workspace.
    Delete {
        /// Workspace name.
        name: String,
    },

    /// List workspaces.
    List,

    /// Show the selected workspace.
    Show,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan() {
        let cli = Cli::try_parse_from(["converge", "-w", "prod", "plan", "--out", "p.json", "--refresh", "false"])
            .expect("parse");
        assert_eq!(cli.workspace.as_deref(), Some("prod"));
        match cli.command {
            Commands::Plan { out, refresh, destroy } => {
                assert_eq!(out, Some(PathBuf::from("p.json")));
                assert_eq!(refresh, Some(false));
                assert!(!destroy);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_state_mv() {
        let cli = Cli::try_parse_from(["converge", "state", "mv", "bucket.a", "bucket.b"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Mv { .. }
            }
        ));
    }

    #[test]
    fn test_parse_force_unlock() {
        let cli = Cli::try_parse_from(["converge", "force-unlock", "abc"]).expect("parse");
        assert!(matches!(cli.command, Commands::ForceUnlock { lock_id } if lock_id == "abc"));
    }
}
