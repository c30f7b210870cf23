//! CLI module for the converge tool.
//!
//! This module provides the command-line interface over the engine's
//! library API.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands, WorkspaceCommands};
pub use output::OutputFormatter;
