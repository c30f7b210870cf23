// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::too_many_arguments)]
#![warn(clippy::cognitive_complexity)]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A graph-driven reconciliation engine for declarative infrastructure.
//!
//! ## Overview
//!
//! Converge reads a set of resource declarations, compares them with the
//! recorded state of a workspace, and drives providers until the real
//! world matches:
//!
//! - Declarations reference each other's attributes; references become
//!   dependency edges in a DAG
//! - Plans are computed against a snapshot and can be saved, reviewed and
//!   applied later
//! - Apply walks the DAG in parallel with a bounded number of provider
//!   operations in flight, committing state after every node
//! - State lives in a locked backend (local directory, S3 or memory) with
//!   lineage and serial checks
//!
//! ## Modules
//!
//! - [`declaration`]: Declaration model, expressions and addresses
//! - [`graph`]: Expansion and dependency graph construction
//! - [`state`]: Snapshots, backends, locking and workspaces
//! - [`planner`]: Diffing and plan construction
//! - [`executor`]: Parallel plan execution
//! - [`drift`]: Drift detection against live objects
//! - [`provider`]: Provider contract and built-in providers
//! - [`engine`]: Library API tying everything together
//! - [`config`]: Settings and declaration loading
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! resources:
//!   - type: local_file
//!     name: motd
//!     arguments:
//!       filename:
//!         literal: motd.txt
//!       content:
//!         literal: hello
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod declaration;
pub mod drift;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, DeclarationHasher, Settings, SettingsValidator};
pub use declaration::{DeclarationSet, ResourceAddress, ResourceDeclaration};
pub use drift::{DriftDetector, DriftReport};
pub use engine::Engine;
pub use error::{CoreError, Result};
pub use executor::{ApplyReport, CancelHandle, Executor};
pub use graph::{Graph, GraphBuilder};
pub use planner::{Plan, PlanMode, Planner};
pub use provider::{InMemoryCloud, Provider, ProviderRegistry};
pub use state::{StateSnapshot, StateStore, Workspace};
