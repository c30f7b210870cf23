//! Planning module.
//!
//! This module compares the declared graph with recorded (and optionally
//! refreshed) state and produces an ordered plan of changes.

mod diff;
mod plan;
#[allow(clippy::module_inception)]
mod planner;

pub use diff::{AttributeChange, DiffEngine, requires_replacement};
pub use plan::{Action, Change, Plan, PlanMode, PlanSummary, PlannedOutput};
pub use planner::{PlanOptions, Planner, Refreshed};
