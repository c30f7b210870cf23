//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::declaration::Attributes;
use crate::drift::{DriftReport, DriftStatus};
use crate::executor::{ApplyOutcome, ApplyReport, NodeStatus};
use crate::planner::{Action, Plan, PlanMode};
use crate::state::{ResourceInstanceState, Workspace};

use super::commands::OutputFormat;

/// Placeholder shown instead of sensitive values.
const SENSITIVE: &str = "(sensitive)";

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply node row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// State listing row for table display.
#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Dependencies")]
    dependencies: usize,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Workspace {} matches the declarations.\n",
                "✓".green(),
                plan.workspace
            );
        }

        let mut output = String::new();
        let title = match plan.mode {
            PlanMode::Normal => "Plan",
            PlanMode::Destroy => "Destroy plan",
        };
        let _ = write!(
            output,
            "\n{title} for workspace {} (serial {})\n\n",
            plan.workspace.to_string().bold(),
            plan.base_serial
        );

        let rows: Vec<ChangeRow> = plan
            .actionable()
            .enumerate()
            .map(|(i, c)| ChangeRow {
                index: i + 1,
                action: Self::format_action(c.action, c.create_before_destroy),
                address: c.display_address(),
                reason: Self::truncate(c.reason.as_deref().unwrap_or(""), 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        for change in plan.actionable().filter(|c| !c.attribute_changes.is_empty()) {
            let _ = writeln!(output, "\n  {change}");
            for attribute in &change.attribute_changes {
                let _ = writeln!(output, "      {attribute}");
            }
        }

        if plan.mode == PlanMode::Normal && !plan.outputs.is_empty() {
            output.push_str("\nOutputs:\n");
            for (name, planned) in &plan.outputs {
                let value = match (&planned.value, planned.sensitive) {
                    (_, true) => SENSITIVE.to_string(),
                    (Some(value), false) => value.to_string(),
                    (None, false) => String::from("(known after apply)"),
                };
                let _ = writeln!(output, "   {name} = {value}");
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.destroy.to_string().red()
        );
        output
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&ApplyJson::from(report)).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = match report.outcome() {
                    ApplyOutcome::Complete => format!("{} Apply complete", "✓".green()),
                    ApplyOutcome::Partial if report.cancelled => {
                        format!("{} Apply cancelled", "⚠".yellow())
                    }
                    ApplyOutcome::Partial => format!("{} Apply partially failed", "✗".red()),
                };
                let _ = writeln!(
                    output,
                    ": {} committed, {} failed, {} cancelled (serial {})\n",
                    report.committed(),
                    report.failed(),
                    report.cancelled_nodes(),
                    report.serial
                );

                if !report.nodes.is_empty() {
                    let rows: Vec<NodeRow> = report
                        .nodes
                        .iter()
                        .map(|n| NodeRow {
                            address: n.deposed.as_ref().map_or_else(
                                || n.address.to_string(),
                                |key| format!("{} (deposed {key})", n.address),
                            ),
                            operation: n.operation.to_string(),
                            status: Self::format_status(n.status),
                            error: Self::truncate(n.error.as_deref().unwrap_or(""), 50),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !report.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    for (name, state) in &report.outputs {
                        let value = if state.sensitive {
                            SENSITIVE.to_string()
                        } else {
                            state.value.to_string()
                        };
                        let _ = writeln!(output, "   {name} = {value}");
                    }
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport, accepted: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if !report.has_drift() {
                    return format!(
                        "{} No drift detected across {} instance(s).\n",
                        "✓".green(),
                        report.instances.len()
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for drift in report.drifted() {
                    let status = match drift.status {
                        DriftStatus::Gone => "gone".red().to_string(),
                        _ => "drifted".yellow().to_string(),
                    };
                    let _ = writeln!(output, "   {} ({status})", drift.address);
                    for change in &drift.changes {
                        let _ = writeln!(output, "       {change}");
                    }
                }
                let _ = write!(
                    output,
                    "\n{} drifted, {} gone.",
                    report.count(DriftStatus::Drifted),
                    report.count(DriftStatus::Gone)
                );
                if accepted {
                    let _ = writeln!(output, " Live values recorded at serial {}.", report.serial);
                } else {
                    output.push_str(" Run `converge refresh --accept` to record the live values.\n");
                }
                output
            }
        }
    }

    /// Formats a state listing.
    #[must_use]
    pub fn format_instances(&self, instances: &[ResourceInstanceState]) -> String {
        match self.format {
            OutputFormat::Json => {
                let addresses: Vec<String> = instances.iter().map(ResourceInstanceState::display_address).collect();
                serde_json::to_string_pretty(&addresses).unwrap_or_default()
            }
            OutputFormat::Text => {
                if instances.is_empty() {
                    return String::from("No instances recorded.\n");
                }
                let rows: Vec<InstanceRow> = instances
                    .iter()
                    .map(|r| InstanceRow {
                        address: r.display_address(),
                        id: r
                            .attributes
                            .get("id")
                            .map_or_else(String::new, |v| v.as_str().map_or_else(|| v.to_string(), String::from)),
                        dependencies: r.dependencies.len(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats one recorded instance, hiding sensitive values.
    #[must_use]
    pub fn format_instance(&self, instance: &ResourceInstanceState) -> String {
        let attributes = masked(&instance.attributes, instance);
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "address": instance.display_address(),
                    "schema_version": instance.schema_version,
                    "attributes": attributes,
                    "dependencies": instance.dependencies,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("# {}\n", instance.display_address().bold());
                for (name, value) in &attributes {
                    let _ = writeln!(output, "   {name} = {value}");
                }
                if !instance.dependencies.is_empty() {
                    output.push_str("\n   depends on:\n");
                    for dependency in &instance.dependencies {
                        let _ = writeln!(output, "     - {dependency}");
                    }
                }
                output
            }
        }
    }

    /// Formats the workspace list, marking the selected one.
    #[must_use]
    pub fn format_workspaces(&self, workspaces: &[Workspace], current: &Workspace) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "current": current, "workspaces": workspaces });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for workspace in workspaces {
                    if workspace == current {
                        let _ = writeln!(output, "* {}", workspace.to_string().green());
                    } else {
                        let _ = writeln!(output, "  {workspace}");
                    }
                }
                output
            }
        }
    }

    /// Formats an action with color.
    fn format_action(action: Action, create_before_destroy: bool) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::UpdateInPlace => "~update".yellow().to_string(),
            Action::Replace if create_before_destroy => "+/-replace".yellow().to_string(),
            Action::Replace => "-/+replace".yellow().to_string(),
            Action::Destroy => "-destroy".red().to_string(),
            Action::NoOp => "no-op".dimmed().to_string(),
        }
    }

    /// Formats a node status with color.
    fn format_status(status: NodeStatus) -> String {
        match status {
            NodeStatus::Committed => "committed".green().to_string(),
            NodeStatus::Failed => "failed".red().to_string(),
            NodeStatus::Cancelled => "cancelled".yellow().to_string(),
            other => other.to_string().dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, symbol: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{symbol} {message}"),
        }
    }
}

/// Attributes with sensitive values replaced.
fn masked(attributes: &Attributes, instance: &ResourceInstanceState) -> Attributes {
    attributes
        .iter()
        .map(|(name, value)| {
            let shown = if instance.sensitive_attributes.contains(name) {
                Value::String(SENSITIVE.to_string())
            } else {
                value.clone()
            };
            (name.clone(), shown)
        })
        .collect()
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    workspace: String,
    mode: PlanMode,
    base_serial: u64,
    fingerprint: String,
    changes: Vec<ChangeJson>,
    outputs: Vec<OutputJson>,
}

#[derive(serde::Serialize)]
struct ChangeJson {
    address: String,
    action: Action,
    reason: Option<String>,
    attributes: Vec<String>,
}

#[derive(serde::Serialize)]
struct OutputJson {
    name: String,
    value: Option<Value>,
    sensitive: bool,
}

#[derive(serde::Serialize)]
struct ApplyJson<'a> {
    outcome: ApplyOutcome,
    committed: usize,
    failed: usize,
    cancelled: usize,
    serial: u64,
    nodes: &'a [crate::executor::NodeReport],
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        Self {
            workspace: plan.workspace.to_string(),
            mode: plan.mode,
            base_serial: plan.base_serial,
            fingerprint: plan.fingerprint.clone(),
            changes: plan
                .actionable()
                .map(|c| ChangeJson {
                    address: c.display_address(),
                    action: c.action,
                    reason: c.reason.clone(),
                    attributes: c.attribute_changes.iter().map(ToString::to_string).collect(),
                })
                .collect(),
            outputs: plan
                .outputs
                .iter()
                .map(|(name, planned)| OutputJson {
                    name: name.clone(),
                    value: if planned.sensitive { None } else { planned.value.clone() },
                    sensitive: planned.sensitive,
                })
                .collect(),
        }
    }
}

impl<'a> From<&'a ApplyReport> for ApplyJson<'a> {
    fn from(report: &'a ApplyReport) -> Self {
        Self {
            outcome: report.outcome(),
            committed: report.committed(),
            failed: report.failed(),
            cancelled: report.cancelled_nodes(),
            serial: report.serial,
            nodes: &report.nodes,
        }
    }
}
