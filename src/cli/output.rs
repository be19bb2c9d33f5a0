//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::executor::ApplyResult;
use crate::planner::{OperationKind, Plan, ReplaceOrder};
use crate::reconciler::{DriftReport, RefreshReport};
use crate::state::StateSnapshot;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Instance row for state listings.
#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the configuration ({} unchanged).\n",
                "✓".green(),
                plan.unchanged
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution plan");
        let _ = writeln!(
            output,
            "   Config hash: {}",
            ConfigHasher::new().short_hash(&plan.config_hash)
        );
        let _ = writeln!(output, "   Base serial: {}\n", plan.base_serial);

        let rows: Vec<OperationRow> = plan
            .operations
            .iter()
            .map(|op| OperationRow {
                index: op.index,
                action: Self::format_action(op.kind, op.replacement, op.deposed),
                instance: op.instance.to_string(),
                after: op
                    .depends_on
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                reason: Self::truncate(&op.reason, 60),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nAttribute changes:\n");
            for op in plan.operations.iter().filter(|op| op.kind != OperationKind::Destroy) {
                if op.diff.attributes.is_empty() {
                    continue;
                }
                let _ = writeln!(output, "  {}", op.instance.to_string().bold());
                for change in &op.diff.attributes {
                    let old = change.old.as_ref().map_or_else(String::new, ToString::to_string);
                    let new = change
                        .new
                        .as_ref()
                        .map_or_else(|| String::from("(removed)"), ToString::to_string);
                    let _ = writeln!(
                        output,
                        "    {} {}: {old} => {new}",
                        change.action.symbol(),
                        change.path
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to destroy ({} replacement(s), {} unchanged)\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.destroy_count().to_string().red(),
            plan.replace_count(),
            plan.unchanged
        );
        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_apply(&self, result: &ApplyResult) -> String {
        match self.format {
            OutputFormat::Json => Self::json(result),
            OutputFormat::Text => {
                let status = if result.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else if result.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply finished with errors", "✗".red())
                };

                let mut output = format!("{status}: {result}\n");
                for done in &result.completed {
                    let note = done.note.as_deref().map_or_else(String::new, |n| format!(" ({n})"));
                    let _ = writeln!(
                        output,
                        "   {} {} {}{note}",
                        "✓".green(),
                        done.kind,
                        done.instance
                    );
                }
                for failed in &result.failed {
                    let _ = writeln!(output, "   {} {}", "✗".red(), failed.message);
                }
                for skipped in &result.skipped {
                    let _ = writeln!(
                        output,
                        "   {} {} {} skipped: {}",
                        "-".dimmed(),
                        skipped.kind,
                        skipped.instance,
                        skipped.reason
                    );
                }
                if let Some(serial) = result.serial {
                    let _ = writeln!(output, "\nState serial: {serial}");
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let marker = if report.is_converged() {
                    "✓".green()
                } else {
                    "⚠".yellow()
                };
                format!("{marker} {report}\n")
            }
        }
    }

    /// Formats a refresh report.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let mut output = format!("{} {report}\n", "✓".green());
                if !report.drift.is_converged() {
                    let _ = writeln!(output, "{}", report.drift);
                }
                output
            }
        }
    }

    /// Formats validation findings.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
                "resources": result.desired.len(),
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!(
                        "{} Configuration is valid ({} resource(s))\n",
                        "✓".green(),
                        result.desired.len()
                    )
                } else {
                    format!(
                        "{} Configuration has {} error(s):\n",
                        "✗".red(),
                        result.error_count()
                    )
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {error}");
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(
                        output,
                        "\n{} Warnings ({}):",
                        "⚠".yellow(),
                        result.warning_count()
                    );
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats the stored state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState {}", state.lineage);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Instances: {}", state.instances.len());
                let _ = writeln!(output, "   Tainted: {}", state.tainted.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success {
                            "✓".green()
                        } else {
                            "✗".red()
                        };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} completed, {} failed, {} skipped)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.completed,
                            entry.failed,
                            entry.skipped
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats the recorded instances as a table.
    #[must_use]
    pub fn format_instances(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&state.instances),
            OutputFormat::Text => {
                if state.instances.is_empty() {
                    return String::from("No instances recorded.\n");
                }
                let rows: Vec<InstanceRow> = state
                    .instances
                    .iter()
                    .map(|(id, instance)| InstanceRow {
                        instance: id.to_string(),
                        id: instance.id.clone(),
                        dependencies: instance
                            .dependencies
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                        status: if state.is_tainted(id) {
                            "tainted".red().to_string()
                        } else if instance.deposed.is_empty() {
                            "ok".green().to_string()
                        } else {
                            format!("{} deposed", instance.deposed.len()).yellow().to_string()
                        },
                        updated: instance.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    fn format_action(kind: OperationKind, replacement: Option<ReplaceOrder>, deposed: bool) -> String {
        match (kind, replacement, deposed) {
            (OperationKind::Destroy, _, true) => "-deposed".red().to_string(),
            (OperationKind::Create, Some(_), _) => "+replace".green().to_string(),
            (OperationKind::Destroy, Some(_), _) => "-replace".red().to_string(),
            (OperationKind::Create, None, _) => "+create".green().to_string(),
            (OperationKind::Update, _, _) => "~update".yellow().to_string(),
            (OperationKind::Destroy, None, _) => "-destroy".red().to_string(),
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
}
