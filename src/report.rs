//! Structured action logging and the exit summary.
//!
//! Every planner action emits exactly one INFO event with a fixed field
//! set, so a run can be audited from its logs alone. At exit the run
//! prints a per-target table and writes the same data to `summary.json`
//! in the state directory.

use console::style;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{BudgetCounter, MutationTally, TargetId};
use crate::planner::{StopReason, TargetState};

/// Emits the per-action structured log line:
/// `{round, target, action, outcome, error_kind?, llm_calls_delta}`.
pub fn log_action(
    round: u32,
    target: &TargetId,
    action: &str,
    outcome: &str,
    error_kind: Option<&str>,
    llm_calls_delta: u32,
) {
    match error_kind {
        Some(kind) => tracing::info!(
            round,
            target = %target,
            action,
            outcome,
            error_kind = kind,
            llm_calls_delta,
            "action"
        ),
        None => tracing::info!(
            round,
            target = %target,
            action,
            outcome,
            llm_calls_delta,
            "action"
        ),
    }
}

/// Per-target block of the exit summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub target: String,
    pub tests: usize,
    pub mutants_killed: usize,
    pub mutants_survived: usize,
    pub mutants_invalid: usize,
    pub mutation_score: f64,
    pub line_coverage: f64,
    pub branch_coverage: f64,
}

/// The whole run, condensed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub stop_reason: String,
    pub rounds_used: u32,
    pub llm_calls_used: u32,
    pub last_improvement_round: u32,
    pub targets: Vec<TargetSummary>,
}

/// Condenses final planner state into the exit summary.
pub fn build_summary(
    states: &[TargetState],
    budget: BudgetCounter,
    stop: StopReason,
) -> RunSummary {
    RunSummary {
        stop_reason: stop.as_str().to_string(),
        rounds_used: budget.rounds_used,
        llm_calls_used: budget.llm_calls_used,
        last_improvement_round: budget.last_improvement_round,
        targets: states
            .iter()
            .map(|state| {
                let tally = MutationTally::of(&state.mutants);
                TargetSummary {
                    target: state.target.id.to_string(),
                    tests: state.tests.iter().filter(|t| t.is_active()).count(),
                    mutants_killed: tally.killed,
                    mutants_survived: tally.survived,
                    mutants_invalid: tally.invalid,
                    mutation_score: tally.score(),
                    line_coverage: state.line_coverage,
                    branch_coverage: state.branch_coverage,
                }
            })
            .collect(),
    }
}

/// Prints the summary table to stdout.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{} (stop: {})",
        style("Run complete").bold(),
        style(&summary.stop_reason).cyan()
    );
    println!(
        "  rounds: {}   llm calls: {}   last improvement: round {}",
        summary.rounds_used, summary.llm_calls_used, summary.last_improvement_round
    );
    println!();

    for target in &summary.targets {
        let score = format!("{:.0}%", target.mutation_score * 100.0);
        let score = if target.mutation_score >= 0.95 {
            style(score).green()
        } else if target.mutation_score >= 0.5 {
            style(score).yellow()
        } else {
            style(score).red()
        };
        println!(
            "  {}  tests {:>3}  killed {:>3}  survived {:>3}  mutation {}  line {:>5.1}%  branch {:>5.1}%",
            style(&target.target).bold(),
            target.tests,
            target.mutants_killed,
            target.mutants_survived,
            score,
            target.line_coverage * 100.0,
            target.branch_coverage * 100.0,
        );
    }
    println!();
}

/// Persists the summary next to the checkpoint.
pub fn save_summary(summary: &RunSummary, path: &std::path::Path) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| Error::InternalInvariant(format!("serialize summary: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}
