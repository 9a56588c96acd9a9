//! The planner agent: the scheduler driving the co-evolution loop.
//!
//! Each round the planner picks the target with the highest
//! expected-improvement score, chooses one action for it (generate tests,
//! refine tests against surviving mutants, generate mutants, or evaluate),
//! executes it against the live project, folds the outcome back into its
//! per-target state, and checks the stop conditions. A checkpoint is
//! written after every round; `--resume` rebuilds the queue from it
//! deterministically.
//!
//! # Round anatomy
//!
//! ```text
//! select_target ──► choose_action ──► act ──► update metrics ──► persist
//!       ▲                                                           │
//!       └────────────────── stop conditions not met ◄───────────────┘
//! ```
//!
//! Generation actions consume retrieval context from the knowledge base
//! and burn one LLM call each; the budget counter is incremented together
//! with the call, so a crash mid-call counts it as spent. Per-action
//! failures (malformed response, formatting, out-of-bounds patches, build
//! breakage during write-back) reject the artifact, burn the round, and
//! keep the loop going; only `config_invalid`, `external_tool_missing`,
//! and `internal_invariant` abort the run.

pub mod testfile;

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::evaluator::MutationEvaluator;
use crate::knowledge::{ChunkKind, RetrievalFilters};
use crate::llm::prompt::{
    self, GeneratedMutants, GeneratedTests, PromptRole, parse_generated_mutants,
    parse_generated_tests,
};
use crate::model::{
    BudgetCounter, CoverageSnapshot, Mutant, MutantStatus, MutationTally, Patch, SemanticTag,
    Target, TestCase, TestOrigin, TestStatus,
};
use crate::report;
use crate::sandbox::WorkspaceSandbox;
use crate::store::{Checkpoint, SchedulerEntry};

/// Metric changes below this threshold count as noise, not improvement.
pub const IMPROVEMENT_EPSILON: f64 = 0.01;

/// Rounds to wait before generating fresh mutants for the same target.
const MUTANT_COOLDOWN_ROUNDS: u32 = 2;

/// One atomic step the planner may take on a target in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GenerateTests,
    RefineTests,
    GenerateMutants,
    RunEvaluation,
    /// Nothing useful to do for this target right now.
    Skip,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::GenerateTests => "generate_tests",
            Action::RefineTests => "refine_tests",
            Action::GenerateMutants => "generate_mutants",
            Action::RunEvaluation => "run_evaluation",
            Action::Skip => "skip",
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxIterations,
    BudgetExhausted,
    NoImprovement,
    Excellence,
    QueueExhausted,
    Cancelled,
    /// A baseline check failed; evaluation results cannot be trusted.
    Unreliable,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::MaxIterations => "max_iterations",
            StopReason::BudgetExhausted => "llm_budget_exhausted",
            StopReason::NoImprovement => "no_improvement",
            StopReason::Excellence => "excellence",
            StopReason::QueueExhausted => "queue_exhausted",
            StopReason::Cancelled => "cancelled",
            StopReason::Unreliable => "evaluation_unreliable",
        }
    }

    /// Process exit code for this stop reason.
    pub fn exit_code(self) -> i32 {
        match self {
            StopReason::Cancelled => 2,
            StopReason::Unreliable => 3,
            _ => 0,
        }
    }
}

/// Everything the planner tracks for one target.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub target: Target,
    pub tests: Vec<TestCase>,
    pub mutants: Vec<Mutant>,
    pub line_coverage: f64,
    pub branch_coverage: f64,
    pub mutation_score: f64,
    pub sched: SchedulerEntry,
}

impl TargetState {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            tests: Vec::new(),
            mutants: Vec::new(),
            line_coverage: 0.0,
            branch_coverage: 0.0,
            mutation_score: 0.0,
            sched: SchedulerEntry::default(),
        }
    }

    pub fn active_tests(&self) -> Vec<TestCase> {
        self.tests.iter().filter(|t| t.is_active()).cloned().collect()
    }

    fn has_active_tests(&self) -> bool {
        self.tests.iter().any(|t| t.is_active())
    }

    fn surviving_mutants(&self) -> Vec<&Mutant> {
        // FIFO: mutant ids are monotonic, so ascending id is oldest-first.
        let mut surviving: Vec<&Mutant> = self
            .mutants
            .iter()
            .filter(|m| m.status == MutantStatus::Survived)
            .collect();
        surviving.sort_by_key(|m| m.id);
        surviving
    }

    fn has_evaluable_mutants(&self) -> bool {
        self.mutants.iter().any(|m| {
            matches!(
                m.status,
                MutantStatus::Pending
                    | MutantStatus::Valid
                    | MutantStatus::Survived
                    | MutantStatus::EvaluationError
            )
        })
    }

    fn refresh_mutation_score(&mut self) {
        self.mutation_score = MutationTally::of(&self.mutants).score();
    }
}

/// Expected-improvement score for target selection.
///
/// `w1*(1-mutation) + w2*(1-line) + w3*(1-branch) - w4*noop_penalty`,
/// where the penalty is the target's no-op streak normalized by the
/// no-improvement stop window.
pub fn selection_score(state: &TargetState, agent: &AgentConfig) -> f64 {
    let w = &agent.weights;
    let window = agent.stop_on_no_improvement_rounds.max(1) as f64;
    let penalty = (f64::from(state.sched.noop_streak) / window).min(1.0);
    w.w1 * (1.0 - state.mutation_score)
        + w.w2 * (1.0 - state.line_coverage)
        + w.w3 * (1.0 - state.branch_coverage)
        - w.w4 * penalty
}

/// Decision tree for the selected target: no tests → generate; surviving
/// mutants → refine; high mutation score and no recent mutants →
/// generate mutants; pending artifacts → evaluate; otherwise skip.
///
/// The one refinement the tree makes over that reading: a survivor set
/// that the previous refinement already targeted (and that no evaluation
/// has re-judged since) is not refined a second time — the pending
/// evaluation re-judges it first. Any change to the survivor set makes
/// the target refinable again immediately, whether or not other
/// artifacts are awaiting evaluation.
pub fn choose_action(state: &TargetState, round: u32, agent: &AgentConfig) -> Action {
    if !state.has_active_tests() {
        return Action::GenerateTests;
    }
    let surviving: Vec<u64> = state.surviving_mutants().iter().map(|m| m.id).collect();
    if !surviving.is_empty() && surviving != state.sched.refined_survivors {
        return Action::RefineTests;
    }
    let recently_generated = state
        .sched
        .last_mutant_round
        .is_some_and(|r| round.saturating_sub(r) < MUTANT_COOLDOWN_ROUNDS);
    if state.mutation_score >= agent.high_mutation_threshold && !recently_generated {
        return Action::GenerateMutants;
    }
    if state.sched.pending_evaluation && state.has_evaluable_mutants() {
        return Action::RunEvaluation;
    }
    Action::Skip
}

/// Picks the eligible target with the highest score. Ties break by fewer
/// rounds spent, then by target identifier ordering.
pub fn select_target(states: &[TargetState], round: u32, agent: &AgentConfig) -> Option<usize> {
    states
        .iter()
        .enumerate()
        .filter(|(_, s)| choose_action(s, round, agent) != Action::Skip)
        .max_by(|(_, a), (_, b)| {
            selection_score(a, agent)
                .partial_cmp(&selection_score(b, agent))
                .unwrap_or(std::cmp::Ordering::Equal)
                // max_by keeps the later element on Equal, so invert the
                // tie-break ordering: prefer fewer rounds, smaller id.
                .then_with(|| b.sched.rounds_spent.cmp(&a.sched.rounds_spent))
                .then_with(|| b.target.id.cmp(&a.target.id))
        })
        .map(|(i, _)| i)
}

/// Whether every target clears the excellence thresholds.
pub fn all_excellent(states: &[TargetState], agent: &AgentConfig) -> bool {
    let t = &agent.excellence_thresholds;
    !states.is_empty()
        && states.iter().all(|s| {
            s.mutation_score >= t.mutation_score
                && s.line_coverage >= t.line_coverage
                && s.branch_coverage >= t.branch_coverage
        })
}

/// Whether any metric rose by at least [`IMPROVEMENT_EPSILON`].
pub fn improved(before: (f64, f64, f64), after: (f64, f64, f64)) -> bool {
    after.0 - before.0 >= IMPROVEMENT_EPSILON
        || after.1 - before.1 >= IMPROVEMENT_EPSILON
        || after.2 - before.2 >= IMPROVEMENT_EPSILON
}

fn metrics_of(state: &TargetState) -> (f64, f64, f64) {
    (
        state.mutation_score,
        state.line_coverage,
        state.branch_coverage,
    )
}

/// The scheduler itself.
pub struct Planner<'a> {
    ctx: &'a RuntimeContext,
    workspace: WorkspaceSandbox,
    states: Vec<TargetState>,
    coverage_history: Vec<CoverageSnapshot>,
    budget: BudgetCounter,
    round: u32,
    next_mutant_id: u64,
}

impl<'a> Planner<'a> {
    /// Fresh planner over freshly scanned targets, sorted by identifier
    /// for deterministic queue order.
    pub fn new(ctx: &'a RuntimeContext, workspace: WorkspaceSandbox, targets: Vec<Target>) -> Self {
        let mut targets = targets;
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            ctx,
            workspace,
            states: targets.into_iter().map(TargetState::new).collect(),
            coverage_history: Vec::new(),
            budget: BudgetCounter::default(),
            round: 0,
            next_mutant_id: 1,
        }
    }

    /// Rebuilds a planner from a checkpoint. Queue order and all counters
    /// come back exactly as persisted.
    pub fn from_checkpoint(
        ctx: &'a RuntimeContext,
        workspace: WorkspaceSandbox,
        checkpoint: Checkpoint,
    ) -> Self {
        let Checkpoint {
            round,
            targets,
            active_tests,
            mutants,
            coverage_snapshots,
            budget,
            scheduler,
        } = checkpoint;

        let mut targets = targets;
        targets.sort_by(|a, b| a.id.cmp(&b.id));

        let next_mutant_id = mutants.iter().map(|m| m.id).max().map_or(1, |id| id + 1);
        let mut states: Vec<TargetState> = targets
            .into_iter()
            .map(|target| {
                let key = target.id.to_string();
                let mut state = TargetState::new(target);
                state.tests = active_tests
                    .iter()
                    .filter(|t| t.target == state.target.id)
                    .cloned()
                    .collect();
                state.mutants = mutants
                    .iter()
                    .filter(|m| m.target == state.target.id)
                    .cloned()
                    .collect();
                state.sched = scheduler.get(&key).cloned().unwrap_or_default();
                if let Some(snapshot) = coverage_snapshots
                    .iter()
                    .filter(|s| s.target == state.target.id)
                    .max_by_key(|s| s.round)
                {
                    state.line_coverage = snapshot.line_coverage;
                    state.branch_coverage = snapshot.branch_coverage;
                }
                state.refresh_mutation_score();
                state
            })
            .collect();
        states.sort_by(|a, b| a.target.id.cmp(&b.target.id));

        Self {
            ctx,
            workspace,
            states,
            coverage_history: coverage_snapshots,
            budget,
            round,
            next_mutant_id,
        }
    }

    /// Merges preprocessing results into the workspace and planner state,
    /// one target at a time (single-writer discipline). Test candidates go
    /// through the full write-back pipeline; a candidate that regresses
    /// the baseline is rejected here exactly as it would be mid-loop.
    pub async fn integrate_preprocessed(
        &mut self,
        outcomes: Vec<crate::preprocess::PreprocessOutcome>,
    ) -> Result<()> {
        for outcome in outcomes {
            self.budget.llm_calls_used += outcome.llm_calls;
            let Some(idx) = self
                .states
                .iter()
                .position(|s| s.target.id == outcome.target)
            else {
                continue;
            };
            let target = self.states[idx].target.clone();

            if let Some(tests) = outcome.tests {
                match self
                    .write_back_tests(idx, &target, tests, TestOrigin::Initial)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(
                        target = %target.id,
                        error_kind = e.kind(),
                        "initial tests rejected at integration"
                    ),
                }
            }

            if let Some(mutants) = outcome.mutants {
                if self.accept_mutants(idx, &target, mutants) > 0 {
                    let state = &mut self.states[idx];
                    state.sched.pending_evaluation = true;
                    state.sched.last_mutant_round = Some(self.round);
                }
            }
        }
        self.persist()
    }

    pub fn states(&self) -> &[TargetState] {
        &self.states
    }

    pub fn workspace(&self) -> &WorkspaceSandbox {
        &self.workspace
    }

    pub fn budget(&self) -> BudgetCounter {
        self.budget
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Snapshot of the full planner state for persistence.
    pub fn checkpoint(&self) -> Checkpoint {
        let mut scheduler = BTreeMap::new();
        for state in &self.states {
            scheduler.insert(state.target.id.to_string(), state.sched.clone());
        }
        Checkpoint {
            round: self.round,
            targets: self.states.iter().map(|s| s.target.clone()).collect(),
            active_tests: self
                .states
                .iter()
                .flat_map(|s| s.tests.iter().filter(|t| t.is_active()).cloned())
                .collect(),
            mutants: self
                .states
                .iter()
                .flat_map(|s| s.mutants.iter().cloned())
                .collect(),
            coverage_snapshots: self.coverage_history.clone(),
            budget: self.budget,
            scheduler,
        }
    }

    /// Runs the main loop until a stop condition fires.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<StopReason> {
        loop {
            if cancel.is_cancelled() {
                self.persist()?;
                return Ok(StopReason::Cancelled);
            }
            if let Some(stop) = self.stop_condition() {
                self.persist()?;
                info!(reason = stop.as_str(), round = self.round, "stopping");
                return Ok(stop);
            }
            let Some(idx) = select_target(&self.states, self.round, &self.ctx.config.agent) else {
                self.persist()?;
                info!(round = self.round, "no eligible targets left");
                return Ok(StopReason::QueueExhausted);
            };

            let action = choose_action(&self.states[idx], self.round, &self.ctx.config.agent);
            let acted = if action == Action::RunEvaluation {
                self.evaluation_batch(idx)
            } else {
                vec![idx]
            };
            self.round += 1;
            self.budget.rounds_used += 1;
            let calls_before = self.budget.llm_calls_used;
            let before: Vec<(f64, f64, f64)> =
                acted.iter().map(|&i| metrics_of(&self.states[i])).collect();

            let result = match action {
                Action::GenerateTests => self
                    .act_generate_tests(idx, PromptRole::GenTestsInitial)
                    .await
                    .map(|_| false),
                Action::RefineTests => self
                    .act_generate_tests(idx, PromptRole::GenTestsRefine)
                    .await
                    .map(|_| false),
                Action::GenerateMutants => self.act_generate_mutants(idx).await.map(|_| false),
                Action::RunEvaluation => self.act_run_evaluation(&acted, cancel).await,
                Action::Skip => Ok(false),
            };

            let (outcome, error_kind) = match result {
                Ok(true) => {
                    self.persist()?;
                    return Ok(StopReason::Unreliable);
                }
                Ok(false) => ("ok", None),
                Err(e) if e.is_fatal() => {
                    self.persist()?;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        target = %self.states[idx].target.id,
                        action = action.as_str(),
                        error_kind = e.kind(),
                        "action failed, artifact rejected"
                    );
                    ("rejected", Some(e.kind()))
                }
            };

            let mut any_improved = false;
            for (slot, &i) in acted.iter().enumerate() {
                let state = &mut self.states[i];
                let target_improved = improved(before[slot], metrics_of(state));
                any_improved |= target_improved;
                state.sched.rounds_spent += 1;
                if target_improved {
                    state.sched.noop_streak = 0;
                } else {
                    state.sched.noop_streak += 1;
                }
            }
            if any_improved {
                self.budget.last_improvement_round = self.round;
            }
            for &i in &acted {
                self.record_snapshot(i);
            }

            report::log_action(
                self.round,
                &self.states[idx].target.id,
                action.as_str(),
                outcome,
                error_kind,
                self.budget.llm_calls_used - calls_before,
            );
            self.persist()?;
        }
    }

    fn stop_condition(&self) -> Option<StopReason> {
        let agent = &self.ctx.config.agent;
        if self.budget.rounds_used >= agent.max_iterations {
            return Some(StopReason::MaxIterations);
        }
        if self.budget.llm_calls_used >= agent.budget_llm_calls {
            return Some(StopReason::BudgetExhausted);
        }
        if self.round > 0
            && self.round - self.budget.last_improvement_round
                >= agent.stop_on_no_improvement_rounds
        {
            return Some(StopReason::NoImprovement);
        }
        if all_excellent(&self.states, agent) {
            return Some(StopReason::Excellence);
        }
        None
    }

    /// The chosen target plus further evaluation-ready targets, up to the
    /// configured cross-target parallelism. Mutants within each target
    /// stay serialized; only distinct targets run concurrently.
    fn evaluation_batch(&self, chosen: usize) -> Vec<usize> {
        let agent = &self.ctx.config.agent;
        let mut batch = vec![chosen];
        let mut candidates: Vec<usize> = self
            .states
            .iter()
            .enumerate()
            .filter(|&(i, s)| {
                i != chosen && choose_action(s, self.round, agent) == Action::RunEvaluation
            })
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by(|&a, &b| {
            selection_score(&self.states[b], agent)
                .partial_cmp(&selection_score(&self.states[a], agent))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.states[a]
                        .sched
                        .rounds_spent
                        .cmp(&self.states[b].sched.rounds_spent)
                })
                .then_with(|| self.states[a].target.id.cmp(&self.states[b].target.id))
        });
        batch.extend(candidates.into_iter().take(agent.parallel_targets.saturating_sub(1)));
        batch
    }

    async fn act_generate_tests(&mut self, idx: usize, role: PromptRole) -> Result<()> {
        let target = self.states[idx].target.clone();
        let knowledge = &self.ctx.knowledge;
        let k_contracts = self.ctx.config.knowledge.top_k_contracts;
        let k_bugs = self.ctx.config.knowledge.top_k_bugs;

        let contract_query = format!(
            "{} {}",
            target.signature,
            target.javadoc.as_deref().unwrap_or_default()
        );
        let mut context = knowledge
            .retrieve(
                &contract_query,
                &RetrievalFilters {
                    kind: Some(ChunkKind::Contract),
                    target_class: Some(target.id.class_fqn.clone()),
                    tags_any: vec![],
                },
                k_contracts,
            )
            .await;

        let surviving: Vec<Mutant> = self.states[idx]
            .surviving_mutants()
            .into_iter()
            .cloned()
            .collect();
        if role == PromptRole::GenTestsRefine && !surviving.is_empty() {
            let bug_query = surviving_description(&surviving);
            context.extend(
                knowledge
                    .retrieve(
                        &bug_query,
                        &RetrievalFilters {
                            kind: Some(ChunkKind::BugReport),
                            target_class: None,
                            tags_any: bug_tags_for(&surviving),
                        },
                        k_bugs,
                    )
                    .await,
            );
        }

        let surviving_refs: Vec<&Mutant> = surviving.iter().collect();
        let user_prompt = prompt::render_tests_prompt(role, &target, &context, &surviving_refs);
        // Spent together with the call: a crash mid-flight counts it.
        self.budget.llm_calls_used += 1;
        let response = self.ctx.llm.complete(role.system_prompt(), &user_prompt).await?;
        let generated = parse_generated_tests(&response)?;

        let origin = match surviving.first() {
            Some(m) if role == PromptRole::GenTestsRefine => {
                TestOrigin::RefineForMutant { mutant_id: m.id }
            }
            _ => TestOrigin::Initial,
        };
        self.write_back_tests(idx, &target, generated, origin).await?;
        if role == PromptRole::GenTestsRefine {
            // These survivors now have tests aimed at them; the target is
            // not refinable again until an evaluation re-judges the set.
            self.states[idx].sched.refined_survivors =
                surviving.iter().map(|m| m.id).collect();
        }
        Ok(())
    }

    /// All-or-nothing write-back of generated tests (validate, format,
    /// merge, compile, baseline). Any failure restores the previous test
    /// file exactly and rejects every new test.
    async fn write_back_tests(
        &mut self,
        idx: usize,
        target: &Target,
        generated: GeneratedTests,
        origin: TestOrigin,
    ) -> Result<()> {
        let relative = self
            .ctx
            .config
            .project
            .test_root
            .join(testfile::test_file_relative(&target.id));
        let existing = self.workspace.read_file(&relative).await?;

        let (candidate, added) = match &existing {
            Some(source) => testfile::merge_test_methods(source, &generated.tests)?,
            None => {
                let names = generated.tests.iter().map(|t| t.method_name.clone()).collect();
                (
                    testfile::render_test_class(&target.id, &generated.imports, &generated.tests),
                    names,
                )
            }
        };
        if added.is_empty() {
            return Err(Error::LlmMalformedResponse(
                "every generated test duplicates an existing one".into(),
            ));
        }

        self.ctx.analyzer.validate_test_source(&candidate).await?;

        let snapshot = self.workspace.snapshot(&relative).await?;
        tracing::debug!(
            file = %relative.display(),
            digest = snapshot.digest.as_deref().unwrap_or("absent"),
            "test file snapshot taken"
        );
        self.workspace.write_file(&relative, &candidate).await?;

        let accept: Result<()> = async {
            let absolute = self.workspace.file(&relative);
            self.ctx.formatter.format_file(&absolute).await?;

            let compile = self.ctx.driver.compile_tests(self.workspace.path()).await?;
            if !compile.success {
                return Err(Error::BuildFailed(
                    "generated tests do not compile".into(),
                ));
            }

            // Baseline rule: the whole suite, not just this target's
            // class, must stay green on the unmutated workspace.
            let baseline = self.ctx.driver.run_tests(self.workspace.path(), None).await?;
            if baseline.any_failed() {
                return Err(Error::BaselineRegressed(
                    "a test fails against the unmutated baseline".into(),
                ));
            }
            if !baseline.build.success {
                return Err(Error::TestFailed(format!(
                    "baseline run errored (exit {})",
                    baseline.build.exit_code
                )));
            }
            Ok(())
        }
        .await;

        if let Err(e) = accept {
            self.workspace.restore(&snapshot).await?;
            return Err(e);
        }

        let state = &mut self.states[idx];
        for test in &generated.tests {
            if !added.contains(&test.method_name) {
                continue;
            }
            state.tests.push(TestCase {
                target: target.id.clone(),
                test_class_name: target.id.test_class_name(),
                test_method_name: test.method_name.clone(),
                source: test.source.clone(),
                created_round: self.round,
                origin: origin.clone(),
                status: TestStatus::Active,
            });
        }
        state.sched.pending_evaluation = true;
        info!(target = %target.id, added = added.len(), "tests accepted into workspace");

        self.refresh_coverage(idx).await;
        Ok(())
    }

    /// Best-effort coverage refresh after the suite changed.
    async fn refresh_coverage(&mut self, idx: usize) {
        match self.ctx.driver.run_tests_with_coverage(self.workspace.path()).await {
            Ok(outcome) => {
                if let Some(rates) = outcome.rates {
                    let state = &mut self.states[idx];
                    state.line_coverage = rates.line;
                    state.branch_coverage = rates.branch;
                }
            }
            Err(e) => warn!(error_kind = e.kind(), "coverage refresh failed"),
        }
    }

    async fn act_generate_mutants(&mut self, idx: usize) -> Result<()> {
        let target = self.states[idx].target.clone();
        let role = if self.states[idx].mutants.is_empty() {
            PromptRole::GenMutantsInitial
        } else {
            PromptRole::GenMutantsRefine
        };

        let contract_query = format!(
            "{} {}",
            target.signature,
            target.facts.boundary_checks.join(" ")
        );
        let mut context = self
            .ctx
            .knowledge
            .retrieve(
                &contract_query,
                &RetrievalFilters {
                    kind: Some(ChunkKind::Contract),
                    target_class: Some(target.id.class_fqn.clone()),
                    tags_any: vec![],
                },
                self.ctx.config.knowledge.top_k_contracts,
            )
            .await;
        context.extend(
            self.ctx
                .knowledge
                .retrieve(
                    &contract_query,
                    &RetrievalFilters {
                        kind: Some(ChunkKind::BugReport),
                        target_class: None,
                        tags_any: vec![],
                    },
                    self.ctx.config.knowledge.top_k_bugs,
                )
                .await,
        );

        let existing: Vec<&Mutant> = self.states[idx].mutants.iter().collect();
        let user_prompt = prompt::render_mutants_prompt(role, &target, &context, &existing);
        self.budget.llm_calls_used += 1;
        let response = self.ctx.llm.complete(role.system_prompt(), &user_prompt).await?;
        let generated = parse_generated_mutants(&response)?;

        let accepted = self.accept_mutants(idx, &target, generated);
        if accepted == 0 {
            return Err(Error::PatchOutOfBounds(
                "no proposed mutant fit the target's line range".into(),
            ));
        }
        let state = &mut self.states[idx];
        state.sched.pending_evaluation = true;
        state.sched.last_mutant_round = Some(self.round);
        info!(target = %target.id, accepted, "mutants accepted");
        Ok(())
    }

    /// Validates proposed mutants against the target and keeps the valid
    /// ones. Returns how many were accepted.
    fn accept_mutants(
        &mut self,
        idx: usize,
        target: &Target,
        generated: GeneratedMutants,
    ) -> usize {
        let mut accepted = 0;
        for proposal in generated.mutants {
            let patch = Patch {
                file_path: target.source_file.clone(),
                line_start: proposal.line_start,
                line_end: proposal.line_end,
                original: proposal.original,
                mutated: proposal.mutated,
            };
            if let Err(e) = patch.validate(target) {
                warn!(target = %target.id, error_kind = e.kind(), "mutant dropped");
                continue;
            }
            let id = self.next_mutant_id;
            self.next_mutant_id += 1;
            self.states[idx].mutants.push(Mutant {
                id,
                target: target.id.clone(),
                patch,
                tag: proposal.tag,
                status: MutantStatus::Pending,
                history: Vec::new(),
            });
            accepted += 1;
        }
        accepted
    }

    /// Evaluates the batch of targets concurrently (one task per target;
    /// each target's mutants run serialized inside its task). Returns
    /// `true` if any baseline was unreliable.
    async fn act_run_evaluation(
        &mut self,
        batch: &[usize],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let jobs: Vec<(usize, Target, Vec<TestCase>, Vec<Mutant>)> = batch
            .iter()
            .map(|&i| {
                let state = &mut self.states[i];
                (
                    i,
                    state.target.clone(),
                    state.active_tests(),
                    std::mem::take(&mut state.mutants),
                )
            })
            .collect();

        let results = {
            let evaluator =
                MutationEvaluator::new(&self.ctx.driver, &self.ctx.sandboxes, &self.workspace);
            let futures = jobs.into_iter().map(|(i, target, tests, mut mutants)| {
                let evaluator = &evaluator;
                async move {
                    let report = evaluator
                        .evaluate_target(&target, &tests, &mut mutants, cancel)
                        .await;
                    (i, mutants, report)
                }
            });
            futures::future::join_all(futures).await
        };

        let mut unreliable = false;
        let mut first_error = None;
        for (i, mutants, report) in results {
            let state = &mut self.states[i];
            state.mutants = mutants;
            match report {
                Ok(report) => {
                    if report.unreliable {
                        unreliable = true;
                        continue;
                    }
                    if !report.cancelled {
                        state.sched.pending_evaluation = false;
                        state.sched.refined_survivors.clear();
                    }
                    state.refresh_mutation_score();
                }
                Err(e) => {
                    warn!(target = %state.target.id, error_kind = e.kind(), "evaluation failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(unreliable)
    }

    fn record_snapshot(&mut self, idx: usize) {
        let state = &self.states[idx];
        self.coverage_history.push(CoverageSnapshot {
            target: state.target.id.clone(),
            round: self.round,
            line_coverage: state.line_coverage,
            branch_coverage: state.branch_coverage,
            mutation_score: state.mutation_score,
            tests_count: state.tests.iter().filter(|t| t.is_active()).count(),
        });
    }

    /// Mirrors the in-memory state to the durable store and checkpoint.
    fn persist(&self) -> Result<()> {
        let checkpoint = self.checkpoint();
        self.ctx.store.save_targets(&checkpoint.targets)?;
        self.ctx.store.save_tests(&checkpoint.active_tests)?;
        self.ctx.store.save_mutants(&checkpoint.mutants)?;
        self.ctx.store.save_coverage(&checkpoint.coverage_snapshots)?;
        self.ctx.store.save_budget(&checkpoint.budget)?;
        checkpoint.save(&self.ctx.checkpoint_path())
    }
}

/// Compact prose description of surviving mutants, used as the bug-report
/// retrieval query during refinement.
fn surviving_description(surviving: &[Mutant]) -> String {
    surviving
        .iter()
        .map(|m| {
            format!(
                "{} {} -> {}",
                bug_tag_name(m.tag).unwrap_or("fault"),
                m.patch.original.trim(),
                m.patch.mutated.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Bug-report tags matching the surviving mutants' semantic tags.
fn bug_tags_for(surviving: &[Mutant]) -> Vec<String> {
    let mut tags: Vec<String> = surviving
        .iter()
        .filter_map(|m| bug_tag_name(m.tag))
        .map(str::to_string)
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

fn bug_tag_name(tag: SemanticTag) -> Option<&'static str> {
    match tag {
        SemanticTag::NullCheckRemoved => Some("null-check"),
        SemanticTag::BoundaryFlipped | SemanticTag::OffByOne => Some("boundary"),
        SemanticTag::ReturnValueChanged => Some("validation"),
        SemanticTag::ExceptionSwallowed => Some("validation"),
        SemanticTag::OperatorSwapped | SemanticTag::Other => None,
    }
}
