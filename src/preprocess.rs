//! Parallel preprocessing: initial tests and mutants per target.
//!
//! Before the main loop starts, every scanned target gets one shot at
//! initial test generation and one at initial mutant generation, with up
//! to `preprocessing.max_workers` targets in flight at once. Workers are
//! side-effect free with respect to the workspace: each compiles its
//! candidate tests in its own ephemeral target sandbox and returns results
//! by value. The planner, as the single writer, merges accepted artifacts
//! into the workspace afterwards, one target at a time.
//!
//! Mutants are generated here even for targets that have no tests yet;
//! against an empty test set they trivially survive, which is exactly
//! what gives the first refinement cycle something to work on.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::RuntimeContext;
use crate::knowledge::{ChunkKind, RetrievalFilters};
use crate::llm::prompt::{
    self, GeneratedMutants, GeneratedTests, PromptRole, parse_generated_mutants,
    parse_generated_tests,
};
use crate::model::{Target, TargetId};
use crate::planner::testfile;
use crate::sandbox::WorkspaceSandbox;

/// What one preprocessing worker produced for its target.
#[derive(Debug)]
pub struct PreprocessOutcome {
    pub target: TargetId,
    /// Initial tests that compiled and passed in the worker's sandbox.
    pub tests: Option<GeneratedTests>,
    /// Proposed initial mutants; bounds are validated at integration.
    pub mutants: Option<GeneratedMutants>,
    /// LLM calls this worker spent.
    pub llm_calls: u32,
}

/// Runs the preprocessing phase over all targets with bounded parallelism.
/// Results come back sorted by target id, so integration order is
/// deterministic regardless of completion order.
pub async fn preprocess_targets(
    ctx: &RuntimeContext,
    workspace: &WorkspaceSandbox,
    targets: &[Target],
    cancel: &CancellationToken,
) -> Vec<PreprocessOutcome> {
    let max_workers = ctx.config.preprocessing.max_workers;
    info!(targets = targets.len(), max_workers, "preprocessing phase starting");

    let semaphore = tokio::sync::Semaphore::new(max_workers);
    let results: std::sync::Mutex<Vec<PreprocessOutcome>> = std::sync::Mutex::new(Vec::new());

    tokio_scoped::scope(|scope| {
        for (index, target) in targets.iter().enumerate() {
            let semaphore = &semaphore;
            let results = &results;
            scope.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if cancel.is_cancelled() {
                    return;
                }
                let outcome = preprocess_one(ctx, workspace, target, index).await;
                if let Ok(mut guard) = results.lock() {
                    guard.push(outcome);
                }
            });
        }
    });

    let mut outcomes = results.into_inner().unwrap_or_default();
    outcomes.sort_by(|a, b| a.target.cmp(&b.target));
    info!(
        with_tests = outcomes.iter().filter(|o| o.tests.is_some()).count(),
        with_mutants = outcomes.iter().filter(|o| o.mutants.is_some()).count(),
        "preprocessing phase complete"
    );
    outcomes
}

/// One worker: generate initial tests, probe them in an isolated sandbox,
/// then generate initial mutants. Failures degrade the outcome instead of
/// failing the phase.
async fn preprocess_one(
    ctx: &RuntimeContext,
    workspace: &WorkspaceSandbox,
    target: &Target,
    index: usize,
) -> PreprocessOutcome {
    let mut outcome = PreprocessOutcome {
        target: target.id.clone(),
        tests: None,
        mutants: None,
        llm_calls: 0,
    };

    match generate_initial_tests(ctx, workspace, target, index, &mut outcome.llm_calls).await {
        Ok(tests) => outcome.tests = Some(tests),
        Err(e) => {
            warn!(target = %target.id, error_kind = e.kind(), "initial test generation failed");
        }
    }

    match generate_initial_mutants(ctx, target, &mut outcome.llm_calls).await {
        Ok(mutants) => outcome.mutants = Some(mutants),
        Err(e) => {
            warn!(target = %target.id, error_kind = e.kind(), "initial mutant generation failed");
        }
    }

    outcome
}

async fn generate_initial_tests(
    ctx: &RuntimeContext,
    workspace: &WorkspaceSandbox,
    target: &Target,
    index: usize,
    llm_calls: &mut u32,
) -> crate::error::Result<GeneratedTests> {
    let query = format!(
        "{} {}",
        target.signature,
        target.javadoc.as_deref().unwrap_or_default()
    );
    let context = ctx
        .knowledge
        .retrieve(
            &query,
            &RetrievalFilters {
                kind: Some(ChunkKind::Contract),
                target_class: Some(target.id.class_fqn.clone()),
                tags_any: vec![],
            },
            ctx.config.knowledge.top_k_contracts,
        )
        .await;

    let role = PromptRole::GenTestsInitial;
    let user_prompt = prompt::render_tests_prompt(role, target, &context, &[]);
    *llm_calls += 1;
    let response = ctx.llm.complete(role.system_prompt(), &user_prompt).await?;
    let generated = parse_generated_tests(&response)?;

    let candidate = testfile::render_test_class(&target.id, &generated.imports, &generated.tests);
    ctx.analyzer.validate_test_source(&candidate).await?;

    // Probe in isolation: the candidate test file overlays the sandbox's
    // symlink view, and the workspace stays untouched until the planner
    // merges results serially.
    let relative = ctx
        .config
        .project
        .test_root
        .join(testfile::test_file_relative(&target.id));
    let sandbox = ctx
        .sandboxes
        .acquire_target_sandbox(workspace, &format!("seed-{index}"), &relative)
        .await?;
    let path = sandbox.path().join(&relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &candidate).await?;

    let compile = ctx.driver.compile_tests(sandbox.path()).await?;
    if !compile.success {
        return Err(crate::error::Error::BuildFailed(
            "initial tests do not compile".into(),
        ));
    }
    let test_class = target.id.test_class_name();
    let run = ctx
        .driver
        .run_tests(sandbox.path(), Some(test_class.as_str()))
        .await?;
    if run.any_failed() || !run.build.success {
        return Err(crate::error::Error::BaselineRegressed(
            "initial tests fail against the unmutated code".into(),
        ));
    }

    debug!(target = %target.id, tests = generated.tests.len(), "initial tests probe passed");
    Ok(generated)
}

async fn generate_initial_mutants(
    ctx: &RuntimeContext,
    target: &Target,
    llm_calls: &mut u32,
) -> crate::error::Result<GeneratedMutants> {
    let query = format!(
        "{} {}",
        target.signature,
        target.facts.boundary_checks.join(" ")
    );
    let context = ctx
        .knowledge
        .retrieve(
            &query,
            &RetrievalFilters {
                kind: Some(ChunkKind::Contract),
                target_class: Some(target.id.class_fqn.clone()),
                tags_any: vec![],
            },
            ctx.config.knowledge.top_k_contracts,
        )
        .await;

    let role = PromptRole::GenMutantsInitial;
    let user_prompt = prompt::render_mutants_prompt(role, target, &context, &[]);
    *llm_calls += 1;
    let response = ctx.llm.complete(role.system_prompt(), &user_prompt).await?;
    parse_generated_mutants(&response)
}
