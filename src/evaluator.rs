//! Mutation evaluator.
//!
//! For one target and its current active tests, classifies every submitted
//! mutant as killed or survived. The cycle starts with a baseline check of
//! the unmutated workspace; if the target's own tests do not pass there,
//! nothing a mutant does is meaningful and the whole cycle is reported
//! unreliable.
//!
//! Each mutant is evaluated FIFO in a fresh ephemeral sandbox (a shallow
//! symlink view of the workspace with only the mutated file materialized):
//! patch, compile production sources, compile tests, run the target's
//! tests.
//! Compile failures mark the mutant invalid. A test runner that errors
//! (rather than failing a test) is retried once, then the mutant is
//! parked as unknown. Mutants of one target are strictly serialized.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{BuildDriver, TestCaseResult, TestRunOutcome};
use crate::error::Result;
use crate::model::{EvaluationRun, Mutant, MutantStatus, Target, TestCase, TestVerdict};
use crate::sandbox::{SandboxManager, WorkspaceSandbox};

/// Outcome of one evaluation cycle over a target's mutants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationReport {
    pub evaluated: usize,
    pub killed: usize,
    pub survived: usize,
    pub invalid: usize,
    pub errored: usize,
    /// Baseline check failed; every result of this cycle is void.
    pub unreliable: bool,
    /// The cycle was cancelled before finishing.
    pub cancelled: bool,
}

/// How one test phase classified a mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Killed,
    Survived,
    RunnerError,
}

/// Evaluates mutants against the live project.
pub struct MutationEvaluator<'a> {
    driver: &'a BuildDriver,
    sandboxes: &'a SandboxManager,
    workspace: &'a WorkspaceSandbox,
}

impl<'a> MutationEvaluator<'a> {
    pub fn new(
        driver: &'a BuildDriver,
        sandboxes: &'a SandboxManager,
        workspace: &'a WorkspaceSandbox,
    ) -> Self {
        Self {
            driver,
            sandboxes,
            workspace,
        }
    }

    /// Runs one evaluation cycle for `target`, mutating the status and
    /// history of each entry in `mutants` in place.
    ///
    /// Only mutants in a re-evaluable status (`pending`, `valid`,
    /// `survived`, `evaluation_error`) are touched; killed, invalid, and
    /// unknown statuses are sticky.
    pub async fn evaluate_target(
        &self,
        target: &Target,
        active_tests: &[TestCase],
        mutants: &mut [Mutant],
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport> {
        let mut report = EvaluationReport::default();
        let test_class = target.id.test_class_name();

        // Baseline rule: with no active tests there is nothing to check and
        // every valid mutant trivially survives; otherwise the target's
        // tests must pass on the unmutated workspace first.
        if !active_tests.is_empty() {
            let baseline = self
                .driver
                .run_tests(self.workspace.path(), Some(test_class.as_str()))
                .await?;
            if !baseline_passes(&baseline, &test_class) {
                warn!(target = %target.id, "baseline check failed, evaluation unreliable");
                report.unreliable = true;
                return Ok(report);
            }
        }

        for mutant in mutants.iter_mut() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !matches!(
                mutant.status,
                MutantStatus::Pending
                    | MutantStatus::Valid
                    | MutantStatus::Survived
                    | MutantStatus::EvaluationError
            ) {
                continue;
            }

            report.evaluated += 1;
            let status = self.evaluate_one(mutant, &test_class).await?;
            mutant.status = status;
            match status {
                MutantStatus::Killed => report.killed += 1,
                MutantStatus::Survived => report.survived += 1,
                MutantStatus::Invalid => report.invalid += 1,
                MutantStatus::Unknown => report.errored += 1,
                _ => {}
            }
            debug!(target = %target.id, mutant = mutant.id, status = ?status, "mutant evaluated");
        }

        info!(
            target = %target.id,
            evaluated = report.evaluated,
            killed = report.killed,
            survived = report.survived,
            invalid = report.invalid,
            "evaluation cycle complete"
        );
        Ok(report)
    }

    /// Evaluates one mutant, retrying a runner error once before parking
    /// the mutant as unknown.
    async fn evaluate_one(&self, mutant: &mut Mutant, test_class: &str) -> Result<MutantStatus> {
        let first = self.attempt(mutant, test_class).await?;
        if first != MutantStatus::EvaluationError {
            return Ok(first);
        }
        warn!(mutant = mutant.id, "runner error, retrying evaluation once");
        let second = self.attempt(mutant, test_class).await?;
        Ok(if second == MutantStatus::EvaluationError {
            MutantStatus::Unknown
        } else {
            second
        })
    }

    /// One full attempt in a fresh sandbox. The sandbox is released on
    /// every path out of this function.
    async fn attempt(&self, mutant: &mut Mutant, test_class: &str) -> Result<MutantStatus> {
        let sandbox = self
            .sandboxes
            .acquire_target_sandbox(
                self.workspace,
                &format!("mutant-{}", mutant.id),
                &mutant.patch.file_path,
            )
            .await?;

        if let Err(e) = sandbox.apply_patch(&mutant.patch).await {
            debug!(mutant = mutant.id, error_kind = e.kind(), "patch rejected");
            return Ok(MutantStatus::Invalid);
        }

        let compile = self.driver.compile(sandbox.path()).await?;
        if !compile.success {
            return Ok(MutantStatus::Invalid);
        }

        let compile_tests = self.driver.compile_tests(sandbox.path()).await?;
        if !compile_tests.success {
            return Ok(MutantStatus::Invalid);
        }

        let run = self
            .driver
            .run_tests(sandbox.path(), Some(test_class))
            .await?;
        let target_results = results_for_class(&run.tests, test_class);

        mutant.history.push(EvaluationRun {
            outcomes: target_results
                .iter()
                .map(|r| (r.method_name.clone(), r.verdict))
                .collect(),
            wall_time_ms: run.build.wall_time.as_millis() as u64,
            exit_code: run.build.exit_code,
            at: Utc::now(),
        });

        Ok(match classify_test_phase(&run, &target_results) {
            Classification::Killed => MutantStatus::Killed,
            Classification::Survived => MutantStatus::Survived,
            Classification::RunnerError => MutantStatus::EvaluationError,
        })
    }
}

/// The baseline passes when the phase ran and no target test failed.
fn baseline_passes(run: &TestRunOutcome, test_class: &str) -> bool {
    if run.build.is_timeout() {
        return false;
    }
    let target_results = results_for_class(&run.tests, test_class);
    if run.build.success {
        return target_results.iter().all(|r| r.verdict == TestVerdict::Pass);
    }
    // Non-zero exit with parsed failures is a plain test failure; without
    // any parsed result it is a build problem either way.
    false
}

/// Classifies a mutant from its test phase.
fn classify_test_phase(
    run: &TestRunOutcome,
    target_results: &[&TestCaseResult],
) -> Classification {
    if run.build.is_timeout() {
        return Classification::RunnerError;
    }
    if target_results
        .iter()
        .any(|r| r.verdict != TestVerdict::Pass)
    {
        return Classification::Killed;
    }
    if run.build.success {
        // All target tests passed (or none exist): the fault slipped by.
        return Classification::Survived;
    }
    // The runner exited non-zero without reporting a failing target test:
    // unclassifiable.
    Classification::RunnerError
}

/// Results belonging to the target's test class, matched on the simple
/// class name regardless of package.
fn results_for_class<'r>(
    results: &'r [TestCaseResult],
    test_class: &str,
) -> Vec<&'r TestCaseResult> {
    results
        .iter()
        .filter(|r| {
            r.class_name == test_class
                || r.class_name.ends_with(&format!(".{test_class}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BuildOutcome;
    use std::time::Duration;

    fn run(success: bool, timeout: bool, tests: Vec<TestCaseResult>) -> TestRunOutcome {
        TestRunOutcome {
            build: BuildOutcome {
                success,
                exit_code: if success { 0 } else { 1 },
                stdout: String::new(),
                error: timeout.then(|| "timeout".to_string()),
                wall_time: Duration::from_millis(10),
            },
            tests,
        }
    }

    fn result(class: &str, method: &str, verdict: TestVerdict) -> TestCaseResult {
        TestCaseResult {
            class_name: class.into(),
            method_name: method.into(),
            verdict,
        }
    }

    #[test]
    fn failing_target_test_kills() {
        let r = run(
            false,
            false,
            vec![
                result("com.math.Calc_divideTest", "ok", TestVerdict::Pass),
                result("com.math.Calc_divideTest", "catches", TestVerdict::Fail),
            ],
        );
        let targets = results_for_class(&r.tests, "Calc_divideTest");
        assert_eq!(classify_test_phase(&r, &targets), Classification::Killed);
    }

    #[test]
    fn all_passing_survives() {
        let r = run(
            true,
            false,
            vec![result("Calc_divideTest", "ok", TestVerdict::Pass)],
        );
        let targets = results_for_class(&r.tests, "Calc_divideTest");
        assert_eq!(classify_test_phase(&r, &targets), Classification::Survived);
    }

    #[test]
    fn empty_test_set_survives_trivially() {
        let r = run(true, false, vec![]);
        let targets = results_for_class(&r.tests, "Calc_divideTest");
        assert_eq!(classify_test_phase(&r, &targets), Classification::Survived);
    }

    #[test]
    fn cross_target_failures_do_not_count() {
        // Another target's test fails, this target's tests all pass.
        let r = run(
            false,
            false,
            vec![
                result("Calc_divideTest", "ok", TestVerdict::Pass),
                result("Inventory_addStockTest", "other", TestVerdict::Fail),
            ],
        );
        let targets = results_for_class(&r.tests, "Calc_divideTest");
        // Runner exited non-zero for an unrelated reason: unclassifiable,
        // never killed by a cross-target test.
        assert_eq!(
            classify_test_phase(&r, &targets),
            Classification::RunnerError
        );
    }

    #[test]
    fn timeout_is_runner_error() {
        let r = run(false, true, vec![]);
        assert_eq!(
            classify_test_phase(&r, &results_for_class(&r.tests, "X")),
            Classification::RunnerError
        );
    }

    #[test]
    fn error_verdict_kills() {
        let r = run(
            false,
            false,
            vec![result("Calc_divideTest", "npe", TestVerdict::Error)],
        );
        let targets = results_for_class(&r.tests, "Calc_divideTest");
        assert_eq!(classify_test_phase(&r, &targets), Classification::Killed);
    }

    #[test]
    fn baseline_requires_all_target_tests_green() {
        let ok = run(
            true,
            false,
            vec![result("com.math.Calc_divideTest", "ok", TestVerdict::Pass)],
        );
        assert!(baseline_passes(&ok, "Calc_divideTest"));

        let failing = run(
            false,
            false,
            vec![result("com.math.Calc_divideTest", "bad", TestVerdict::Fail)],
        );
        assert!(!baseline_passes(&failing, "Calc_divideTest"));

        let timed_out = run(false, true, vec![]);
        assert!(!baseline_passes(&timed_out, "Calc_divideTest"));
    }

    #[test]
    fn class_matching_is_package_insensitive() {
        let results = vec![
            result("com.a.Calc_divideTest", "x", TestVerdict::Pass),
            result("Calc_divideTest", "y", TestVerdict::Pass),
            result("com.a.Calc_divideTestHelper", "z", TestVerdict::Pass),
        ];
        let matched = results_for_class(&results, "Calc_divideTest");
        assert_eq!(matched.len(), 2);
    }
}
