//! Core data model for the co-evolution loop.
//!
//! The entities here mirror the durable records the planner maintains:
//! production-method [`Target`]s, generated [`TestCase`]s, proposed
//! [`Mutant`]s with their patch and status machine, per-evaluation
//! [`EvaluationRun`] records, per-round [`CoverageSnapshot`]s, and the
//! process-wide [`BudgetCounter`].
//!
//! Ownership rules:
//!
//! - Every mutant and every test case belongs to exactly one target.
//! - A mutant is only ever evaluated against its own target's active tests.
//! - Targets are immutable once analyzed and are never deleted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical identity of a production method under test.
///
/// Two targets are the same iff class, method name, and the ordered
/// parameter type list all match. The derived `Ord` gives the stable
/// ordering used as the planner's final tie-break.
///
/// # Example
///
/// ```
/// use covolve::model::TargetId;
///
/// let id = TargetId::new("com.shop.Inventory", "addStock", ["String", "int"]);
/// assert_eq!(id.to_string(), "com.shop.Inventory#addStock(String,int)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId {
    /// Fully-qualified class name, e.g. `com.shop.Inventory`.
    pub class_fqn: String,
    /// Simple method name.
    pub method_name: String,
    /// Ordered parameter types as written in the signature.
    pub param_types: Vec<String>,
}

impl TargetId {
    pub fn new<I, S>(class_fqn: impl Into<String>, method_name: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            class_fqn: class_fqn.into(),
            method_name: method_name.into(),
            param_types: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Simple (unqualified) class name.
    pub fn class_name(&self) -> &str {
        self.class_fqn.rsplit('.').next().unwrap_or(&self.class_fqn)
    }

    /// Name of the test class all of this target's tests are grouped in,
    /// derived as `{ClassName}_{methodName}Test`.
    pub fn test_class_name(&self) -> String {
        format!("{}_{}Test", self.class_name(), self.method_name)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}({})",
            self.class_fqn,
            self.method_name,
            self.param_types.join(",")
        )
    }
}

/// Structural facts about a method, as reported by the analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerFacts {
    /// Parameters and fields checked against null before use.
    #[serde(default)]
    pub null_checks: Vec<String>,
    /// Boundary comparisons (`<`, `<=`, `>=`, `>`) on inputs.
    #[serde(default)]
    pub boundary_checks: Vec<String>,
    /// Exception types raised or handled in the body.
    #[serde(default)]
    pub exception_handling: Vec<String>,
    /// Methods invoked from the body.
    #[serde(default)]
    pub method_calls: Vec<String>,
    /// Cyclomatic complexity of the body.
    #[serde(default)]
    pub cyclomatic_complexity: u32,
}

/// A single public production method for which tests and mutants are managed.
///
/// Created at scan time, immutable once analyzed, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    /// Source file path, relative to the project root.
    pub source_file: std::path::PathBuf,
    /// 1-based inclusive line range of the method in `source_file`.
    pub line_start: u32,
    pub line_end: u32,
    /// Full signature as written in the source.
    pub signature: String,
    /// Javadoc text, if any.
    #[serde(default)]
    pub javadoc: Option<String>,
    /// Method source text, with original line breaks preserved.
    pub source_text: String,
    /// Collaborator types that must be mocked, in declaration order.
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub facts: AnalyzerFacts,
}

impl Target {
    /// Whether the 1-based inclusive range `[start, end]` lies within this
    /// target's declared line range.
    pub fn contains_lines(&self, start: u32, end: u32) -> bool {
        start >= self.line_start && end <= self.line_end
    }
}

/// Why a test case was generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestOrigin {
    /// Produced by the initial generation pass for the target.
    Initial,
    /// Produced to kill a specific surviving mutant.
    RefineForMutant { mutant_id: u64 },
}

/// Lifecycle of a generated test.
///
/// ```text
///   PendingFormat ──► Compiled ──► Active
///                         │
///                         └──► FailingOnBaseline (rejected)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    PendingFormat,
    Compiled,
    FailingOnBaseline,
    Active,
}

/// A generated test method, owned by a single target.
///
/// All of a target's tests live in one on-disk test class named by
/// [`TargetId::test_class_name`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub target: TargetId,
    pub test_class_name: String,
    pub test_method_name: String,
    /// Rendered and formatted source of the test method.
    pub source: String,
    pub created_round: u32,
    pub origin: TestOrigin,
    pub status: TestStatus,
}

impl TestCase {
    /// Tests count toward baseline checks and mutant verdicts only while
    /// active.
    pub fn is_active(&self) -> bool {
        self.status == TestStatus::Active
    }
}

/// Semantic classification of the fault a mutant encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticTag {
    NullCheckRemoved,
    BoundaryFlipped,
    ReturnValueChanged,
    OperatorSwapped,
    ExceptionSwallowed,
    OffByOne,
    Other,
}

/// Status machine of a mutant.
///
/// ```text
///   Pending ──► Valid ──► Survived | Killed
///      │
///      └─────► Invalid
///
///   (runner errors: EvaluationError, retried once, then Unknown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantStatus {
    Pending,
    Valid,
    Invalid,
    Survived,
    Killed,
    EvaluationError,
    Unknown,
}

impl MutantStatus {
    /// Whether this status contributes to the mutation-score denominator.
    pub fn scored(self) -> bool {
        matches!(self, MutantStatus::Survived | MutantStatus::Killed)
    }
}

/// A line-range patch against a production source file.
///
/// Line numbers are 1-based and inclusive. The applier replaces lines
/// `[line_start, line_end]` with the lines of `mutated` split on `\n`,
/// with no trailing-newline normalization. `original` and `mutated` are
/// bit-exact strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub file_path: std::path::PathBuf,
    pub line_start: u32,
    pub line_end: u32,
    pub original: String,
    pub mutated: String,
}

impl Patch {
    /// Validates the patch against its target: ordered line range, range
    /// within the target, and a mutation that actually changes something.
    pub fn validate(&self, target: &Target) -> crate::error::Result<()> {
        if self.line_start > self.line_end {
            return Err(crate::error::Error::PatchOutOfBounds(format!(
                "line_start {} > line_end {}",
                self.line_start, self.line_end
            )));
        }
        if !target.contains_lines(self.line_start, self.line_end) {
            return Err(crate::error::Error::PatchOutOfBounds(format!(
                "lines {}..{} outside target range {}..{}",
                self.line_start, self.line_end, target.line_start, target.line_end
            )));
        }
        if self.mutated == self.original {
            return Err(crate::error::Error::PatchOutOfBounds(
                "mutated code is identical to original".into(),
            ));
        }
        Ok(())
    }
}

/// A proposed semantic fault in the production code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutant {
    /// Monotonic per-run id.
    pub id: u64,
    pub target: TargetId,
    pub patch: Patch,
    pub tag: SemanticTag,
    pub status: MutantStatus,
    /// Append-only evaluation history.
    #[serde(default)]
    pub history: Vec<EvaluationRun>,
}

/// Outcome of one test inside an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Pass,
    Fail,
    Error,
}

/// One evaluation of one mutant: per-test outcomes, wall time, exit code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub outcomes: Vec<(String, TestVerdict)>,
    pub wall_time_ms: u64,
    pub exit_code: i32,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Tally of mutant statuses for one target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationTally {
    pub killed: usize,
    pub survived: usize,
    pub invalid: usize,
    pub errored: usize,
    pub unknown: usize,
}

impl MutationTally {
    /// Builds a tally over the given mutants.
    pub fn of<'a>(mutants: impl IntoIterator<Item = &'a Mutant>) -> Self {
        let mut tally = Self::default();
        for m in mutants {
            match m.status {
                MutantStatus::Killed => tally.killed += 1,
                MutantStatus::Survived => tally.survived += 1,
                MutantStatus::Invalid => tally.invalid += 1,
                MutantStatus::EvaluationError => tally.errored += 1,
                MutantStatus::Unknown => tally.unknown += 1,
                MutantStatus::Pending | MutantStatus::Valid => {}
            }
        }
        tally
    }

    /// `killed / (killed + survived)`, excluding invalid, errored, and
    /// unknown mutants. A target with no scored mutants has score 0.
    pub fn score(&self) -> f64 {
        let denom = self.killed + self.survived;
        if denom == 0 {
            0.0
        } else {
            self.killed as f64 / denom as f64
        }
    }
}

/// Per-target, per-round quality measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    pub target: TargetId,
    pub round: u32,
    pub line_coverage: f64,
    pub branch_coverage: f64,
    pub mutation_score: f64,
    pub tests_count: usize,
}

/// Process-wide budget accounting.
///
/// Counters are incremented atomically with the operation that spends them;
/// after a crash, any in-flight increment is treated as consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCounter {
    pub llm_calls_used: u32,
    pub rounds_used: u32,
    pub last_improvement_round: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target {
            id: TargetId::new("com.math.Calc", "divide", ["int", "int"]),
            source_file: "src/main/java/com/math/Calc.java".into(),
            line_start: 10,
            line_end: 14,
            signature: "public int divide(int a, int b)".into(),
            javadoc: None,
            source_text: "return a / b;".into(),
            collaborators: vec![],
            facts: AnalyzerFacts::default(),
        }
    }

    fn patch(start: u32, end: u32, mutated: &str) -> Patch {
        Patch {
            file_path: "src/main/java/com/math/Calc.java".into(),
            line_start: start,
            line_end: end,
            original: "return a / b;".into(),
            mutated: mutated.into(),
        }
    }

    #[test]
    fn test_class_name_is_derived() {
        let id = TargetId::new("com.math.Calc", "divide", ["int", "int"]);
        assert_eq!(id.test_class_name(), "Calc_divideTest");
        assert_eq!(id.class_name(), "Calc");
    }

    #[test]
    fn patch_within_range_validates() {
        assert!(patch(11, 12, "return a / (b + 1);").validate(&target()).is_ok());
    }

    #[test]
    fn patch_inverted_range_rejected() {
        let err = patch(12, 11, "x").validate(&target()).unwrap_err();
        assert_eq!(err.kind(), "patch_out_of_bounds");
    }

    #[test]
    fn patch_outside_target_rejected() {
        assert!(patch(9, 12, "x").validate(&target()).is_err());
        assert!(patch(12, 15, "x").validate(&target()).is_err());
    }

    #[test]
    fn patch_identity_rejected() {
        assert!(patch(11, 11, "return a / b;").validate(&target()).is_err());
    }

    #[test]
    fn tally_excludes_unscored_statuses() {
        let base = Mutant {
            id: 0,
            target: target().id,
            patch: patch(11, 11, "x"),
            tag: SemanticTag::Other,
            status: MutantStatus::Killed,
            history: vec![],
        };
        let mutants: Vec<Mutant> = [
            MutantStatus::Killed,
            MutantStatus::Killed,
            MutantStatus::Survived,
            MutantStatus::Invalid,
            MutantStatus::EvaluationError,
            MutantStatus::Unknown,
            MutantStatus::Pending,
        ]
        .iter()
        .enumerate()
        .map(|(i, s)| Mutant {
            id: i as u64,
            status: *s,
            ..base.clone()
        })
        .collect();

        let tally = MutationTally::of(&mutants);
        assert_eq!(tally.killed, 2);
        assert_eq!(tally.survived, 1);
        assert!((tally.score() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_tally_scores_zero() {
        assert_eq!(MutationTally::default().score(), 0.0);
    }

    #[test]
    fn target_ids_order_deterministically() {
        let a = TargetId::new("com.a.A", "m", Vec::<String>::new());
        let b = TargetId::new("com.a.A", "n", Vec::<String>::new());
        let c = TargetId::new("com.b.B", "a", Vec::<String>::new());
        assert!(a < b && b < c);
    }
}
