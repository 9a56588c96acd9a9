//! Durable run state: JSON tables and the round checkpoint.
//!
//! The store is single-writer by design: only the planner thread writes,
//! workers return results by value. Tables live under
//! `<state_dir>/store/` as pretty-printed JSON, one file per entity kind.
//! The checkpoint is one JSON document written after every round; loading
//! it back reproduces the saved state exactly, which is what makes
//! `--resume` deterministic.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{BudgetCounter, CoverageSnapshot, Mutant, Target, TestCase};

/// Durable JSON tables for one run.
pub struct DataStore {
    dir: PathBuf,
}

impl DataStore {
    /// Opens (or creates) the store under `state_dir/store`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("store");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn save_targets(&self, targets: &[Target]) -> Result<()> {
        self.write_table("targets", targets)
    }

    pub fn save_tests(&self, tests: &[TestCase]) -> Result<()> {
        self.write_table("tests", tests)
    }

    pub fn save_mutants(&self, mutants: &[Mutant]) -> Result<()> {
        self.write_table("mutants", mutants)
    }

    pub fn save_coverage(&self, snapshots: &[CoverageSnapshot]) -> Result<()> {
        self.write_table("coverage", snapshots)
    }

    pub fn save_budget(&self, budget: &BudgetCounter) -> Result<()> {
        self.write_table("budget", budget)
    }

    pub fn load_coverage(&self) -> Result<Vec<CoverageSnapshot>> {
        self.read_table("coverage")
    }

    fn write_table<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(format!("{name}.json"));
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| Error::InternalInvariant(format!("serialize {name}: {e}")))?;
        write_atomically(&path, &json)?;
        debug!(table = name, path = %path.display(), "table written");
        Ok(())
    }

    fn read_table<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(format!("{name}.json"));
        if !path.exists() {
            return Ok(T::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::SandboxIo(format!("corrupt table {name}: {e}")))
    }
}

/// Per-target scheduling state the planner needs back on resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    /// Rounds the planner has spent on this target.
    pub rounds_spent: u32,
    /// Consecutive rounds whose action produced no improvement here.
    pub noop_streak: u32,
    /// Mutants or tests were added since this target's last evaluation.
    pub pending_evaluation: bool,
    /// Round in which mutants were last generated for this target.
    pub last_mutant_round: Option<u32>,
    /// Ids (ascending) of the surviving mutants the last refinement
    /// already targeted; cleared by the next evaluation. Refinement is
    /// suppressed only while the survivor set is exactly this one.
    #[serde(default)]
    pub refined_survivors: Vec<u64>,
}

/// Snapshot of everything the planner needs to continue after a crash.
///
/// Written after each round; `load(save(state)) == state` holds for every
/// field. The scheduler map is keyed by the target id's display form,
/// which is stable and ordered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub round: u32,
    pub targets: Vec<Target>,
    pub active_tests: Vec<TestCase>,
    pub mutants: Vec<Mutant>,
    pub coverage_snapshots: Vec<CoverageSnapshot>,
    pub budget: BudgetCounter,
    pub scheduler: BTreeMap<String, SchedulerEntry>,
}

impl Checkpoint {
    /// Writes the checkpoint atomically (temp file + rename) so a crash
    /// mid-write never leaves a truncated document.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::InternalInvariant(format!("serialize checkpoint: {e}")))?;
        write_atomically(path, &json)?;
        debug!(path = %path.display(), round = self.round, "checkpoint written");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("checkpoint {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::ConfigInvalid(format!("corrupt checkpoint: {e}")))
    }
}

fn write_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AnalyzerFacts, MutantStatus, Patch, SemanticTag, TargetId, TestOrigin, TestStatus,
    };

    fn sample_target() -> Target {
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

    fn sample_checkpoint() -> Checkpoint {
        let target = sample_target();
        let mut scheduler = BTreeMap::new();
        scheduler.insert(
            target.id.to_string(),
            SchedulerEntry {
                rounds_spent: 3,
                noop_streak: 1,
                pending_evaluation: true,
                last_mutant_round: Some(2),
                refined_survivors: vec![1],
            },
        );
        Checkpoint {
            round: 3,
            active_tests: vec![TestCase {
                target: target.id.clone(),
                test_class_name: "Calc_divideTest".into(),
                test_method_name: "dividesEvenly".into(),
                source: "@Test void dividesEvenly() {}".into(),
                created_round: 1,
                origin: TestOrigin::Initial,
                status: TestStatus::Active,
            }],
            mutants: vec![Mutant {
                id: 1,
                target: target.id.clone(),
                patch: Patch {
                    file_path: "src/main/java/com/math/Calc.java".into(),
                    line_start: 12,
                    line_end: 12,
                    original: "return a / b;".into(),
                    mutated: "return a / (b + 1);".into(),
                },
                tag: SemanticTag::OffByOne,
                status: MutantStatus::Survived,
                history: vec![],
            }],
            coverage_snapshots: vec![CoverageSnapshot {
                target: target.id.clone(),
                round: 3,
                line_coverage: 0.8,
                branch_coverage: 0.5,
                mutation_score: 0.0,
                tests_count: 1,
            }],
            budget: BudgetCounter {
                llm_calls_used: 42,
                rounds_used: 3,
                last_improvement_round: 2,
            },
            targets: vec![target],
            scheduler,
        }
    }

    #[test]
    fn checkpoint_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let checkpoint = sample_checkpoint();
        checkpoint.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn checkpoint_save_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut checkpoint = sample_checkpoint();
        checkpoint.save(&path).unwrap();
        checkpoint.round = 4;
        checkpoint.budget.rounds_used = 4;
        checkpoint.save(&path).unwrap();

        assert_eq!(Checkpoint::load(&path).unwrap().round, 4);
    }

    #[test]
    fn missing_checkpoint_is_config_invalid() {
        let err = Checkpoint::load(Path::new("/nonexistent/checkpoint.json")).unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[test]
    fn tables_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::open(dir.path()).unwrap();

        let snapshots = vec![CoverageSnapshot {
            target: sample_target().id,
            round: 1,
            line_coverage: 0.5,
            branch_coverage: 0.25,
            mutation_score: 0.75,
            tests_count: 4,
        }];
        store.save_coverage(&snapshots).unwrap();
        assert_eq!(store.load_coverage().unwrap(), snapshots);

        store.save_targets(&[sample_target()]).unwrap();
        assert!(dir.path().join("store/targets.json").exists());
    }

    #[test]
    fn missing_table_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::open(dir.path()).unwrap();
        assert!(store.load_coverage().unwrap().is_empty());
    }
}
