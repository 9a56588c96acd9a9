//! Configuration schema definitions for covolve.
//!
//! All types deserialize from TOML with serde. Every section is optional in
//! the file and falls back to defaults, except `[llm]`, which has no
//! sensible default endpoint.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ProjectConfig       - source/test roots inside the target project
//! ├── LlmConfig           - chat endpoint, model, temperature, timeout
//! ├── KnowledgeConfig     - retrieval switch and tuning (+ embedding endpoint)
//! ├── PreprocessingConfig - parallel initial-generation phase
//! ├── FormattingConfig    - formatter command and style (GOOGLE | AOSP)
//! ├── AnalyzerConfig      - structural analyzer command
//! ├── AgentConfig         - budgets, weights, thresholds, parallelism
//! └── RunConfig           - state directory, bug-report directory
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for covolve.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,

    pub llm: LlmConfig,

    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    #[serde(default)]
    pub preprocessing: PreprocessingConfig,

    #[serde(default)]
    pub formatting: FormattingConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub run: RunConfig,
}

/// Layout of the target project.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    /// Production source root, relative to the project path.
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,

    /// Test source root, relative to the project path. Generated test
    /// classes are written here inside the workspace sandbox.
    #[serde(default = "default_test_root")]
    pub test_root: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            test_root: default_test_root(),
        }
    }
}

fn default_source_root() -> PathBuf {
    "src/main/java".into()
}

fn default_test_root() -> PathBuf {
    "src/test/java".into()
}

/// LLM endpoint settings.
///
/// `api_key` and `base_url` support `${VAR}` / `${VAR:-default}` expansion
/// so secrets stay out of the file:
///
/// ```toml
/// [llm]
/// base_url = "${LLM_BASE_URL:-https://api.openai.com/v1}"
/// api_key = "${LLM_API_KEY}"
/// model = "gpt-4o"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    pub model: String,

    /// Sampling temperature for generation calls.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Per-call timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_llm_timeout() -> u64 {
    120
}

/// Retrieval layer settings.
///
/// With `enabled = false`, retrieval always returns an empty chunk list and
/// prompts omit their context section entirely.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Contract chunks retrieved per generation prompt.
    #[serde(default = "default_top_k_contracts")]
    pub top_k_contracts: usize,

    /// Bug-report chunks retrieved per refinement prompt.
    #[serde(default = "default_top_k_bugs")]
    pub top_k_bugs: usize,

    /// Weight of the semantic score in hybrid ranking; the keyword score
    /// gets `1 - alpha`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Token budget for prose chunks. Code chunks are method-granular and
    /// ignore this budget.
    #[serde(default = "default_chunk_token_budget")]
    pub chunk_token_budget: usize,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k_contracts: default_top_k_contracts(),
            top_k_bugs: default_top_k_bugs(),
            alpha: default_alpha(),
            chunk_token_budget: default_chunk_token_budget(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_top_k_contracts() -> usize {
    5
}

fn default_top_k_bugs() -> usize {
    3
}

fn default_alpha() -> f64 {
    0.7
}

fn default_chunk_token_budget() -> usize {
    400
}

/// Embedding endpoint settings.
///
/// An empty `base_url` selects the built-in deterministic embedding, which
/// keeps retrieval functional without any external service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: default_embedding_model(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_embedding_timeout() -> u64 {
    30
}

/// Parallel preprocessing phase settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreprocessingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Upper bound on concurrently preprocessed targets.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: default_max_workers(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

/// Formatter selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FormattingConfig {
    #[serde(default)]
    pub style: FormatStyle,

    /// Formatter executable; must accept `--replace` plus a file path.
    #[serde(default = "default_formatter_command")]
    pub command: String,
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            style: FormatStyle::default(),
            command: default_formatter_command(),
        }
    }
}

fn default_formatter_command() -> String {
    "google-java-format".into()
}

/// Formatting style passed to the formatter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FormatStyle {
    #[default]
    Google,
    Aosp,
}

/// Structural analyzer invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzerConfig {
    /// Command line of the analyzer, split shell-style. The file to analyze
    /// is appended as the final argument; output must be JSON on stdout.
    #[serde(default = "default_analyzer_command")]
    pub command: String,

    /// Per-invocation timeout in seconds.
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command: default_analyzer_command(),
            timeout_secs: default_analyzer_timeout(),
        }
    }
}

fn default_analyzer_command() -> String {
    "java-analyzer --json".into()
}

fn default_analyzer_timeout() -> u64 {
    60
}

/// Planner budgets, weights, and thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_budget_llm_calls")]
    pub budget_llm_calls: u32,

    /// Rounds without improvement before the run stops.
    #[serde(default = "default_no_improvement_rounds")]
    pub stop_on_no_improvement_rounds: u32,

    /// Upper bound on concurrently evaluated targets in the main loop.
    /// Mutants of the same target are always serialized.
    #[serde(default = "default_parallel_targets")]
    pub parallel_targets: usize,

    /// Mutation score above which the planner prefers generating fresh
    /// mutants over refining tests.
    #[serde(default = "default_high_mutation_threshold")]
    pub high_mutation_threshold: f64,

    #[serde(default)]
    pub weights: SelectionWeights,

    #[serde(default)]
    pub excellence_thresholds: ExcellenceThresholds,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            budget_llm_calls: default_budget_llm_calls(),
            stop_on_no_improvement_rounds: default_no_improvement_rounds(),
            parallel_targets: default_parallel_targets(),
            high_mutation_threshold: default_high_mutation_threshold(),
            weights: SelectionWeights::default(),
            excellence_thresholds: ExcellenceThresholds::default(),
        }
    }
}

fn default_max_iterations() -> u32 {
    30
}

fn default_budget_llm_calls() -> u32 {
    200
}

fn default_no_improvement_rounds() -> u32 {
    3
}

fn default_parallel_targets() -> usize {
    2
}

fn default_high_mutation_threshold() -> f64 {
    0.8
}

/// Weights of the expected-improvement score
/// `w1*(1-mutation) + w2*(1-line) + w3*(1-branch) - w4*noop_penalty`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct SelectionWeights {
    #[serde(default = "default_w1")]
    pub w1: f64,
    #[serde(default = "default_w2")]
    pub w2: f64,
    #[serde(default = "default_w3")]
    pub w3: f64,
    #[serde(default = "default_w4")]
    pub w4: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            w1: default_w1(),
            w2: default_w2(),
            w3: default_w3(),
            w4: default_w4(),
        }
    }
}

fn default_w1() -> f64 {
    0.5
}

fn default_w2() -> f64 {
    0.2
}

fn default_w3() -> f64 {
    0.2
}

fn default_w4() -> f64 {
    0.3
}

/// Global quality bar; reaching it on every target stops the run.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ExcellenceThresholds {
    #[serde(default = "default_excellent_mutation")]
    pub mutation_score: f64,
    #[serde(default = "default_excellent_line")]
    pub line_coverage: f64,
    #[serde(default = "default_excellent_branch")]
    pub branch_coverage: f64,
}

impl Default for ExcellenceThresholds {
    fn default() -> Self {
        Self {
            mutation_score: default_excellent_mutation(),
            line_coverage: default_excellent_line(),
            branch_coverage: default_excellent_branch(),
        }
    }
}

fn default_excellent_mutation() -> f64 {
    0.95
}

fn default_excellent_line() -> f64 {
    0.90
}

fn default_excellent_branch() -> f64 {
    0.85
}

/// Run-level paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Directory for the checkpoint, data-store tables, and the exit
    /// summary. Created on demand.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory of bug reports to ingest at startup.
    #[serde(default)]
    pub bug_reports_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            bug_reports_dir: None,
        }
    }
}

fn default_state_dir() -> PathBuf {
    ".covolve".into()
}
