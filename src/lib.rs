//! # covolve
//!
//! Adversarial co-evolution of unit tests and LLM-generated mutants for a
//! Java project. A mutant generator proposes plausible semantic faults in
//! production methods; a test generator writes tests meant to detect
//! them; a central planner schedules both roles per method, evaluates
//! every artifact against the live project (compile + test + coverage),
//! and iterates under a budget until quality goals are met.
//!
//! ## Architecture
//!
//! The crate is organized around the planner and its collaborators:
//!
//! ### Planning ([`planner`])
//!
//! - [`planner::Planner`] - per-round target selection, action choice,
//!   write-back discipline, stop conditions, checkpointing
//! - [`preprocess`] - parallel initial test/mutant generation per target
//!
//! ### Evaluation ([`evaluator`], [`sandbox`], [`driver`])
//!
//! - [`sandbox::SandboxManager`] - one persistent workspace copy of the
//!   project plus ephemeral per-mutant sandboxes
//! - [`driver::BuildDriver`] - Maven bridge: compile, test, coverage
//! - [`evaluator::MutationEvaluator`] - baseline check, then per-mutant
//!   killed/survived classification
//!
//! ### Retrieval ([`knowledge`])
//!
//! - [`knowledge::KnowledgeBase`] - method-granular contract chunks and
//!   bug-report chunks behind hybrid (semantic + keyword) retrieval
//!
//! ### Generation ([`llm`])
//!
//! - [`llm::LlmClient`] - chat-completion client with backoff
//! - [`llm::prompt`] - typed prompt roles and validated response schemas
//!
//! ### Persistence ([`store`])
//!
//! - [`store::DataStore`] - JSON tables for targets, tests, mutants,
//!   coverage, and budget
//! - [`store::Checkpoint`] - per-round snapshot backing `--resume`
//!
//! ## Quick Start
//!
//! ```no_run
//! use covolve::config::load_config;
//! use covolve::context::RuntimeContext;
//! use covolve::planner::Planner;
//! use covolve::scanner::scan_project;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("covolve.toml"))?;
//!     let source_root = config.project.source_root.clone();
//!     let ctx = RuntimeContext::initialize(config, std::path::Path::new("./project")).await?;
//!
//!     let workspace = ctx.sandboxes.create_workspace(&ctx.project_path, false).await?;
//!     let targets = scan_project(&ctx.project_path, &source_root, &ctx.analyzer).await?;
//!
//!     let mut planner = Planner::new(&ctx, workspace, targets);
//!     let stop = planner.run(&CancellationToken::new()).await?;
//!     std::process::exit(stop.exit_code());
//! }
//! ```

pub mod analyzer;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod evaluator;
pub mod format;
pub mod knowledge;
pub mod llm;
pub mod model;
pub mod planner;
pub mod preprocess;
pub mod report;
pub mod sandbox;
pub mod scanner;
pub mod store;

// Re-export the types most embedders need.

pub use config::{Config, load_config, load_config_str};
pub use context::RuntimeContext;
pub use error::{Error, Result};
pub use model::{Mutant, MutantStatus, Target, TargetId, TestCase};
pub use planner::{Planner, StopReason};
pub use report::print_summary;
