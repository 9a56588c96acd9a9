//! The run's typed runtime context.
//!
//! All external collaborators (build driver, analyzer, formatter, LLM
//! client, knowledge base, data store, sandbox manager) are constructed
//! once at startup and passed by reference through the planner and
//! bridges. No leaf call site constructs its own client or reads global
//! state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::analyzer::AnalyzerBridge;
use crate::config::Config;
use crate::driver::BuildDriver;
use crate::error::{Error, Result};
use crate::format::Formatter;
use crate::knowledge::KnowledgeBase;
use crate::llm::LlmClient;
use crate::sandbox::SandboxManager;
use crate::store::DataStore;

/// Default wall-clock bound for one build-tool invocation.
const BUILD_TIMEOUT: Duration = Duration::from_secs(900);

/// Everything a run needs, constructed exactly once.
pub struct RuntimeContext {
    pub config: Config,
    pub project_path: PathBuf,
    pub state_dir: PathBuf,
    pub driver: BuildDriver,
    pub analyzer: AnalyzerBridge,
    pub formatter: Formatter,
    pub llm: LlmClient,
    pub knowledge: KnowledgeBase,
    pub store: DataStore,
    pub sandboxes: SandboxManager,
}

impl RuntimeContext {
    /// Builds the context. Failure to locate the build tool, an invalid
    /// configuration, or an unopenable state directory are fatal here,
    /// before any work starts.
    pub async fn initialize(config: Config, project_path: &Path) -> Result<Self> {
        let project_path = project_path
            .canonicalize()
            .map_err(|e| Error::ConfigInvalid(format!("project path: {e}")))?;
        if !project_path.is_dir() {
            return Err(Error::ConfigInvalid(format!(
                "project path {} is not a directory",
                project_path.display()
            )));
        }

        let state_dir = if config.run.state_dir.is_absolute() {
            config.run.state_dir.clone()
        } else {
            project_path.join(&config.run.state_dir)
        };
        std::fs::create_dir_all(&state_dir)?;

        let driver = BuildDriver::locate(BUILD_TIMEOUT).await?;
        let analyzer = AnalyzerBridge::new(&config.analyzer)?;
        let formatter = Formatter::new(&config.formatting)?;
        let llm = LlmClient::new(&config.llm)?;
        let knowledge = KnowledgeBase::new(&config.knowledge, "run")?;
        let store = DataStore::open(&state_dir)?;
        let sandboxes = SandboxManager::new(state_dir.join("run"));

        info!(
            project = %project_path.display(),
            state = %state_dir.display(),
            knowledge = knowledge.is_enabled(),
            "runtime context ready"
        );

        Ok(Self {
            config,
            project_path,
            state_dir,
            driver,
            analyzer,
            formatter,
            llm,
            knowledge,
            store,
            sandboxes,
        })
    }

    /// Path of this run's checkpoint document.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }

    /// Path of the exit summary document.
    pub fn summary_path(&self) -> PathBuf {
        self.state_dir.join("summary.json")
    }
}
