//! Structural analyzer bridge.
//!
//! The external analyzer is the only component that understands Java
//! syntax. Given a source file it emits one JSON document describing the
//! class and every method in it: signature, line range, javadoc,
//! control-flow facts, and the collaborator types a test would have to
//! mock. This bridge invokes it, validates the JSON, and converts the
//! report into [`Target`]s.
//!
//! The same invocation doubles as structural validation for generated test
//! sources: a file the analyzer cannot parse is rejected before it ever
//! reaches the workspace.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::error::{Error, Result};
use crate::model::{AnalyzerFacts, Target, TargetId};

/// JSON report produced by the analyzer for one source file.
#[derive(Debug, Deserialize)]
pub struct ClassReport {
    pub class_fqn: String,
    #[serde(default)]
    pub methods: Vec<MethodReport>,
}

/// One method entry in a [`ClassReport`].
#[derive(Debug, Deserialize)]
pub struct MethodReport {
    pub name: String,
    #[serde(default)]
    pub param_types: Vec<String>,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    pub line_start: u32,
    pub line_end: u32,
    pub signature: String,
    #[serde(default)]
    pub javadoc: Option<String>,
    pub source_text: String,
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub null_checks: Vec<String>,
    #[serde(default)]
    pub boundary_checks: Vec<String>,
    #[serde(default)]
    pub exception_handling: Vec<String>,
    #[serde(default)]
    pub method_calls: Vec<String>,
    #[serde(default)]
    pub cyclomatic_complexity: u32,
}

fn default_visibility() -> String {
    "package".into()
}

/// Bridge to the external structural analyzer.
#[derive(Debug)]
pub struct AnalyzerBridge {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl AnalyzerBridge {
    /// Builds the bridge from configuration. The command line is split
    /// shell-style; an empty command is a configuration error.
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        let words = shell_words::split(&config.command)
            .map_err(|e| Error::ConfigInvalid(format!("analyzer.command: {e}")))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| Error::ConfigInvalid("analyzer.command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Analyzes one production source file and returns a target per public
    /// method. `relative` is the file's path relative to the project root,
    /// recorded on each target.
    pub async fn analyze_file(&self, file: &Path, relative: &Path) -> Result<Vec<Target>> {
        let report = self.invoke(file).await?;
        Ok(targets_from_report(report, relative))
    }

    /// Structurally validates a generated test source by round-tripping it
    /// through the analyzer. Unparseable sources are rejected here, before
    /// any workspace write.
    pub async fn validate_test_source(&self, source: &str) -> Result<()> {
        let dir = tempfile::tempdir()
            .map_err(|e| Error::SandboxIo(format!("temp dir for validation: {e}")))?;
        let path = dir.path().join("Candidate.java");
        tokio::fs::write(&path, source)
            .await
            .map_err(|e| Error::SandboxIo(format!("write validation file: {e}")))?;
        self.invoke(&path).await.map(|_| ())
    }

    async fn invoke(&self, file: &Path) -> Result<ClassReport> {
        debug!(file = %file.display(), "invoking analyzer");
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(file)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::ExternalToolMissing(format!("analyzer `{}` not found", self.program))
                }
                _ => Error::AnalyzerParseFailed(format!("failed to spawn analyzer: {e}")),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(format!("analyzer on {}", file.display())))?
            .map_err(|e| Error::AnalyzerParseFailed(format!("analyzer I/O error: {e}")))?;

        if !output.status.success() {
            return Err(Error::AnalyzerParseFailed(format!(
                "analyzer exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        parse_report(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses the analyzer's JSON output.
pub fn parse_report(json: &str) -> Result<ClassReport> {
    serde_json::from_str(json).map_err(|e| Error::AnalyzerParseFailed(e.to_string()))
}

/// Converts a class report into targets, keeping public methods only.
pub fn targets_from_report(report: ClassReport, relative: &Path) -> Vec<Target> {
    report
        .methods
        .into_iter()
        .filter(|m| m.visibility == "public")
        .map(|m| Target {
            id: TargetId::new(report.class_fqn.clone(), m.name, m.param_types),
            source_file: relative.to_path_buf(),
            line_start: m.line_start,
            line_end: m.line_end,
            signature: m.signature,
            javadoc: m.javadoc,
            source_text: m.source_text,
            collaborators: m.collaborators,
            facts: AnalyzerFacts {
                null_checks: m.null_checks,
                boundary_checks: m.boundary_checks,
                exception_handling: m.exception_handling,
                method_calls: m.method_calls,
                cyclomatic_complexity: m.cyclomatic_complexity,
            },
        })
        .collect()
}
