//! Build driver bridge.
//!
//! Abstracts the external build system (Maven) behind four operations:
//! compile production sources, compile tests, run the test phase, and run
//! tests with coverage. Each returns a structured [`BuildOutcome`] record;
//! a non-zero exit from the tool is a result, not an error.
//!
//! The bridge locates the build tool once at construction (`MAVEN_HOME`,
//! then a PATH probe, then a `-version` query). Failure to locate it is a
//! fatal startup error. Individual invocations that exceed their timeout
//! are reported as `success = false` with a `timeout` error kind.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::TestVerdict;

/// Structured result of one build-tool invocation.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    /// Error kind string when the invocation failed for a reason other
    /// than the tool's own non-zero exit (currently only `timeout`).
    pub error: Option<String>,
    pub wall_time: Duration,
}

impl BuildOutcome {
    fn timed_out(wall_time: Duration) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            error: Some("timeout".into()),
            wall_time,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some("timeout")
    }
}

/// One test's outcome parsed from a Surefire report.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseResult {
    pub class_name: String,
    pub method_name: String,
    pub verdict: TestVerdict,
}

/// Result of the test phase: the raw invocation record plus per-test
/// outcomes parsed from the Surefire XML reports.
#[derive(Debug, Clone)]
pub struct TestRunOutcome {
    pub build: BuildOutcome,
    pub tests: Vec<TestCaseResult>,
}

impl TestRunOutcome {
    /// Whether any parsed test failed or errored.
    pub fn any_failed(&self) -> bool {
        self.tests.iter().any(|t| t.verdict != TestVerdict::Pass)
    }
}

/// Line and branch coverage rates parsed from a JaCoCo report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageRates {
    pub line: f64,
    pub branch: f64,
}

/// Result of the coverage phase.
#[derive(Debug, Clone)]
pub struct CoverageOutcome {
    pub build: BuildOutcome,
    pub rates: Option<CoverageRates>,
}

/// Bridge to the Maven build tool.
pub struct BuildDriver {
    mvn: PathBuf,
    timeout: Duration,
}

impl BuildDriver {
    /// Locates Maven and verifies it responds to `-version`.
    ///
    /// Lookup order: `$MAVEN_HOME/bin/mvn`, then every directory on
    /// `$PATH`. Returns `external_tool_missing` when no working binary is
    /// found; callers treat that as fatal.
    pub async fn locate(invocation_timeout: Duration) -> Result<Self> {
        let candidate = maven_home_candidate()
            .or_else(|| find_in_path_dirs("mvn", &path_dirs()))
            .ok_or_else(|| {
                Error::ExternalToolMissing("mvn not found via MAVEN_HOME or PATH".into())
            })?;

        let output = tokio::process::Command::new(&candidate)
            .arg("-version")
            .output()
            .await
            .map_err(|e| {
                Error::ExternalToolMissing(format!("{} failed to run: {e}", candidate.display()))
            })?;
        if !output.status.success() {
            return Err(Error::ExternalToolMissing(format!(
                "{} -version exited with {:?}",
                candidate.display(),
                output.status.code()
            )));
        }

        let version_line = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("unknown")
            .to_string();
        info!(mvn = %candidate.display(), version = %version_line, "build driver ready");

        Ok(Self {
            mvn: candidate,
            timeout: invocation_timeout,
        })
    }

    /// Compiles production sources in `path`.
    pub async fn compile(&self, path: &Path) -> Result<BuildOutcome> {
        self.invoke(path, &["compile"]).await
    }

    /// Compiles test sources in `path`.
    pub async fn compile_tests(&self, path: &Path) -> Result<BuildOutcome> {
        self.invoke(path, &["test-compile"]).await
    }

    /// Runs the test phase in `path`, optionally restricted to one test
    /// class, and parses per-test outcomes from the Surefire reports.
    pub async fn run_tests(&self, path: &Path, test_class: Option<&str>) -> Result<TestRunOutcome> {
        let filter;
        let mut goals: Vec<&str> = vec!["test", "-DfailIfNoTests=false"];
        if let Some(class) = test_class {
            filter = format!("-Dtest={class}");
            goals.push(&filter);
        }
        let build = self.invoke(path, &goals).await?;
        let tests = if build.is_timeout() {
            Vec::new()
        } else {
            read_surefire_reports(&path.join("target/surefire-reports"))?
        };
        Ok(TestRunOutcome { build, tests })
    }

    /// Runs the test phase with the coverage agent attached and parses the
    /// JaCoCo XML report.
    pub async fn run_tests_with_coverage(&self, path: &Path) -> Result<CoverageOutcome> {
        let build = self
            .invoke(path, &["test", "-DfailIfNoTests=false", "jacoco:report"])
            .await?;
        let report = path.join("target/site/jacoco/jacoco.xml");
        let rates = if build.is_timeout() || !report.exists() {
            None
        } else {
            let xml = std::fs::read_to_string(&report)
                .map_err(|e| Error::BuildFailed(format!("coverage report unreadable: {e}")))?;
            Some(parse_jacoco_report(&xml)?)
        };
        Ok(CoverageOutcome { build, rates })
    }

    async fn invoke(&self, path: &Path, goals: &[&str]) -> Result<BuildOutcome> {
        let start = Instant::now();
        debug!(goals = ?goals, dir = %path.display(), "invoking build driver");

        let mut command = tokio::process::Command::new(&self.mvn);
        command
            .arg("-B")
            .args(goals)
            .current_dir(path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| Error::BuildFailed(format!("failed to spawn {}: {e}", self.mvn.display())))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::BuildFailed(format!("build tool I/O error: {e}"))),
            Err(_) => {
                debug!(goals = ?goals, "build invocation timed out");
                return Ok(BuildOutcome::timed_out(start.elapsed()));
            }
        };

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            stdout.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        Ok(BuildOutcome {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            error: None,
            wall_time: start.elapsed(),
        })
    }
}

fn maven_home_candidate() -> Option<PathBuf> {
    let home = std::env::var_os("MAVEN_HOME")?;
    let candidate = PathBuf::from(home).join("bin").join("mvn");
    candidate.is_file().then_some(candidate)
}

fn path_dirs() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default()
}

/// Returns the first `dir/name` that is a file, in order.
fn find_in_path_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Parses every `TEST-*.xml` under a Surefire report directory.
///
/// A missing directory yields an empty list (the phase may have failed
/// before any test ran).
fn read_surefire_reports(dir: &Path) -> Result<Vec<TestCaseResult>> {
    let mut results = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(results),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "xml")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("TEST-"))
        })
        .collect();
    files.sort();

    for file in files {
        let xml = std::fs::read_to_string(&file)
            .map_err(|e| Error::TestFailed(format!("{}: {e}", file.display())))?;
        results.extend(parse_surefire_xml(&xml)?);
    }
    Ok(results)
}

/// Parses one Surefire `testsuite` document into per-test results.
pub fn parse_surefire_xml(xml: &str) -> Result<Vec<TestCaseResult>> {
    let mut reader = Reader::from_str(xml);

    let mut results = Vec::new();
    let mut current: Option<TestCaseResult> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                match e.name().as_ref() {
                    b"testcase" => {
                        // A previous <testcase .../> with no children is
                        // complete once the next one starts.
                        if let Some(done) = current.take() {
                            results.push(done);
                        }
                        let mut class_name = String::new();
                        let mut method_name = String::new();
                        for attr in e.attributes().flatten() {
                            let value = String::from_utf8_lossy(&attr.value).into_owned();
                            match attr.key.as_ref() {
                                b"classname" => class_name = value,
                                b"name" => method_name = value,
                                _ => {}
                            }
                        }
                        current = Some(TestCaseResult {
                            class_name,
                            method_name,
                            verdict: TestVerdict::Pass,
                        });
                    }
                    b"failure" => {
                        if let Some(test) = current.as_mut() {
                            test.verdict = TestVerdict::Fail;
                        }
                    }
                    b"error" => {
                        if let Some(test) = current.as_mut() {
                            test.verdict = TestVerdict::Error;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"testcase" {
                    if let Some(done) = current.take() {
                        results.push(done);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::TestFailed(format!("surefire report unparseable: {e}")));
            }
            _ => {}
        }
    }

    if let Some(done) = current.take() {
        results.push(done);
    }
    Ok(results)
}

/// Parses a JaCoCo XML report into report-level line and branch rates.
///
/// JaCoCo nests `<counter>` elements at every level; only the counters
/// that are direct children of `<report>` summarize the whole module, so
/// depth is tracked while scanning.
pub fn parse_jacoco_report(xml: &str) -> Result<CoverageRates> {
    let mut reader = Reader::from_str(xml);

    let mut depth: u32 = 0;
    let mut line: Option<f64> = None;
    let mut branch: Option<f64> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Empty(ref e)) => {
                // Report-level counters sit at depth 1, inside <report>.
                if e.name().as_ref() == b"counter" && depth == 1 {
                    let mut kind = String::new();
                    let mut missed = 0.0;
                    let mut covered = 0.0;
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value).into_owned();
                        match attr.key.as_ref() {
                            b"type" => kind = value,
                            b"missed" => missed = value.parse().unwrap_or(0.0),
                            b"covered" => covered = value.parse().unwrap_or(0.0),
                            _ => {}
                        }
                    }
                    let total = missed + covered;
                    let rate = if total == 0.0 { 0.0 } else { covered / total };
                    match kind.as_str() {
                        "LINE" => line = Some(rate),
                        "BRANCH" => branch = Some(rate),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::BuildFailed(format!("jacoco report unparseable: {e}")));
            }
            _ => {}
        }
    }

    match (line, branch) {
        (Some(line), branch) => Ok(CoverageRates {
            line,
            // A module with no branches reports no BRANCH counter.
            branch: branch.unwrap_or(1.0),
        }),
        _ => Err(Error::BuildFailed(
            "jacoco report missing LINE counter".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUREFIRE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="com.math.Calc_divideTest" tests="3" failures="1" errors="1">
  <testcase classname="com.math.Calc_divideTest" name="dividesEvenly" time="0.01"/>
  <testcase classname="com.math.Calc_divideTest" name="rejectsZero" time="0.02">
    <failure message="expected ArithmeticException">stack</failure>
  </testcase>
  <testcase classname="com.math.Calc_divideTest" name="crashes" time="0.00">
    <error message="NullPointerException">stack</error>
  </testcase>
</testsuite>"#;

    #[test]
    fn surefire_verdicts_parse() {
        let results = parse_surefire_xml(SUREFIRE).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].verdict, TestVerdict::Pass);
        assert_eq!(results[0].method_name, "dividesEvenly");
        assert_eq!(results[1].verdict, TestVerdict::Fail);
        assert_eq!(results[2].verdict, TestVerdict::Error);
        assert_eq!(results[2].class_name, "com.math.Calc_divideTest");
    }

    #[test]
    fn surefire_empty_suite_parses() {
        let xml = r#"<testsuite name="Empty" tests="0"/>"#;
        assert!(parse_surefire_xml(xml).unwrap().is_empty());
    }

    const JACOCO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<report name="demo">
  <package name="com/math">
    <class name="com/math/Calc">
      <counter type="LINE" missed="100" covered="0"/>
      <counter type="BRANCH" missed="50" covered="0"/>
    </class>
    <counter type="LINE" missed="100" covered="0"/>
  </package>
  <counter type="INSTRUCTION" missed="10" covered="90"/>
  <counter type="LINE" missed="20" covered="80"/>
  <counter type="BRANCH" missed="15" covered="35"/>
</report>"#;

    #[test]
    fn jacoco_uses_report_level_counters_only() {
        let rates = parse_jacoco_report(JACOCO).unwrap();
        assert!((rates.line - 0.80).abs() < 1e-9);
        assert!((rates.branch - 0.70).abs() < 1e-9);
    }

    #[test]
    fn jacoco_without_branches_counts_as_full_branch_coverage() {
        let xml = r#"<report name="x"><counter type="LINE" missed="0" covered="10"/></report>"#;
        let rates = parse_jacoco_report(xml).unwrap();
        assert_eq!(rates.branch, 1.0);
        assert_eq!(rates.line, 1.0);
    }

    #[test]
    fn jacoco_without_line_counter_is_an_error() {
        let xml = r#"<report name="x"><counter type="METHOD" missed="0" covered="1"/></report>"#;
        assert!(parse_jacoco_report(xml).is_err());
    }

    #[test]
    fn path_probe_finds_first_match() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_b.path().join("mvn"), "#!/bin/sh\n").unwrap();

        let dirs = vec![dir_a.path().to_path_buf(), dir_b.path().to_path_buf()];
        let found = find_in_path_dirs("mvn", &dirs).unwrap();
        assert_eq!(found, dir_b.path().join("mvn"));
        assert!(find_in_path_dirs("gradle", &dirs).is_none());
    }

    #[test]
    fn timeout_outcome_is_flagged() {
        let outcome = BuildOutcome::timed_out(Duration::from_secs(1));
        assert!(!outcome.success);
        assert!(outcome.is_timeout());
    }
}
