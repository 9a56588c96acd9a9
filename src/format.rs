//! Formatter bridge.
//!
//! Generated test files are normalized with an external Java formatter
//! (google-java-format by default) before the baseline check, so diffs in
//! the workspace stay reviewable regardless of what the LLM emitted.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::config::{FormatStyle, FormattingConfig};
use crate::error::{Error, Result};

/// Bridge to the external code formatter.
#[derive(Debug)]
pub struct Formatter {
    program: String,
    base_args: Vec<String>,
    style: FormatStyle,
    timeout: Duration,
}

impl Formatter {
    pub fn new(config: &FormattingConfig) -> Result<Self> {
        let words = shell_words::split(&config.command)
            .map_err(|e| Error::ConfigInvalid(format!("formatting.command: {e}")))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| Error::ConfigInvalid("formatting.command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            base_args: args.to_vec(),
            style: config.style,
            timeout: Duration::from_secs(60),
        })
    }

    /// Formats one file in place.
    pub async fn format_file(&self, file: &Path) -> Result<()> {
        debug!(file = %file.display(), style = ?self.style, "formatting");
        let child = tokio::process::Command::new(&self.program)
            .args(&self.base_args)
            .args(style_args(self.style))
            .arg("--replace")
            .arg(file)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::ExternalToolMissing(format!("formatter `{}` not found", self.program))
                }
                _ => Error::FormatFailed(format!("failed to spawn formatter: {e}")),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(format!("formatter on {}", file.display())))?
            .map_err(|e| Error::FormatFailed(format!("formatter I/O error: {e}")))?;

        if !output.status.success() {
            return Err(Error::FormatFailed(format!(
                "formatter exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Extra flags selecting the formatting style.
fn style_args(style: FormatStyle) -> &'static [&'static str] {
    match style {
        // GOOGLE is the formatter's default.
        FormatStyle::Google => &[],
        FormatStyle::Aosp => &["--aosp"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn google_style_adds_no_flags() {
        assert!(style_args(FormatStyle::Google).is_empty());
    }

    #[test]
    fn aosp_style_selects_aosp_flag() {
        assert_eq!(style_args(FormatStyle::Aosp), ["--aosp"]);
    }

    #[test]
    fn empty_command_is_config_invalid() {
        let config = FormattingConfig {
            style: FormatStyle::Google,
            command: "".into(),
        };
        assert_eq!(Formatter::new(&config).unwrap_err().kind(), "config_invalid");
    }

    #[tokio::test]
    async fn missing_formatter_binary_is_external_tool_missing() {
        let config = FormattingConfig {
            style: FormatStyle::Google,
            command: "covolve-definitely-not-a-real-formatter".into(),
        };
        let formatter = Formatter::new(&config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("X.java");
        std::fs::write(&file, "class X {}").unwrap();
        let err = formatter.format_file(&file).await.unwrap_err();
        assert_eq!(err.kind(), "external_tool_missing");
    }
}
