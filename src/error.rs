//! Semantic error kinds shared across the control plane.
//!
//! Every failure surfaced between components carries one of the kinds below.
//! The kinds are categorized to enable appropriate handling strategies:
//!
//! - **Fatal**: `ConfigInvalid`, `ExternalToolMissing`, `InternalInvariant` -
//!   the run writes a checkpoint and exits non-zero
//! - **Retryable**: `LlmUnreachable`, `Timeout`, `EmbeddingFailed` - retried
//!   with exponential backoff, then the action becomes a no-op for the round
//! - **Per-action**: everything else - the offending artifact is rejected,
//!   the action's budget is burned, and the loop continues
//!
//! # Example
//!
//! ```
//! use covolve::error::Error;
//!
//! let err = Error::PatchOutOfBounds("lines 90..95 exceed file of 40 lines".into());
//! assert_eq!(err.kind(), "patch_out_of_bounds");
//! assert!(!err.is_fatal());
//! assert!(!err.is_retryable());
//! ```

use std::future::Future;
use std::time::Duration;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the co-evolution loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration file is missing, unparseable, or inconsistent.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A required external tool (build driver, analyzer, formatter) could
    /// not be located at startup.
    #[error("External tool missing: {0}")]
    ExternalToolMissing(String),

    /// The LLM endpoint could not be reached or returned a transport error.
    #[error("LLM unreachable: {0}")]
    LlmUnreachable(String),

    /// The LLM responded, but the payload did not validate against the
    /// expected response schema for the prompt role.
    #[error("Malformed LLM response: {0}")]
    LlmMalformedResponse(String),

    /// The structural analyzer produced output that could not be parsed.
    #[error("Analyzer parse failed: {0}")]
    AnalyzerParseFailed(String),

    /// The code formatter rejected or mangled a generated source file.
    #[error("Formatting failed: {0}")]
    FormatFailed(String),

    /// Production or test compilation failed.
    #[error("Build failed: {0}")]
    BuildFailed(String),

    /// The test phase failed in a way that is not a plain assertion failure
    /// (runner crash, unclassifiable exit code).
    #[error("Test run failed: {0}")]
    TestFailed(String),

    /// An external operation exceeded its per-op timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error while manipulating a sandbox.
    #[error("Sandbox I/O error: {0}")]
    SandboxIo(String),

    /// Embedding generation failed after retries.
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    /// A mutant patch referenced lines outside its target's range.
    #[error("Patch out of bounds: {0}")]
    PatchOutOfBounds(String),

    /// An accepted test made a previously-active test fail on the
    /// unmutated baseline.
    #[error("Baseline regressed: {0}")]
    BaselineRegressed(String),

    /// An internal invariant was violated. Always a bug.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl Error {
    /// Stable snake_case name of the error kind, used in structured logs
    /// and persisted records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "config_invalid",
            Error::ExternalToolMissing(_) => "external_tool_missing",
            Error::LlmUnreachable(_) => "llm_unreachable",
            Error::LlmMalformedResponse(_) => "llm_malformed_response",
            Error::AnalyzerParseFailed(_) => "analyzer_parse_failed",
            Error::FormatFailed(_) => "format_failed",
            Error::BuildFailed(_) => "build_failed",
            Error::TestFailed(_) => "test_failed",
            Error::Timeout(_) => "timeout",
            Error::SandboxIo(_) => "sandbox_io",
            Error::EmbeddingFailed(_) => "embedding_failed",
            Error::PatchOutOfBounds(_) => "patch_out_of_bounds",
            Error::BaselineRegressed(_) => "baseline_regressed",
            Error::InternalInvariant(_) => "internal_invariant",
        }
    }

    /// Whether this error aborts the whole run (after a checkpoint).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigInvalid(_) | Error::ExternalToolMissing(_) | Error::InternalInvariant(_)
        )
    }

    /// Whether the failed operation may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LlmUnreachable(_) | Error::Timeout(_) | Error::EmbeddingFailed(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::SandboxIo(e.to_string())
    }
}

/// Maximum attempts for retryable operations.
pub const MAX_RETRIES: u32 = 3;

/// Runs `op` up to [`MAX_RETRIES`] times, sleeping with exponential backoff
/// between attempts. Non-retryable errors are returned immediately.
///
/// The backoff schedule is `base * 2^attempt`, i.e. base, 2*base, 4*base.
pub async fn with_backoff<T, F, Fut>(base: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 0..MAX_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                tracing::debug!(
                    error_kind = e.kind(),
                    attempt,
                    "retryable failure, backing off"
                );
                if attempt + 1 < MAX_RETRIES {
                    tokio::time::sleep(base * 2u32.pow(attempt)).await;
                }
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::InternalInvariant("retry loop with zero attempts".into())))
}
