//! Configuration loading and schema definitions for covolve.
//!
//! Configuration is TOML, loaded with [`load_config`] (file) or
//! [`load_config_str`] (string). After parsing, `${VAR}` references in the
//! LLM and embedding endpoint fields are expanded from the environment so
//! API keys never need to live in the file.

pub mod schema;

pub use schema::*;

use std::path::Path;

use crate::error::{Error, Result};

/// Loads covolve configuration from a TOML file.
///
/// # Errors
///
/// Returns `config_invalid` if the file cannot be read, contains invalid
/// TOML, does not match the schema, or references an unset required
/// environment variable.
///
/// # Example
///
/// ```no_run
/// use covolve::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("covolve.toml"))?;
/// println!("Max rounds: {}", config.agent.max_iterations);
/// # Ok::<(), covolve::error::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigInvalid(format!("failed to read {}: {e}", path.display()))
    })?;
    load_config_str(&content)
}

/// Loads covolve configuration from a TOML string.
///
/// Useful for testing and for embedding configuration programmatically.
///
/// # Example
///
/// ```
/// use covolve::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [llm]
///     base_url = "http://localhost:8000/v1"
///     model = "local-model"
///
///     [agent]
///     max_iterations = 5
/// "#)?;
///
/// assert_eq!(config.agent.max_iterations, 5);
/// # Ok::<(), covolve::error::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content)
        .map_err(|e| Error::ConfigInvalid(format!("failed to parse config: {e}")))?;

    expand_endpoints(&mut config)?;
    validate(&config)?;

    Ok(config)
}

/// Expands environment variable references in a string value.
///
/// Syntax:
/// - `${VAR}` - required, fails if VAR is not set
/// - `${VAR:-default}` - optional, uses "default" if VAR not set
/// - `$$` - escaped dollar sign (becomes single `$`)
fn expand_env_value(value: &str) -> std::result::Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next(); // consume '{'

                    let mut var_content = String::new();
                    let mut found_close = false;

                    for c in chars.by_ref() {
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_content.push(c);
                    }

                    if !found_close {
                        return Err(format!("Unclosed variable reference: ${{{var_content}"));
                    }

                    // VAR:-default
                    let (var_name, default_value) = if let Some(idx) = var_content.find(":-") {
                        let (name, rest) = var_content.split_at(idx);
                        (name, Some(&rest[2..]))
                    } else {
                        (var_content.as_str(), None)
                    };

                    if var_name.is_empty() {
                        return Err("Empty variable name in ${}".to_string());
                    }

                    match std::env::var(var_name) {
                        Ok(val) => result.push_str(&val),
                        Err(_) => {
                            if let Some(default) = default_value {
                                result.push_str(default);
                            } else {
                                return Err(format!(
                                    "Required environment variable not set: {var_name}"
                                ));
                            }
                        }
                    }
                }
                _ => {
                    // Lone $ without { or $, treat as literal
                    result.push('$');
                }
            }
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

fn expand_field(field: &mut String, name: &str) -> Result<()> {
    *field = expand_env_value(field)
        .map_err(|e| Error::ConfigInvalid(format!("failed to expand {name}: {e}")))?;
    Ok(())
}

/// Expands environment references in the endpoint fields that may carry
/// secrets or deployment-specific URLs.
fn expand_endpoints(config: &mut Config) -> Result<()> {
    expand_field(&mut config.llm.base_url, "llm.base_url")?;
    expand_field(&mut config.llm.api_key, "llm.api_key")?;
    expand_field(
        &mut config.knowledge.embedding.base_url,
        "knowledge.embedding.base_url",
    )?;
    Ok(())
}

/// Rejects configurations that parse but cannot work.
fn validate(config: &Config) -> Result<()> {
    if config.llm.base_url.is_empty() {
        return Err(Error::ConfigInvalid("llm.base_url is empty".into()));
    }
    if config.llm.model.is_empty() {
        return Err(Error::ConfigInvalid("llm.model is empty".into()));
    }
    if !(0.0..=1.0).contains(&config.knowledge.alpha) {
        return Err(Error::ConfigInvalid(format!(
            "knowledge.alpha must be in [0, 1], got {}",
            config.knowledge.alpha
        )));
    }
    if config.preprocessing.max_workers == 0 {
        return Err(Error::ConfigInvalid(
            "preprocessing.max_workers must be at least 1".into(),
        ));
    }
    if config.agent.parallel_targets == 0 {
        return Err(Error::ConfigInvalid(
            "agent.parallel_targets must be at least 1".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [llm]
        base_url = "http://localhost:8000/v1"
        model = "test-model"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = load_config_str(MINIMAL).unwrap();
        assert_eq!(config.agent.max_iterations, 30);
        assert_eq!(config.agent.stop_on_no_improvement_rounds, 3);
        assert_eq!(config.knowledge.alpha, 0.7);
        assert_eq!(config.knowledge.top_k_contracts, 5);
        assert_eq!(config.agent.weights.w1, 0.5);
        assert_eq!(config.agent.weights.w4, 0.3);
        assert_eq!(config.agent.excellence_thresholds.mutation_score, 0.95);
        assert_eq!(config.project.source_root.to_str(), Some("src/main/java"));
        assert!(config.knowledge.enabled);
        assert_eq!(config.formatting.style, FormatStyle::Google);
    }

    #[test]
    fn aosp_style_parses() {
        let toml = format!("{MINIMAL}\n[formatting]\nstyle = \"AOSP\"");
        let config = load_config_str(&toml).unwrap();
        assert_eq!(config.formatting.style, FormatStyle::Aosp);
    }

    #[test]
    fn missing_llm_section_is_invalid() {
        let result = load_config_str("[agent]\nmax_iterations = 3");
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn alpha_out_of_range_is_invalid() {
        let toml = format!("{MINIMAL}\n[knowledge]\nalpha = 1.5");
        assert!(load_config_str(&toml).is_err());
    }

    #[test]
    fn zero_workers_is_invalid() {
        let toml = format!("{MINIMAL}\n[preprocessing]\nmax_workers = 0");
        assert!(load_config_str(&toml).is_err());
    }

    #[test]
    fn test_expand_env_value_no_variables() {
        assert_eq!(expand_env_value("hello world").unwrap(), "hello world");
    }

    #[test]
    fn test_expand_env_value_escaped_dollar() {
        assert_eq!(expand_env_value("price is $$100").unwrap(), "price is $100");
    }

    #[test]
    fn test_expand_env_value_literal_dollar_no_brace() {
        assert_eq!(expand_env_value("$x and $y").unwrap(), "$x and $y");
    }

    #[test]
    fn test_expand_env_value_empty_var_name() {
        let result = expand_env_value("${}");
        assert!(matches!(&result, Err(e) if e.contains("Empty variable name")));
    }

    #[test]
    fn test_expand_env_value_unclosed_brace() {
        let result = expand_env_value("${VAR");
        assert!(matches!(&result, Err(e) if e.contains("Unclosed variable reference")));
    }

    // Tests using predictable environment variables (HOME exists,
    // _COVOLVE_TEST_* do not)

    #[test]
    fn test_expand_env_value_var_set() {
        let result = expand_env_value("${HOME}").unwrap();
        assert!(!result.is_empty());
    }

    #[test]
    fn test_expand_env_value_var_unset() {
        assert!(expand_env_value("${_COVOLVE_TEST_NONEXISTENT_VAR}").is_err());
    }

    #[test]
    fn test_expand_env_value_default_used_when_unset() {
        let result = expand_env_value("${_COVOLVE_TEST_MISSING:-fallback}").unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn test_expand_env_value_empty_default() {
        let result = expand_env_value("${_COVOLVE_TEST_MISSING:-}").unwrap();
        assert_eq!(result, "");
    }

    #[test]
    fn api_key_expansion_applies_to_loaded_config() {
        let toml = r#"
            [llm]
            base_url = "http://localhost:8000/v1"
            api_key = "${_COVOLVE_TEST_KEY:-sk-fallback}"
            model = "test-model"
        "#;
        let config = load_config_str(toml).unwrap();
        assert_eq!(config.llm.api_key, "sk-fallback");
    }
}
