//! Typed prompt roles and validated response schemas.
//!
//! Generation goes through a finite set of roles, each with a fixed
//! template and a typed output schema. Responses are extracted from the
//! model's text (fenced JSON preferred, bare JSON tolerated) and validated
//! before anything downstream sees them; failures are
//! `llm_malformed_response` and cost the round its action.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::knowledge::RetrievedChunk;
use crate::model::{Mutant, SemanticTag, Target};

/// The four generation roles the planner can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptRole {
    GenTestsInitial,
    GenTestsRefine,
    GenMutantsInitial,
    GenMutantsRefine,
}

impl PromptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptRole::GenTestsInitial => "gen_tests_initial",
            PromptRole::GenTestsRefine => "gen_tests_refine",
            PromptRole::GenMutantsInitial => "gen_mutants_initial",
            PromptRole::GenMutantsRefine => "gen_mutants_refine",
        }
    }

    /// System message for this role.
    pub fn system_prompt(self) -> &'static str {
        match self {
            PromptRole::GenTestsInitial | PromptRole::GenTestsRefine => {
                "You are an expert Java unit-test engineer. You write minimal, \
                 deterministic JUnit 5 tests with Mockito for collaborators. \
                 Respond with a single JSON object and nothing else."
            }
            PromptRole::GenMutantsInitial | PromptRole::GenMutantsRefine => {
                "You are an expert in software faults. You propose small, \
                 plausible semantic mutations of Java methods that compile and \
                 change behavior. Respond with a single JSON object and nothing \
                 else."
            }
        }
    }
}

/// One generated test method.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GeneratedTest {
    pub method_name: String,
    pub source: String,
}

/// Validated output of a test-generation role.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GeneratedTests {
    pub tests: Vec<GeneratedTest>,
    /// Imports the test class needs beyond the defaults.
    #[serde(default)]
    pub imports: Vec<String>,
}

/// One proposed mutation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GeneratedMutant {
    pub line_start: u32,
    pub line_end: u32,
    pub original: String,
    pub mutated: String,
    pub tag: SemanticTag,
    /// Short human description of the fault.
    #[serde(default)]
    pub description: String,
}

/// Validated output of a mutant-generation role.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GeneratedMutants {
    pub mutants: Vec<GeneratedMutant>,
}

/// Renders the user prompt for a test-generation role.
///
/// The retrieved-context section is omitted entirely when `context` is
/// empty (notably when the knowledge layer is disabled). For the refine
/// role, `surviving` lists the mutants the new tests should kill, oldest
/// first.
pub fn render_tests_prompt(
    role: PromptRole,
    target: &Target,
    context: &[RetrievedChunk],
    surviving: &[&Mutant],
) -> String {
    let mut prompt = String::new();
    push_target_section(&mut prompt, target);
    push_context_section(&mut prompt, context);

    if role == PromptRole::GenTestsRefine && !surviving.is_empty() {
        prompt.push_str("## Surviving mutants to kill\n\n");
        prompt.push_str(
            "Each mutant below still passes every existing test. Write tests \
             that fail on the mutated code but pass on the original.\n\n",
        );
        for mutant in surviving {
            prompt.push_str(&format!(
                "- mutant {} (lines {}-{}): `{}` -> `{}`\n",
                mutant.id,
                mutant.patch.line_start,
                mutant.patch.line_end,
                mutant.patch.original.trim(),
                mutant.patch.mutated.trim(),
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "## Task\n\n\
         Write JUnit 5 test methods for `{}`. Mock these collaborators with \
         Mockito: {}. Tests must pass against the shown (correct) \
         implementation.\n\n\
         Respond with JSON: {{\"tests\": [{{\"method_name\": \"...\", \
         \"source\": \"<full @Test method>\"}}], \"imports\": [\"...\"]}}\n",
        target.id,
        if target.collaborators.is_empty() {
            "none".to_string()
        } else {
            target.collaborators.join(", ")
        },
    ));
    prompt
}

/// Renders the user prompt for a mutant-generation role. `existing` lists
/// mutants already proposed so the model avoids duplicates.
pub fn render_mutants_prompt(
    role: PromptRole,
    target: &Target,
    context: &[RetrievedChunk],
    existing: &[&Mutant],
) -> String {
    let mut prompt = String::new();
    push_target_section(&mut prompt, target);
    push_context_section(&mut prompt, context);

    if role == PromptRole::GenMutantsRefine && !existing.is_empty() {
        prompt.push_str("## Already proposed (do not repeat)\n\n");
        for mutant in existing {
            prompt.push_str(&format!(
                "- lines {}-{}: `{}`\n",
                mutant.patch.line_start,
                mutant.patch.line_end,
                mutant.patch.mutated.trim(),
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "## Task\n\n\
         Propose up to 5 single-fault mutations of `{}`. Each replaces an \
         inclusive line range shown above with mutated code that still \
         compiles. Line numbers are absolute. Allowed tags: \
         null_check_removed, boundary_flipped, return_value_changed, \
         operator_swapped, exception_swallowed, off_by_one, other.\n\n\
         Respond with JSON: {{\"mutants\": [{{\"line_start\": N, \
         \"line_end\": N, \"original\": \"...\", \"mutated\": \"...\", \
         \"tag\": \"...\", \"description\": \"...\"}}]}}\n",
        target.id,
    ));
    prompt
}

fn push_target_section(prompt: &mut String, target: &Target) {
    prompt.push_str(&format!("## Method under test\n\n`{}`\n\n", target.signature));
    if let Some(javadoc) = &target.javadoc {
        prompt.push_str(javadoc.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str("```java\n");
    for (offset, line) in target.source_text.lines().enumerate() {
        prompt.push_str(&format!("{:>5} {}\n", target.line_start + offset as u32, line));
    }
    prompt.push_str("```\n\n");
}

fn push_context_section(prompt: &mut String, context: &[RetrievedChunk]) {
    if context.is_empty() {
        return;
    }
    prompt.push_str("## Retrieved context\n\n");
    for chunk in context {
        prompt.push_str(chunk.text.trim());
        prompt.push_str("\n\n---\n\n");
    }
}

/// Parses and validates a test-generation response.
pub fn parse_generated_tests(text: &str) -> Result<GeneratedTests> {
    let parsed: GeneratedTests = parse_json_payload(text)?;
    if parsed.tests.is_empty() {
        return Err(Error::LlmMalformedResponse("empty tests array".into()));
    }
    for test in &parsed.tests {
        if !is_java_identifier(&test.method_name) {
            return Err(Error::LlmMalformedResponse(format!(
                "invalid test method name `{}`",
                test.method_name
            )));
        }
        if !test.source.contains("@Test") {
            return Err(Error::LlmMalformedResponse(format!(
                "test `{}` carries no @Test annotation",
                test.method_name
            )));
        }
    }
    Ok(parsed)
}

/// Parses and validates a mutant-generation response. Bounds against the
/// target's line range are checked later, patch by patch.
pub fn parse_generated_mutants(text: &str) -> Result<GeneratedMutants> {
    let parsed: GeneratedMutants = parse_json_payload(text)?;
    if parsed.mutants.is_empty() {
        return Err(Error::LlmMalformedResponse("empty mutants array".into()));
    }
    for mutant in &parsed.mutants {
        if mutant.mutated == mutant.original {
            return Err(Error::LlmMalformedResponse(
                "mutant does not change the code".into(),
            ));
        }
    }
    Ok(parsed)
}

/// Extracts the JSON payload from a model response: a ```json fence if
/// present, otherwise the outermost braces.
fn extract_json(text: &str) -> Option<&str> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex")
    });
    if let Some(captures) = fence.captures(text) {
        return captures.get(1).map(|m| m.as_str());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

fn parse_json_payload<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    let payload = extract_json(text)
        .ok_or_else(|| Error::LlmMalformedResponse("no JSON object in response".into()))?;
    serde_json::from_str(payload).map_err(|e| Error::LlmMalformedResponse(e.to_string()))
}

fn is_java_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}
