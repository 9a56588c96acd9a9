//! Chunkers for the knowledge base.
//!
//! Code is chunked at method granularity: one chunk per method, never
//! split inside a body. A method longer than any budget becomes a single
//! oversized chunk. Prose (bug reports, contracts written as text) is
//! chunked into heading-bounded windows of at most a configured token
//! budget, with one paragraph of overlap between consecutive windows.

use crate::model::Target;

/// Renders the single contract chunk for a target's method.
///
/// The chunk carries everything a generation prompt wants verbatim:
/// signature, javadoc, and the method source with original line breaks.
pub fn method_chunk(target: &Target) -> String {
    let mut text = String::new();
    if let Some(javadoc) = &target.javadoc {
        text.push_str(javadoc.trim());
        text.push('\n');
    }
    text.push_str(&target.signature);
    text.push('\n');
    text.push_str(&target.source_text);
    text
}

/// Splits prose into heading-bounded windows of at most `token_budget`
/// tokens, with one-paragraph overlap between consecutive windows.
///
/// Headings are Markdown `#`-prefixed lines; they bound windows, so a
/// chunk never spans two sections. Tokens are whitespace-delimited words,
/// a deliberate approximation that errs on the small side.
pub fn prose_chunks(text: &str, token_budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();

    for section in split_sections(text) {
        let paragraphs = split_paragraphs(&section);
        if paragraphs.is_empty() {
            continue;
        }

        let mut window: Vec<&str> = Vec::new();
        let mut window_tokens = 0usize;

        for paragraph in &paragraphs {
            let tokens = token_count(paragraph);
            if !window.is_empty() && window_tokens + tokens > token_budget {
                chunks.push(window.join("\n\n"));
                // One-paragraph overlap: the new window starts with the
                // previous window's last paragraph.
                let carry = window[window.len() - 1];
                window = vec![carry];
                window_tokens = token_count(carry);
            }
            window.push(paragraph);
            window_tokens += tokens;
        }

        if !window.is_empty() {
            chunks.push(window.join("\n\n"));
        }
    }

    chunks
}

/// Approximate token count: whitespace-delimited words.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Splits text into sections at Markdown headings. The heading line stays
/// with its section. Text before the first heading is its own section.
fn split_sections(text: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim_start().starts_with('#') && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn split_paragraphs(section: &str) -> Vec<&str> {
    section
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalyzerFacts, TargetId};

    fn target_with_body(body: &str) -> Target {
        Target {
            id: TargetId::new("com.math.Calc", "divide", ["int", "int"]),
            source_file: "src/main/java/com/math/Calc.java".into(),
            line_start: 10,
            line_end: 14,
            signature: "public int divide(int a, int b)".into(),
            javadoc: Some("/** Divides a by b. */".into()),
            source_text: body.into(),
            collaborators: vec![],
            facts: AnalyzerFacts::default(),
        }
    }

    #[test]
    fn method_chunk_keeps_body_whole() {
        // A body far beyond any prose budget still yields one chunk.
        let body = "line;\n".repeat(500);
        let chunk = method_chunk(&target_with_body(&body));
        assert!(chunk.contains("public int divide"));
        assert_eq!(chunk.matches("line;").count(), 500);
    }

    #[test]
    fn method_chunk_includes_javadoc() {
        let chunk = method_chunk(&target_with_body("return a / b;"));
        assert!(chunk.starts_with("/** Divides a by b. */"));
    }

    #[test]
    fn prose_chunks_respect_headings() {
        let text = "## Problem\n\nshort paragraph\n\n## Fix\n\nanother paragraph";
        let chunks = prose_chunks(text, 100);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("Problem"));
        assert!(chunks[1].contains("Fix"));
    }

    #[test]
    fn prose_chunks_window_with_overlap() {
        let p1 = "alpha ".repeat(30);
        let p2 = "beta ".repeat(30);
        let p3 = "gamma ".repeat(30);
        let text = format!("{p1}\n\n{p2}\n\n{p3}");

        // Budget fits two paragraphs per window.
        let chunks = prose_chunks(&text, 70);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("alpha") && chunks[0].contains("beta"));
        // Overlap: the second window re-carries the previous paragraph.
        assert!(chunks[1].contains("beta") && chunks[1].contains("gamma"));
    }

    #[test]
    fn oversized_single_paragraph_is_one_chunk() {
        let text = "word ".repeat(1000);
        let chunks = prose_chunks(&text, 50);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(prose_chunks("", 100).is_empty());
        assert!(prose_chunks("\n\n\n", 100).is_empty());
    }
}
