//! Bug-report ingestion.
//!
//! Reports are detected by extension: `.md` (optional YAML front-matter
//! for tags and severity), `.txt`, `.diff`, `.patch`. Parsers are
//! permissive; anything that doesn't match a known structure becomes a
//! generic prose section.
//!
//! Tags come from the front-matter `tags:` key and, when present, from a
//! `## Tags` (or `## 标签`) section body. Typical tags: `null-check`,
//! `overflow`, `boundary`, `race-condition`, `mock`, `validation`.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;

/// One parsed bug report.
#[derive(Debug, Clone, PartialEq)]
pub struct BugReport {
    pub path: PathBuf,
    pub title: String,
    pub tags: Vec<String>,
    pub severity: Option<String>,
    /// Semantic sections in document order (problem statement,
    /// reproduction, fix suggestion, ...).
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub heading: String,
    pub body: String,
}

/// Loads every recognized report under `dir` (non-recursive), sorted by
/// file name. Unreadable files are logged and skipped.
pub fn load_bug_reports(dir: &Path) -> Result<Vec<BugReport>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| matches!(ext, "md" | "txt" | "diff" | "patch"))
        })
        .collect();
    paths.sort();

    let mut reports = Vec::new();
    for path in paths {
        match std::fs::read_to_string(&path) {
            Ok(content) => reports.push(parse_bug_report(&path, &content)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable bug report"),
        }
    }
    Ok(reports)
}

/// Parses one report based on its extension.
pub fn parse_bug_report(path: &Path, content: &str) -> BugReport {
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") => parse_markdown(path, content),
        Some("diff") | Some("patch") => parse_diff(path, content),
        // .txt and anything else: one generic prose section.
        _ => plain_report(path, content),
    }
}

fn stem_title(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("bug-report")
        .to_string()
}

fn plain_report(path: &Path, content: &str) -> BugReport {
    BugReport {
        path: path.to_path_buf(),
        title: stem_title(path),
        tags: Vec::new(),
        severity: None,
        sections: vec![Section {
            heading: "report".into(),
            body: content.trim().to_string(),
        }],
    }
}

fn parse_markdown(path: &Path, content: &str) -> BugReport {
    let (front_matter, body) = split_front_matter(content);

    let mut tags = Vec::new();
    let mut severity = None;
    if let Some(front_matter) = front_matter {
        for line in front_matter.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "tags" => tags.extend(parse_tag_list(value)),
                "severity" => {
                    let value = value.trim();
                    if !value.is_empty() {
                        severity = Some(value.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    let mut title = stem_title(path);
    let mut sections = Vec::new();
    let mut heading = String::from("description");
    let mut lines: Vec<&str> = Vec::new();

    let mut flush = |heading: &mut String, lines: &mut Vec<&str>, sections: &mut Vec<Section>| {
        let body = lines.join("\n").trim().to_string();
        if !body.is_empty() {
            sections.push(Section {
                heading: std::mem::take(heading),
                body,
            });
        }
        lines.clear();
    };

    for line in body.lines() {
        if let Some(h1) = line.strip_prefix("# ") {
            title = h1.trim().to_string();
        } else if let Some(h2) = line.strip_prefix("## ") {
            flush(&mut heading, &mut lines, &mut sections);
            heading = h2.trim().to_string();
        } else {
            lines.push(line);
        }
    }
    flush(&mut heading, &mut lines, &mut sections);

    // A `## Tags` / `## 标签` section carries metadata, not prose.
    sections.retain(|s| {
        let is_tag_section = s.heading.eq_ignore_ascii_case("tags") || s.heading == "标签";
        if is_tag_section {
            tags.extend(parse_tag_list(&s.body));
        }
        !is_tag_section
    });

    tags.dedup();

    BugReport {
        path: path.to_path_buf(),
        title,
        tags,
        severity,
        sections,
    }
}

/// Splits an optional leading `--- ... ---` YAML block from the body.
fn split_front_matter(content: &str) -> (Option<String>, String) {
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix("---") else {
        return (None, content.to_string());
    };
    match rest.split_once("\n---") {
        Some((yaml, body)) => (
            Some(yaml.trim().to_string()),
            body.trim_start_matches(['-', '\n']).to_string(),
        ),
        None => (None, content.to_string()),
    }
}

/// Parses `[a, b]`, `a, b`, or whitespace/newline separated tags.
fn parse_tag_list(value: &str) -> Vec<String> {
    value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split([',', '\n', ' '])
        .map(|t| t.trim().trim_matches('"').trim_start_matches("- "))
        .filter(|t| !t.is_empty() && *t != "-")
        .map(str::to_string)
        .collect()
}

/// Splits a unified diff into one section per hunk, with the file headers
/// as a leading section.
fn parse_diff(path: &Path, content: &str) -> BugReport {
    let mut sections = Vec::new();
    let mut heading = String::from("header");
    let mut lines: Vec<&str> = Vec::new();

    for line in content.lines() {
        if line.starts_with("@@") {
            let body = lines.join("\n").trim().to_string();
            if !body.is_empty() {
                sections.push(Section {
                    heading: std::mem::take(&mut heading),
                    body,
                });
            }
            lines.clear();
            heading = line.trim().to_string();
        }
        lines.push(line);
    }
    let body = lines.join("\n").trim().to_string();
    if !body.is_empty() {
        sections.push(Section { heading, body });
    }

    BugReport {
        path: path.to_path_buf(),
        title: stem_title(path),
        tags: Vec::new(),
        severity: None,
        sections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_with_front_matter() {
        let content = "---\ntags: [boundary, validation]\nseverity: high\n---\n\
                       # Negative quantity accepted\n\n\
                       ## Problem\n\naddStock accepts quantity 0 when it should not.\n\n\
                       ## Fix suggestion\n\nUse a strict comparison.\n";
        let report = parse_bug_report(Path::new("BUG-002.md"), content);
        assert_eq!(report.title, "Negative quantity accepted");
        assert_eq!(report.tags, vec!["boundary", "validation"]);
        assert_eq!(report.severity.as_deref(), Some("high"));
        assert_eq!(report.sections.len(), 2);
        assert_eq!(report.sections[0].heading, "Problem");
        assert_eq!(report.sections[1].heading, "Fix suggestion");
    }

    #[test]
    fn markdown_tags_section_english() {
        let content = "## Problem\n\nNull slips through.\n\n## Tags\n\nnull-check, mock\n";
        let report = parse_bug_report(Path::new("BUG-001.md"), content);
        assert_eq!(report.tags, vec!["null-check", "mock"]);
        // The tag section is metadata, not a prose section.
        assert_eq!(report.sections.len(), 1);
        assert_eq!(report.sections[0].heading, "Problem");
    }

    #[test]
    fn markdown_tags_section_chinese() {
        let content = "## 问题\n\n越界。\n\n## 标签\n\nboundary overflow\n";
        let report = parse_bug_report(Path::new("BUG-003.md"), content);
        assert_eq!(report.tags, vec!["boundary", "overflow"]);
        assert_eq!(report.sections.len(), 1);
    }

    #[test]
    fn markdown_without_structure_is_one_description() {
        let content = "just a paragraph describing a bug";
        let report = parse_bug_report(Path::new("note.md"), content);
        assert_eq!(report.sections.len(), 1);
        assert_eq!(report.sections[0].heading, "description");
        assert!(report.tags.is_empty());
    }

    #[test]
    fn txt_is_one_generic_section() {
        let report = parse_bug_report(Path::new("crash.txt"), "stack trace here\nline 2");
        assert_eq!(report.title, "crash");
        assert_eq!(report.sections.len(), 1);
        assert_eq!(report.sections[0].heading, "report");
        assert!(report.sections[0].body.contains("line 2"));
    }

    #[test]
    fn diff_splits_per_hunk() {
        let content = "--- a/Calc.java\n+++ b/Calc.java\n\
                       @@ -10,2 +10,3 @@\n-return a / b;\n+if (b == 0) return 0;\n+return a / b;\n\
                       @@ -30,1 +31,1 @@\n-int x = 1;\n+int x = 2;\n";
        let report = parse_bug_report(Path::new("fix.patch"), content);
        assert_eq!(report.sections.len(), 3);
        assert_eq!(report.sections[0].heading, "header");
        assert!(report.sections[1].heading.starts_with("@@ -10"));
        assert!(report.sections[2].heading.starts_with("@@ -30"));
        assert!(report.sections[1].body.contains("b == 0"));
    }

    #[test]
    fn directory_load_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "## P\n\ntext").unwrap();
        std::fs::write(dir.path().join("a.txt"), "text").unwrap();
        std::fs::write(dir.path().join("ignore.json"), "{}").unwrap();

        let reports = load_bug_reports(dir.path()).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].title, "a");
        assert_eq!(reports[1].title, "b");
    }
}
