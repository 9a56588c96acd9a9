//! Rendering and additive merging of per-target test classes.
//!
//! Every target owns exactly one test class on disk, named
//! `{ClassName}_{methodName}Test`. Write-back is additive: new `@Test`
//! methods are appended before the class's closing brace, existing
//! methods are never edited or deleted. The functions here are pure; the
//! planner handles snapshots, formatting, and the baseline check around
//! them.

use crate::error::{Error, Result};
use crate::llm::prompt::GeneratedTest;
use crate::model::TargetId;

/// Imports every generated test class gets.
const DEFAULT_IMPORTS: &[&str] = &[
    "org.junit.jupiter.api.Test",
    "static org.junit.jupiter.api.Assertions.*",
    "static org.mockito.Mockito.*",
];

/// Package of the test class: same as the production class.
pub fn package_of(id: &TargetId) -> Option<&str> {
    id.class_fqn.rsplit_once('.').map(|(package, _)| package)
}

/// Path of the target's test file relative to the test source root.
pub fn test_file_relative(id: &TargetId) -> std::path::PathBuf {
    let mut path = std::path::PathBuf::new();
    if let Some(package) = package_of(id) {
        for part in package.split('.') {
            path.push(part);
        }
    }
    path.push(format!("{}.java", id.test_class_name()));
    path
}

/// Renders a fresh test class containing the given methods.
pub fn render_test_class(
    id: &TargetId,
    extra_imports: &[String],
    methods: &[GeneratedTest],
) -> String {
    let mut source = String::new();
    if let Some(package) = package_of(id) {
        source.push_str(&format!("package {package};\n\n"));
    }
    for import in DEFAULT_IMPORTS {
        source.push_str(&format!("import {import};\n"));
    }
    for import in extra_imports {
        let import = import.trim();
        if !import.is_empty() && !DEFAULT_IMPORTS.contains(&import) {
            source.push_str(&format!("import {import};\n"));
        }
    }
    source.push_str(&format!("\nclass {} {{\n", id.test_class_name()));
    for method in methods {
        push_method(&mut source, method);
    }
    source.push_str("}\n");
    source
}

/// Appends methods to an existing test class, before its final closing
/// brace. Methods whose name already exists in the class are skipped, so
/// re-generation cannot shadow or duplicate earlier tests.
///
/// Returns the merged source and the names actually added.
pub fn merge_test_methods(
    existing: &str,
    methods: &[GeneratedTest],
) -> Result<(String, Vec<String>)> {
    let close = existing.rfind('}').ok_or_else(|| {
        Error::InternalInvariant("test class has no closing brace".into())
    })?;

    let mut merged = existing[..close].trim_end().to_string();
    merged.push('\n');
    let mut added = Vec::new();
    for method in methods {
        if method_exists(existing, &method.method_name) {
            continue;
        }
        push_method(&mut merged, method);
        added.push(method.method_name.clone());
    }
    merged.push_str("}\n");
    Ok((merged, added))
}

fn push_method(source: &mut String, method: &GeneratedTest) {
    source.push('\n');
    for line in method.source.trim().lines() {
        source.push_str("  ");
        source.push_str(line);
        source.push('\n');
    }
}

/// Whether a method with this name is already declared in the source.
fn method_exists(source: &str, name: &str) -> bool {
    source
        .match_indices(name)
        .any(|(idx, _)| {
            let before = source[..idx].chars().next_back();
            let after = source[idx + name.len()..].chars().next();
            let bounded_before = !before.is_some_and(|c| c.is_alphanumeric() || c == '_');
            // A declaration or call site: the name is followed by `(`.
            bounded_before && after == Some('(')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> TargetId {
        TargetId::new("com.math.Calc", "divide", ["int", "int"])
    }

    fn test(name: &str, body: &str) -> GeneratedTest {
        GeneratedTest {
            method_name: name.into(),
            source: format!("@Test\nvoid {name}() {{\n  {body}\n}}"),
        }
    }

    #[test]
    fn renders_package_imports_and_class() {
        let source = render_test_class(&id(), &[], &[test("dividesEvenly", "assertEquals(5, new Calc().divide(10, 2));")]);
        assert!(source.starts_with("package com.math;"));
        assert!(source.contains("import org.junit.jupiter.api.Test;"));
        assert!(source.contains("class Calc_divideTest {"));
        assert!(source.contains("void dividesEvenly()"));
        assert!(source.trim_end().ends_with('}'));
    }

    #[test]
    fn extra_imports_are_deduplicated() {
        let source = render_test_class(
            &id(),
            &[
                "java.util.List".into(),
                "org.junit.jupiter.api.Test".into(),
            ],
            &[test("t", "")],
        );
        assert!(source.contains("import java.util.List;"));
        assert_eq!(source.matches("import org.junit.jupiter.api.Test;").count(), 1);
    }

    #[test]
    fn default_package_omits_package_line() {
        let bare = TargetId::new("Calc", "divide", ["int"]);
        let source = render_test_class(&bare, &[], &[test("t", "")]);
        assert!(!source.contains("package "));
    }

    #[test]
    fn merge_appends_before_closing_brace() {
        let existing = render_test_class(&id(), &[], &[test("first", "")]);
        let (merged, added) =
            merge_test_methods(&existing, &[test("second", "assertTrue(true);")]).unwrap();
        assert_eq!(added, vec!["second"]);
        assert!(merged.contains("void first()"));
        assert!(merged.contains("void second()"));
        // Still exactly one class-closing brace at the end.
        assert!(merged.trim_end().ends_with('}'));
        let first_pos = merged.find("void first").unwrap();
        let second_pos = merged.find("void second").unwrap();
        assert!(second_pos > first_pos);
    }

    #[test]
    fn merge_skips_duplicate_method_names() {
        let existing = render_test_class(&id(), &[], &[test("first", "")]);
        let (merged, added) =
            merge_test_methods(&existing, &[test("first", "different body")]).unwrap();
        assert!(added.is_empty());
        assert_eq!(merged.matches("void first()").count(), 1);
    }

    #[test]
    fn merge_never_deletes_existing_methods() {
        let existing = render_test_class(&id(), &[], &[test("a", ""), test("b", "")]);
        let (merged, _) = merge_test_methods(&existing, &[test("c", "")]).unwrap();
        for name in ["a", "b", "c"] {
            assert!(merged.contains(&format!("void {name}()")));
        }
    }

    #[test]
    fn merge_rejects_braceless_source() {
        let err = merge_test_methods("not java at all", &[test("t", "")]).unwrap_err();
        assert_eq!(err.kind(), "internal_invariant");
    }

    #[test]
    fn test_file_path_follows_package() {
        let path = test_file_relative(&id());
        assert_eq!(
            path,
            std::path::PathBuf::from("com/math/Calc_divideTest.java")
        );
    }
}
