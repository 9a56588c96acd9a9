//! Project scanner.
//!
//! Enumerates production classes under the configured source root and asks
//! the analyzer for their public methods, producing the run's [`Target`]
//! list. Files the analyzer cannot parse are logged and skipped; a missing
//! analyzer binary aborts the scan.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::analyzer::AnalyzerBridge;
use crate::error::{Error, Result};
use crate::model::Target;

/// Files that declare no testable methods.
const SKIP_FILES: &[&str] = &["package-info.java", "module-info.java"];

/// Scans `project_root/source_root` and returns one target per public
/// production method, in deterministic (path, declaration) order.
pub async fn scan_project(
    project_root: &Path,
    source_root: &Path,
    analyzer: &AnalyzerBridge,
) -> Result<Vec<Target>> {
    let root = project_root.join(source_root);
    if !root.is_dir() {
        return Err(Error::ConfigInvalid(format!(
            "source root {} does not exist",
            root.display()
        )));
    }

    let files = collect_java_files(&root)?;
    info!(files = files.len(), root = %root.display(), "scanning production sources");

    let mut targets = Vec::new();
    let mut skipped = 0usize;
    for file in &files {
        // Path of the file relative to the project root, as recorded on
        // each target and used by patch application.
        let relative = source_root.join(
            file.strip_prefix(&root)
                .map_err(|e| Error::InternalInvariant(format!("scan path underflow: {e}")))?,
        );
        match analyzer.analyze_file(file, &relative).await {
            Ok(found) => targets.extend(found),
            Err(e @ Error::ExternalToolMissing(_)) => return Err(e),
            Err(e) => {
                skipped += 1;
                warn!(file = %file.display(), error_kind = e.kind(), "skipping unanalyzable file");
            }
        }
    }

    info!(
        targets = targets.len(),
        skipped_files = skipped,
        "scan complete"
    );
    Ok(targets)
}

/// Recursively collects `.java` files under `root`, sorted by path.
pub fn collect_java_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "java") {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !SKIP_FILES.contains(&name) {
                    files.push(path);
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_java_files_recursively_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("com/b")).unwrap();
        std::fs::create_dir_all(dir.path().join("com/a")).unwrap();
        std::fs::write(dir.path().join("com/b/Late.java"), "").unwrap();
        std::fs::write(dir.path().join("com/a/Early.java"), "").unwrap();
        std::fs::write(dir.path().join("com/a/notes.txt"), "").unwrap();
        std::fs::write(dir.path().join("com/a/package-info.java"), "").unwrap();

        let files = collect_java_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("com/a/Early.java"));
        assert!(files[1].ends_with("com/b/Late.java"));
    }

    #[test]
    fn empty_tree_yields_no_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_java_files(dir.path()).unwrap().is_empty());
    }
}
