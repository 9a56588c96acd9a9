//! Workspace and per-mutant sandboxes.
//!
//! Two kinds of isolation are provided:
//!
//! - The *workspace sandbox* is a full working copy of the target project,
//!   created once per run and kept for its whole lifetime. All test-file
//!   writes, baseline compiles, baseline test runs, and coverage runs hit
//!   this copy. It is the single source of truth for the current suite.
//! - A *target sandbox* is an ephemeral shallow copy of the workspace made
//!   for a single mutant evaluation: a symlink farm over the workspace in
//!   which only the one file being mutated is materialized as a real
//!   copy. The directory is removed when the handle is dropped, on every
//!   exit path.
//!
//! Mutations never touch the workspace sandbox; tests never touch a target
//! sandbox except through the mutated file.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::Patch;

/// Directory names never copied into a sandbox.
///
/// `.git` is irrelevant to builds and large; `target` is the build output
/// of Maven projects and gets regenerated by the first compile.
const SKIP_DIRS: &[&str] = &[".git", "target", ".covolve"];

/// Creates and tracks the sandboxes of one run.
pub struct SandboxManager {
    /// Root under which the workspace and all ephemeral sandboxes live.
    root: PathBuf,
}

impl SandboxManager {
    /// Creates a manager rooted at `root` (usually `<state_dir>/run`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Copies the target project into the persistent workspace sandbox.
    ///
    /// An existing workspace from a previous run at the same root is
    /// replaced, except when `reuse` is set (the resume path), in which
    /// case the existing copy is kept as-is.
    pub async fn create_workspace(
        &self,
        project_path: &Path,
        reuse: bool,
    ) -> Result<WorkspaceSandbox> {
        let path = self.root.join("workspace");
        if path.exists() {
            if reuse {
                debug!(path = %path.display(), "reusing existing workspace sandbox");
                return Ok(WorkspaceSandbox { path });
            }
            tokio::fs::remove_dir_all(&path).await?;
        }
        copy_dir_all(project_path, &path).await?;
        debug!(
            from = %project_path.display(),
            to = %path.display(),
            "workspace sandbox created"
        );
        Ok(WorkspaceSandbox { path })
    }

    /// Creates an ephemeral sandbox for one isolated piece of work, a
    /// mutant evaluation or a preprocessing probe.
    ///
    /// The sandbox is a shallow copy: every workspace entry is symlinked
    /// except along `overlay` (a workspace-relative path), whose ancestor
    /// directories are materialized and whose file, if it exists, becomes
    /// a real copy. Overlaying that one file is the only write a target
    /// sandbox ever sees besides build output. The directory name
    /// combines the caller's label with a fresh UUID, so labels need not
    /// be unique.
    pub async fn acquire_target_sandbox(
        &self,
        workspace: &WorkspaceSandbox,
        label: &str,
        overlay: &Path,
    ) -> Result<TargetSandbox> {
        let name = format!("{}-{}", label, uuid::Uuid::new_v4());
        let path = self.root.join("sandboxes").join(name);
        let source = tokio::fs::canonicalize(&workspace.path).await?;
        link_tree(&source, &path, Some(overlay)).await?;
        Ok(TargetSandbox { path })
    }

    /// Number of ephemeral sandboxes currently on disk. Zero between
    /// rounds at steady state.
    pub fn ephemeral_count(&self) -> usize {
        let dir = self.root.join("sandboxes");
        std::fs::read_dir(&dir)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }
}

/// The persistent mutable copy of the target project.
#[derive(Debug, Clone)]
pub struct WorkspaceSandbox {
    path: PathBuf,
}

impl WorkspaceSandbox {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute path of a file inside the workspace.
    pub fn file(&self, relative: &Path) -> PathBuf {
        self.path.join(relative)
    }

    /// Reads a workspace file, returning `None` if it does not exist yet.
    pub async fn read_file(&self, relative: &Path) -> Result<Option<String>> {
        let path = self.file(relative);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a workspace file, creating parent directories as needed.
    pub async fn write_file(&self, relative: &Path, content: &str) -> Result<()> {
        let path = self.file(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    /// Takes a byte snapshot of one file (or its absence) so a rejected
    /// write-back can be rolled back exactly.
    pub async fn snapshot(&self, relative: &Path) -> Result<FileSnapshot> {
        let content = self.read_file(relative).await?;
        let digest = content.as_deref().map(|c| {
            let mut hasher = Sha256::new();
            hasher.update(c.as_bytes());
            format!("{:x}", hasher.finalize())
        });
        Ok(FileSnapshot {
            relative: relative.to_path_buf(),
            content,
            digest,
        })
    }

    /// Restores a file to its snapshotted state, deleting it if the
    /// snapshot recorded its absence.
    pub async fn restore(&self, snapshot: &FileSnapshot) -> Result<()> {
        match &snapshot.content {
            Some(content) => self.write_file(&snapshot.relative, content).await,
            None => {
                let path = self.file(&snapshot.relative);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// Saved state of one workspace file, used for baseline rollback.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub relative: PathBuf,
    content: Option<String>,
    /// SHA-256 of the snapshotted content, recorded in the data store.
    pub digest: Option<String>,
}

/// An ephemeral per-mutant view of the workspace: symlinks everywhere
/// except the overlaid file, which is a materialized copy.
///
/// The directory is deleted when this handle drops (symlinks are
/// unlinked, never followed), so every exit path of an evaluation
/// (success, compile failure, panic unwind) releases it without touching
/// the workspace.
#[derive(Debug)]
pub struct TargetSandbox {
    path: PathBuf,
}

impl TargetSandbox {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies a mutant patch to the sandbox's materialized copy of its
    /// file. The file must have been named as the sandbox's overlay; a
    /// symlinked path is refused so a patch can never write through to
    /// the workspace.
    ///
    /// Lines `[line_start, line_end]` (1-based, inclusive) are replaced by
    /// the lines of `patch.mutated`; all surrounding content is preserved
    /// bit-exactly.
    pub async fn apply_patch(&self, patch: &Patch) -> Result<()> {
        let path = self.path.join(&patch.file_path);
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| Error::SandboxIo(format!("{}: {e}", path.display())))?;
        if meta.file_type().is_symlink() {
            return Err(Error::SandboxIo(format!(
                "{} is linked to the workspace, not overlaid",
                patch.file_path.display()
            )));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::SandboxIo(format!("{}: {e}", path.display())))?;
        let patched = apply_patch_to_source(&content, patch)?;
        tokio::fs::write(&path, patched)
            .await
            .map_err(|e| Error::SandboxIo(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

impl Drop for TargetSandbox {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to clean target sandbox");
            }
        }
    }
}

/// Replaces lines `[line_start, line_end]` of `content` with the lines of
/// `patch.mutated` (split on `\n`, no trailing-newline normalization).
///
/// Returns `patch_out_of_bounds` if the range does not fit the file.
pub fn apply_patch_to_source(content: &str, patch: &Patch) -> Result<String> {
    let had_trailing_newline = content.ends_with('\n');
    let mut lines: Vec<&str> = content.split('\n').collect();
    if had_trailing_newline {
        lines.pop();
    }

    let start = patch.line_start as usize;
    let end = patch.line_end as usize;
    if start == 0 || start > end || end > lines.len() {
        return Err(Error::PatchOutOfBounds(format!(
            "lines {start}..{end} do not fit a file of {} lines",
            lines.len()
        )));
    }

    let replacement: Vec<&str> = patch.mutated.split('\n').collect();
    lines.splice(start - 1..end, replacement);

    let mut result = lines.join("\n");
    if had_trailing_newline {
        result.push('\n');
    }
    Ok(result)
}

/// Builds a symlink farm of `src` at `dst`, skipping [`SKIP_DIRS`].
///
/// Entries on the `overlay` path (relative to `src`) are treated
/// specially: its ancestor directories become real directories whose
/// remaining entries are symlinked, and the overlay file itself becomes a
/// real copy. `src` must be absolute so the links resolve from anywhere.
async fn link_tree(src: &Path, dst: &Path, overlay: Option<&Path>) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let name = entry.file_name();
        let src_path = entry.path();
        let dst_path = dst.join(&name);

        if ty.is_dir() && name.to_str().is_some_and(|n| SKIP_DIRS.contains(&n)) {
            continue;
        }
        match overlay_step(overlay, name.as_os_str()) {
            Some(rest) if ty.is_dir() => {
                Box::pin(link_tree(&src_path, &dst_path, Some(rest))).await?;
            }
            Some(_) => {
                tokio::fs::copy(&src_path, &dst_path).await?;
            }
            None => {
                tokio::fs::symlink(&src_path, &dst_path).await?;
            }
        }
    }

    Ok(())
}

/// If `name` is the first component of `overlay`, returns the rest of the
/// overlay path (empty when `name` is the overlay itself).
fn overlay_step<'o>(overlay: Option<&'o Path>, name: &std::ffi::OsStr) -> Option<&'o Path> {
    let mut components = overlay?.components();
    let first = components.next()?;
    (first.as_os_str() == name).then(|| components.as_path())
}

/// Recursively copies a directory, skipping [`SKIP_DIRS`].
async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let name = entry.file_name();
        let src_path = entry.path();
        let dst_path = dst.join(&name);

        if ty.is_dir() {
            if name.to_str().is_some_and(|n| SKIP_DIRS.contains(&n)) {
                continue;
            }
            Box::pin(copy_dir_all(&src_path, &dst_path)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(start: u32, end: u32, mutated: &str) -> Patch {
        Patch {
            file_path: "Calc.java".into(),
            line_start: start,
            line_end: end,
            original: String::new(),
            mutated: mutated.into(),
        }
    }

    #[test]
    fn replaces_single_line() {
        let src = "a\nb\nc\n";
        let out = apply_patch_to_source(src, &patch(2, 2, "B")).unwrap();
        assert_eq!(out, "a\nB\nc\n");
    }

    #[test]
    fn replaces_range_with_multiline() {
        let src = "one\ntwo\nthree\nfour\n";
        let out = apply_patch_to_source(src, &patch(2, 3, "TWO\nTWO-AND-A-HALF\nTHREE")).unwrap();
        assert_eq!(out, "one\nTWO\nTWO-AND-A-HALF\nTHREE\nfour\n");
    }

    #[test]
    fn preserves_missing_trailing_newline() {
        let src = "a\nb\nc";
        let out = apply_patch_to_source(src, &patch(3, 3, "C")).unwrap();
        assert_eq!(out, "a\nb\nC");
    }

    #[test]
    fn rejects_range_past_end_of_file() {
        let src = "a\nb\n";
        let err = apply_patch_to_source(src, &patch(2, 3, "x")).unwrap_err();
        assert_eq!(err.kind(), "patch_out_of_bounds");
    }

    #[test]
    fn rejects_zero_line_start() {
        let err = apply_patch_to_source("a\n", &patch(0, 1, "x")).unwrap_err();
        assert_eq!(err.kind(), "patch_out_of_bounds");
    }

    #[tokio::test]
    async fn workspace_copy_skips_build_dirs() {
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        std::fs::create_dir_all(project.path().join("target/classes")).unwrap();
        std::fs::create_dir_all(project.path().join(".git")).unwrap();
        std::fs::write(project.path().join("src/A.java"), "class A {}").unwrap();
        std::fs::write(project.path().join("pom.xml"), "<project/>").unwrap();

        let state = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(state.path());
        let workspace = manager.create_workspace(project.path(), false).await.unwrap();

        assert!(workspace.file(Path::new("src/A.java")).exists());
        assert!(workspace.file(Path::new("pom.xml")).exists());
        assert!(!workspace.file(Path::new("target")).exists());
        assert!(!workspace.file(Path::new(".git")).exists());
    }

    #[tokio::test]
    async fn target_sandbox_cleans_up_on_drop() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("Calc.java"), "a\nb\nc\n").unwrap();

        let state = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(state.path());
        let workspace = manager.create_workspace(project.path(), false).await.unwrap();

        let sandbox_path;
        {
            let sandbox = manager
                .acquire_target_sandbox(&workspace, "mutant-7", Path::new("Calc.java"))
                .await
                .unwrap();
            sandbox_path = sandbox.path().to_path_buf();
            assert!(sandbox_path.exists());
            assert_eq!(manager.ephemeral_count(), 1);
        }
        assert!(!sandbox_path.exists());
        assert_eq!(manager.ephemeral_count(), 0);
    }

    #[tokio::test]
    async fn patch_applies_only_inside_sandbox() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("Calc.java"), "a\nb\nc\n").unwrap();

        let state = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(state.path());
        let workspace = manager.create_workspace(project.path(), false).await.unwrap();
        let sandbox = manager
            .acquire_target_sandbox(&workspace, "mutant-1", Path::new("Calc.java"))
            .await
            .unwrap();

        sandbox.apply_patch(&patch(2, 2, "MUTATED")).await.unwrap();

        let mutated = std::fs::read_to_string(sandbox.path().join("Calc.java")).unwrap();
        assert_eq!(mutated, "a\nMUTATED\nc\n");
        let pristine = std::fs::read_to_string(workspace.file(Path::new("Calc.java"))).unwrap();
        assert_eq!(pristine, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn sandbox_links_siblings_and_materializes_overlay() {
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        std::fs::write(project.path().join("src/Calc.java"), "a\nb\n").unwrap();
        std::fs::write(project.path().join("src/Other.java"), "x\n").unwrap();
        std::fs::write(project.path().join("pom.xml"), "<project/>").unwrap();

        let state = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(state.path());
        let workspace = manager.create_workspace(project.path(), false).await.unwrap();
        let sandbox = manager
            .acquire_target_sandbox(&workspace, "mutant-2", Path::new("src/Calc.java"))
            .await
            .unwrap();

        let link_type = |rel: &str| {
            std::fs::symlink_metadata(sandbox.path().join(rel))
                .unwrap()
                .file_type()
        };
        // Off the overlay path: shallow symlinks into the workspace.
        assert!(link_type("pom.xml").is_symlink());
        assert!(link_type("src/Other.java").is_symlink());
        // On the overlay path: real directory, real file copy.
        assert!(link_type("src").is_dir());
        assert!(link_type("src/Calc.java").is_file());
        assert_eq!(
            std::fs::read_to_string(sandbox.path().join("src/Calc.java")).unwrap(),
            "a\nb\n"
        );
    }

    #[tokio::test]
    async fn patch_refuses_a_linked_file() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("Calc.java"), "a\nb\nc\n").unwrap();
        std::fs::write(project.path().join("Other.java"), "x\n").unwrap();

        let state = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(state.path());
        let workspace = manager.create_workspace(project.path(), false).await.unwrap();
        let sandbox = manager
            .acquire_target_sandbox(&workspace, "mutant-3", Path::new("Calc.java"))
            .await
            .unwrap();

        // Other.java is a symlink, not the overlay: patching it must fail
        // rather than write through to the workspace.
        let stray = Patch {
            file_path: "Other.java".into(),
            line_start: 1,
            line_end: 1,
            original: "x".into(),
            mutated: "y".into(),
        };
        let err = sandbox.apply_patch(&stray).await.unwrap_err();
        assert_eq!(err.kind(), "sandbox_io");
        assert_eq!(
            std::fs::read_to_string(workspace.file(Path::new("Other.java"))).unwrap(),
            "x\n"
        );
    }

    #[tokio::test]
    async fn overlay_of_absent_file_stays_local_to_the_sandbox() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("pom.xml"), "<project/>").unwrap();

        let state = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(state.path());
        let workspace = manager.create_workspace(project.path(), false).await.unwrap();
        let overlay = Path::new("src/test/java/CalcTest.java");
        let sandbox = manager
            .acquire_target_sandbox(&workspace, "seed-0", overlay)
            .await
            .unwrap();

        // The test file does not exist yet; writing it stays local to the
        // sandbox.
        let path = sandbox.path().join(overlay);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "class CalcTest {}").unwrap();
        assert!(!workspace.file(overlay).exists());
    }

    #[test]
    fn overlay_step_walks_one_component() {
        let overlay = Path::new("src/Calc.java");
        let rest = overlay_step(Some(overlay), std::ffi::OsStr::new("src")).unwrap();
        assert_eq!(rest, Path::new("Calc.java"));
        let leaf = overlay_step(Some(rest), std::ffi::OsStr::new("Calc.java")).unwrap();
        assert_eq!(leaf, Path::new(""));
        assert!(overlay_step(Some(overlay), std::ffi::OsStr::new("pom.xml")).is_none());
        assert!(overlay_step(None, std::ffi::OsStr::new("src")).is_none());
    }

    #[tokio::test]
    async fn snapshot_restores_previous_content() {
        let project = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(state.path());
        let workspace = manager.create_workspace(project.path(), false).await.unwrap();

        let rel = Path::new("src/test/java/CalcTest.java");
        workspace.write_file(rel, "original").await.unwrap();
        let snapshot = workspace.snapshot(rel).await.unwrap();
        assert!(snapshot.digest.is_some());

        workspace.write_file(rel, "broken edit").await.unwrap();
        workspace.restore(&snapshot).await.unwrap();
        assert_eq!(
            workspace.read_file(rel).await.unwrap().as_deref(),
            Some("original")
        );
    }

    #[tokio::test]
    async fn snapshot_of_absent_file_restores_absence() {
        let project = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(state.path());
        let workspace = manager.create_workspace(project.path(), false).await.unwrap();

        let rel = Path::new("src/test/java/NewTest.java");
        let snapshot = workspace.snapshot(rel).await.unwrap();
        workspace.write_file(rel, "fresh file").await.unwrap();
        workspace.restore(&snapshot).await.unwrap();
        assert!(workspace.read_file(rel).await.unwrap().is_none());
    }
}
