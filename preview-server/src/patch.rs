//! Patch applier - best-effort unified diff application with fallbacks

use std::io::Write;
use std::path::Path;

use preview_core::PatchStrategy;

use crate::git::GitCli;
use crate::shell;

/// Basename prefixes of build-tool configs that the dev server only reads at boot
const RESTART_CONFIG_PREFIXES: &[&str] = &[
    "tailwind.config",
    "postcss.config",
    "next.config",
    "vite.config",
    "webpack.config",
    "svelte.config",
    "astro.config",
    "nuxt.config",
];

/// Workspace-relative paths that force a restart
const RESTART_PATHS: &[&str] = &["package.json", ".env.local"];

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to stage patch file: {0}")]
    TempFile(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub files_changed: Vec<String>,
    pub needs_restart: bool,
    /// `None` when nothing was attempted or every strategy failed
    pub strategy: Option<PatchStrategy>,
    pub warnings: Vec<String>,
}

/// Target paths named by a unified diff, in order of appearance.
///
/// Reads `+++ b/<path>` headers; a deletion (`+++ /dev/null`) reports the
/// path from the preceding `--- a/<path>` header.
pub fn changed_files(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut old_path: Option<String> = None;

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = header_path(rest)
                .and_then(|p| p.strip_prefix("a/"))
                .map(str::to_string);
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let path = match header_path(rest) {
                Some("/dev/null") => old_path.take(),
                Some(path) => path.strip_prefix("b/").map(str::to_string),
                None => None,
            };
            if let Some(path) = path
                && !files.contains(&path)
            {
                files.push(path);
            }
        }
    }

    files
}

fn header_path(rest: &str) -> Option<&str> {
    // Drop "\t<timestamp>" suffixes emitted by diff(1)
    let path = rest.split('\t').next().unwrap_or(rest).trim_end();
    (!path.is_empty()).then_some(path)
}

/// Whether a change to `path` requires restarting the dev server.
pub fn needs_restart(path: &str) -> bool {
    if RESTART_PATHS.contains(&path) {
        return true;
    }
    let basename = path.rsplit('/').next().unwrap_or(path);
    RESTART_CONFIG_PREFIXES
        .iter()
        .any(|prefix| basename.starts_with(prefix))
}

/// Apply `diff` to the working tree at `workspace`.
///
/// Strategies are tried in order: three-way `git apply`, plain `git apply`,
/// then `patch -p1`. When all of them fail the result still lists the files
/// named by the diff and carries a warning instead of an error.
pub async fn apply_diff(git: &GitCli, workspace: &Path, diff: &str) -> Result<PatchOutcome, PatchError> {
    let files_changed = changed_files(diff);
    if files_changed.is_empty() {
        return Ok(PatchOutcome::default());
    }
    let needs_restart = files_changed.iter().any(|f| needs_restart(f));

    // Lives outside the workspace and is removed on drop.
    let mut patch_file = tempfile::Builder::new()
        .prefix("preview-")
        .suffix(".patch")
        .tempfile()?;
    patch_file.write_all(diff.as_bytes())?;
    if !diff.ends_with('\n') {
        patch_file.write_all(b"\n")?;
    }
    patch_file.flush()?;
    let patch_path = patch_file.path();

    let mut failures = Vec::new();
    let mut strategy = None;

    for candidate in [PatchStrategy::ThreeWay, PatchStrategy::Plain, PatchStrategy::LineBased] {
        let result = match candidate {
            PatchStrategy::ThreeWay => git
                .apply(workspace, patch_path, &["--3way", "--whitespace=fix"])
                .await
                .map_err(|e| e.to_string()),
            PatchStrategy::Plain => git
                .apply(workspace, patch_path, &["--whitespace=fix"])
                .await
                .map_err(|e| e.to_string()),
            PatchStrategy::LineBased => line_based_apply(workspace, patch_path).await,
        };
        match result {
            Ok(()) => {
                strategy = Some(candidate);
                break;
            }
            Err(e) => {
                tracing::debug!(workspace = %workspace.display(), strategy = %candidate, "Patch strategy failed: {}", e);
                failures.push(format!("{candidate}: {e}"));
            }
        }
    }

    let mut warnings = Vec::new();
    match strategy {
        Some(used) => {
            tracing::info!(
                workspace = %workspace.display(),
                strategy = %used,
                files = files_changed.len(),
                needs_restart = needs_restart,
                "Patch applied"
            );
        }
        None => {
            tracing::warn!(
                workspace = %workspace.display(),
                files = files_changed.len(),
                "Patch could not be applied by any strategy"
            );
            warnings.push(format!(
                "patch could not be applied by any strategy; workspace may not reflect filesChanged ({})",
                failures.join("; ")
            ));
        }
    }

    Ok(PatchOutcome {
        files_changed,
        needs_restart,
        strategy,
        warnings,
    })
}

async fn line_based_apply(workspace: &Path, patch_path: &Path) -> Result<(), String> {
    let argv: Vec<String> = [
        "patch",
        "-p1",
        "--batch",
        "--forward",
        "--no-backup-if-mismatch",
        "-r",
        "-",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain(std::iter::once(patch_path.display().to_string()))
    .collect();
    shell::run(&argv, workspace, &[], None)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}
