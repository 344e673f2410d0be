use std::path::{Path, PathBuf};

/// If `preview-server` is being run from a path under a `target/` directory, return that
/// `target/` directory path.
pub fn target_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let mut cur = exe_path;
    loop {
        if cur.file_name().is_some_and(|n| n == "target") {
            return Some(cur.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// If `preview-server` is being run from a path under a `target/` directory, return the
/// repo root directory (the parent of `target/`).
pub fn repo_root_from_exe(exe_path: &Path) -> Option<PathBuf> {
    target_dir_from_exe(exe_path)?
        .parent()
        .map(|p| p.to_path_buf())
}

/// Default workspaces dir for debug builds when running from a source checkout.
///
/// Example: `{repo}/local-dev/preview-server/workspaces`
pub fn debug_default_workspaces_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    repo_root_from_exe(exe_path).map(|root| {
        root.join("local-dev")
            .join("preview-server")
            .join("workspaces")
    })
}

/// Directory holding the working copy of one site.
pub fn workspace_dir(workspaces_root: &Path, site_id: &str) -> PathBuf {
    workspaces_root.join(site_id)
}
