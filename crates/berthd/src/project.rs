//! Loading a local project directory for `berthd deploy`.

use std::path::Path;

use anyhow::Context;
use berth_provision::ProjectFile;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Directories that are never shipped.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", "__pycache__", ".venv", "dist"];

/// Files larger than this are listed without contents.
const MAX_TEXT_BYTES: u64 = 1024 * 1024;

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Walk `root` and collect every regular file, paths relative to `root`.
/// Binary and oversized files keep their path but carry no contents.
pub fn load_dir(root: &Path) -> anyhow::Result<Vec<ProjectFile>> {
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| !is_skipped(e)) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let contents = if size <= MAX_TEXT_BYTES {
            std::fs::read(entry.path())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default()
        } else {
            debug!(%path, size, "file too large, shipping path only");
            String::new()
        };
        files.push(ProjectFile { path, contents });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// The directory name, or `"project"` for roots without one.
pub fn default_project_id(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .as_deref()
        .unwrap_or(root)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("project")
        .to_string()
}
