//! Package-selection fingerprint.
//!
//! The fingerprint covers every file below the active package-list
//! directories. Files are ordered by their path relative to the list root,
//! so the result does not depend on directory iteration order.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// SHA-256 (hex) over the relative paths and contents of all files in
/// `roots`. Missing roots contribute nothing.
pub fn package_selection_hash(roots: &[PathBuf]) -> Result<String> {
    let mut entries: Vec<(String, usize, PathBuf)> = Vec::new();

    for (index, root) in roots.iter().enumerate() {
        if !root.is_dir() {
            tracing::debug!(root = %root.display(), "package-list directory absent");
            continue;
        }
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry
                .with_context(|| format!("walking package lists under '{}'", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = relative_name(root, entry.path());
            entries.push((relative, index, entry.path().to_path_buf()));
        }
    }

    entries.sort();

    let mut hasher = Sha256::new();
    for (relative, _, path) in &entries {
        let content = fs::read(path)
            .with_context(|| format!("reading package list '{}'", path.display()))?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
