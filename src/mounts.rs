//! Kernel-interface filesystems inside environments.
//!
//! Tools such as apt-listbugs need `/proc` inside the environment. The mount
//! is held by a [`ScopedMount`] guard that only unmounts what it mounted
//! itself. Discarding an environment first unmounts everything below it, so
//! `remove_dir_all` never walks into a live `/proc`, `/sys` or `/dev`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

pub trait Mounter {
    fn is_mounted(&self, target: &Path) -> Result<bool>;

    fn mount_proc(&self, target: &Path) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Mount points at or below `root`.
    fn mounts_below(&self, root: &Path) -> Result<Vec<PathBuf>>;
}

/// Host mount table via `/proc/self/mountinfo` and `mount`/`umount`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMounts;

const MOUNTINFO: &str = "/proc/self/mountinfo";

impl HostMounts {
    fn mount_points(&self) -> Result<Vec<PathBuf>> {
        let text = fs::read_to_string(MOUNTINFO).with_context(|| format!("reading {MOUNTINFO}"))?;
        Ok(parse_mountinfo(&text))
    }
}

impl Mounter for HostMounts {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let target = canonical_or_raw(target);
        Ok(self.mount_points()?.iter().any(|m| m == &target))
    }

    fn mount_proc(&self, target: &Path) -> Result<()> {
        fs::create_dir_all(target)
            .with_context(|| format!("creating mount point '{}'", target.display()))?;
        Cmd::new("mount")
            .args(["-t", "proc", "proc"])
            .arg_path(target)
            .error_msg(&format!("mounting proc on '{}' failed", target.display()))
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let result = Cmd::new("umount").arg_path(target).allow_fail().run()?;
        if result.success() {
            return Ok(());
        }
        tracing::warn!(
            target = %target.display(),
            stderr = %result.stderr.trim(),
            "umount failed, retrying lazily"
        );
        Cmd::new("umount")
            .arg("-l")
            .arg_path(target)
            .error_msg(&format!("unmounting '{}' failed", target.display()))
            .run()?;
        Ok(())
    }

    fn mounts_below(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let root = canonical_or_raw(root);
        Ok(self
            .mount_points()?
            .into_iter()
            .filter(|m| m.starts_with(&root))
            .collect())
    }
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Mount points (field 5) from mountinfo text, with octal escapes decoded.
pub fn parse_mountinfo(text: &str) -> Vec<PathBuf> {
    text.lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|raw| PathBuf::from(unescape_mount_path(raw)))
        .collect()
}

/// Decode the `\NNN` octal escapes the kernel uses for spaces, tabs,
/// newlines and backslashes.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `/proc` mounted inside an environment for the lifetime of the guard.
///
/// If `/proc` was already mounted the guard leaves it alone on drop.
pub struct ScopedMount<'a> {
    mounter: &'a dyn Mounter,
    target: PathBuf,
    owned: bool,
}

impl<'a> ScopedMount<'a> {
    pub fn proc_in(mounter: &'a dyn Mounter, env_dir: &Path) -> Result<Self> {
        let target = env_dir.join("proc");
        if mounter.is_mounted(&target)? {
            tracing::debug!(target = %target.display(), "proc already mounted");
            return Ok(Self {
                mounter,
                target,
                owned: false,
            });
        }
        mounter.mount_proc(&target)?;
        Ok(Self {
            mounter,
            target,
            owned: true,
        })
    }

    pub fn owned(&self) -> bool {
        self.owned
    }
}

impl Drop for ScopedMount<'_> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(e) = self.mounter.unmount(&self.target) {
            tracing::warn!(target = %self.target.display(), error = %e, "failed to release mount");
        }
    }
}

/// Unmount every mount point at or below `root`, deepest first, and verify
/// nothing remains mounted.
pub fn unmount_all_below(mounter: &dyn Mounter, root: &Path) -> Result<()> {
    let mut mounts = mounter.mounts_below(root)?;
    mounts.sort_by_key(|m| std::cmp::Reverse(m.components().count()));
    mounts.dedup();
    for mount in &mounts {
        tracing::info!(mount = %mount.display(), "unmounting before discard");
        mounter.unmount(mount)?;
    }

    let remaining = mounter.mounts_below(root)?;
    if !remaining.is_empty() {
        bail!(
            "refusing to discard '{}': still mounted below it:\n{}",
            root.display(),
            remaining
                .iter()
                .map(|m| format!("  {}", m.display()))
                .collect::<Vec<_>>()
                .join("\n")
        );
    }
    Ok(())
}
