//! Boot image regeneration inside an environment.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

pub trait BootImages {
    /// Rebuild the initramfs for every installed kernel.
    fn regenerate_all(&self) -> Result<()>;
}

/// `update-initramfs` from initramfs-tools, run through `chroot`.
#[derive(Debug, Clone)]
pub struct UpdateInitramfs {
    root: PathBuf,
}

impl UpdateInitramfs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl BootImages for UpdateInitramfs {
    fn regenerate_all(&self) -> Result<()> {
        Cmd::new("chroot")
            .arg_path(&self.root)
            .args(["update-initramfs", "-u", "-k", "all"])
            .error_msg("update-initramfs failed")
            .run_interactive()
    }
}
