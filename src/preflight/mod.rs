//! Preflight checks run before `build`.
//!
//! Validates that the host has the tools the environment lifecycle shells out
//! to, and that we run with enough privilege to chroot and mount.
//!
//! # Example
//!
//! ```rust
//! use imagesmith::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("chroot") {
//!     println!("coreutils not installed");
//! }
//!
//! let tools = &[("mount", "mount"), ("umount", "mount")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools used while building.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("chroot", "coreutils"),
    ("mount", "mount"),
    ("umount", "mount"),
    ("sh", "dash"),
];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Fail unless the effective uid is 0.
pub fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("building requires root (chroot and mount); running as uid {euid}");
    }
    Ok(())
}

/// Everything `build` needs from the host.
pub fn check_host() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    require_root()
}
