//! Package manager collaborator.
//!
//! The controller only needs a handful of package operations, so they sit
//! behind [`PackageManager`]. [`AptChroot`] drives apt inside an environment
//! through `chroot`; its output parsing lives in free functions that are
//! tested against captured fixture text.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// Narrow package-manager interface used by the freshness checker and the
/// track switcher.
pub trait PackageManager {
    /// Refresh repository metadata.
    fn refresh(&self) -> Result<()>;

    /// Installed version of `package`, or `None` when it is not installed.
    fn installed_version(&self, package: &str) -> Result<Option<String>>;

    /// Version apt would install for `package`, or `None` when unavailable.
    fn candidate_version(&self, package: &str) -> Result<Option<String>>;

    fn install(&self, packages: &[String]) -> Result<()>;

    fn remove(&self, packages: &[String]) -> Result<()>;

    /// Names of installed packages with a newer candidate.
    fn list_upgradable(&self) -> Result<Vec<String>>;

    fn full_upgrade(&self) -> Result<()>;

    /// Remove packages that are no longer required.
    fn autoremove(&self) -> Result<()>;
}

/// apt running inside a build environment.
#[derive(Debug, Clone)]
pub struct AptChroot {
    root: PathBuf,
}

impl AptChroot {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn cmd(&self, program: &str) -> Cmd {
        Cmd::new("chroot")
            .arg_path(&self.root)
            .arg(program)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("LC_ALL", "C")
    }

    fn policy(&self, package: &str) -> Result<PolicyVersions> {
        let output = self
            .cmd("apt-cache")
            .args(["policy", package])
            .error_msg(&format!("apt-cache policy {package} failed"))
            .run()?;
        Ok(parse_policy(&output.stdout))
    }
}

impl PackageManager for AptChroot {
    fn refresh(&self) -> Result<()> {
        self.cmd("apt-get")
            .arg("update")
            .error_msg("apt-get update failed")
            .run_interactive()
    }

    fn installed_version(&self, package: &str) -> Result<Option<String>> {
        Ok(self.policy(package)?.installed)
    }

    fn candidate_version(&self, package: &str) -> Result<Option<String>> {
        Ok(self.policy(package)?.candidate)
    }

    fn install(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.cmd("apt-get")
            .args(["install", "-y"])
            .args(packages)
            .error_msg(&format!("apt-get install {} failed", packages.join(" ")))
            .run_interactive()
    }

    fn remove(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.cmd("apt-get")
            .args(["remove", "-y", "--purge"])
            .args(packages)
            .error_msg(&format!("apt-get remove {} failed", packages.join(" ")))
            .run_interactive()
    }

    fn list_upgradable(&self) -> Result<Vec<String>> {
        let output = self
            .cmd("apt")
            .args(["list", "--upgradable"])
            .error_msg("apt list --upgradable failed")
            .run()
            .context("listing upgradable packages")?;
        Ok(parse_upgradable(&output.stdout))
    }

    fn full_upgrade(&self) -> Result<()> {
        self.cmd("apt-get")
            .args(["-y", "full-upgrade"])
            .error_msg("apt-get full-upgrade failed")
            .run_interactive()
    }

    fn autoremove(&self) -> Result<()> {
        self.cmd("apt-get")
            .args(["-y", "autoremove", "--purge"])
            .error_msg("apt-get autoremove failed")
            .run_interactive()
    }
}

/// Installed and candidate versions reported by `apt-cache policy`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyVersions {
    pub installed: Option<String>,
    pub candidate: Option<String>,
}

/// Parse `apt-cache policy <pkg>` output. `(none)` reads as absent, and an
/// unknown package (empty output) yields both fields absent.
pub fn parse_policy(stdout: &str) -> PolicyVersions {
    let mut versions = PolicyVersions::default();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Installed:") {
            versions.installed = policy_value(value);
        } else if let Some(value) = line.strip_prefix("Candidate:") {
            versions.candidate = policy_value(value);
        } else if line.starts_with("Version table:") {
            break;
        }
    }
    versions
}

fn policy_value(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value == "(none)" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parse `apt list --upgradable` output into sorted, unique package names.
///
/// Lines look like `firefox-esr/stable-security 115.9.1esr-1 amd64 [upgradable from: ...]`.
pub fn parse_upgradable(stdout: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Listing") || line.starts_with("WARNING") {
            continue;
        }
        let Some((name, _)) = line.split_once('/') else {
            continue;
        };
        if !name.is_empty() && !name.contains(char::is_whitespace) {
            names.insert(name.to_string());
        }
    }
    names.into_iter().collect()
}
