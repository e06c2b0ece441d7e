//! Keeps a reused environment current.
//!
//! Each step reports an explicit outcome. Only the metadata refresh gates the
//! rest of the check; no step here aborts the build. Upgrades that would pull
//! in release-critical bugs are skipped unless the caller overrides the gate.

use std::fmt;

use crate::bugs::{BugReport, GATING_SEVERITIES};
use crate::config::BuildContext;
use crate::mounts::ScopedMount;
use crate::Tools;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataRefresh {
    Refreshed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelUpdate {
    NotChecked,
    /// The track's metapackage is not installed; track reconciliation owns it.
    NotInstalled { package: String },
    Unchanged { package: String, version: String },
    Updated {
        package: String,
        from: String,
        to: String,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    SeriousBugs(BugReport),
    OracleUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    NotChecked,
    NothingPending,
    Upgraded { packages: Vec<String> },
    /// Upgrade skipped; the environment keeps its current versions.
    Blocked {
        packages: Vec<String>,
        reason: BlockReason,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessReport {
    pub metadata: MetadataRefresh,
    pub kernel: KernelUpdate,
    pub upgrade: UpgradeOutcome,
}

impl fmt::Display for FreshnessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.metadata {
            MetadataRefresh::Refreshed => writeln!(f, "metadata: refreshed")?,
            MetadataRefresh::Failed(e) => writeln!(f, "metadata: refresh failed ({e})")?,
        }
        match &self.kernel {
            KernelUpdate::NotChecked => writeln!(f, "kernel: not checked")?,
            KernelUpdate::NotInstalled { package } => {
                writeln!(f, "kernel: {package} not installed")?
            }
            KernelUpdate::Unchanged { package, version } => {
                writeln!(f, "kernel: {package} {version} is current")?
            }
            KernelUpdate::Updated { package, from, to } => {
                writeln!(f, "kernel: {package} {from} -> {to}")?
            }
            KernelUpdate::Failed(e) => writeln!(f, "kernel: update failed ({e})")?,
        }
        match &self.upgrade {
            UpgradeOutcome::NotChecked => writeln!(f, "upgrade: not checked"),
            UpgradeOutcome::NothingPending => writeln!(f, "upgrade: nothing pending"),
            UpgradeOutcome::Upgraded { packages } => {
                writeln!(f, "upgrade: {} package(s) upgraded", packages.len())
            }
            UpgradeOutcome::Blocked {
                packages,
                reason: BlockReason::SeriousBugs(report),
            } => write!(
                f,
                "upgrade: {} package(s) held back by serious bugs\n{}",
                packages.len(),
                report
            ),
            UpgradeOutcome::Blocked {
                packages,
                reason: BlockReason::OracleUnavailable(e),
            } => writeln!(
                f,
                "upgrade: {} package(s) held back, bug check unavailable ({e})",
                packages.len()
            ),
            UpgradeOutcome::Failed(e) => writeln!(f, "upgrade: failed ({e})"),
        }
    }
}

/// Refresh, update the kernel metapackage and apply gated upgrades.
pub fn check(ctx: &BuildContext, tools: &Tools<'_>) -> FreshnessReport {
    if let Err(e) = tools.packages.refresh() {
        tracing::warn!(error = %e, "metadata refresh failed; continuing with existing metadata");
        return FreshnessReport {
            metadata: MetadataRefresh::Failed(format!("{e:#}")),
            kernel: KernelUpdate::NotChecked,
            upgrade: UpgradeOutcome::NotChecked,
        };
    }

    let kernel = update_kernel(ctx, tools);
    let upgrade = upgrade_packages(ctx, tools);
    FreshnessReport {
        metadata: MetadataRefresh::Refreshed,
        kernel,
        upgrade,
    }
}

fn update_kernel(ctx: &BuildContext, tools: &Tools<'_>) -> KernelUpdate {
    let package = ctx.track.meta_package(&ctx.config.kernel.image_meta);

    let versions = tools
        .packages
        .installed_version(&package)
        .and_then(|installed| Ok((installed, tools.packages.candidate_version(&package)?)));
    let (installed, candidate) = match versions {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(package = %package, error = %e, "kernel version query failed");
            return KernelUpdate::Failed(format!("{e:#}"));
        }
    };

    let Some(installed) = installed else {
        return KernelUpdate::NotInstalled { package };
    };
    let candidate = match candidate {
        Some(candidate) if candidate != installed => candidate,
        _ => {
            return KernelUpdate::Unchanged {
                package,
                version: installed,
            }
        }
    };

    tracing::info!(package = %package, from = %installed, to = %candidate, "updating kernel");
    let applied = tools
        .packages
        .install(std::slice::from_ref(&package))
        .and_then(|()| tools.boot.regenerate_all());
    match applied {
        Ok(()) => KernelUpdate::Updated {
            package,
            from: installed,
            to: candidate,
        },
        Err(e) => {
            tracing::warn!(package = %package, error = %e, "kernel update failed; continuing");
            KernelUpdate::Failed(format!("{e:#}"))
        }
    }
}

fn upgrade_packages(ctx: &BuildContext, tools: &Tools<'_>) -> UpgradeOutcome {
    let packages = match tools.packages.list_upgradable() {
        Ok(packages) => packages,
        Err(e) => {
            tracing::warn!(error = %e, "listing upgradable packages failed");
            return UpgradeOutcome::Failed(format!("{e:#}"));
        }
    };
    if packages.is_empty() {
        return UpgradeOutcome::NothingPending;
    }
    tracing::info!(count = packages.len(), "packages have upgrades pending");

    // Held until this function returns, whichever branch it takes.
    let proc_mount = ScopedMount::proc_in(tools.mounts, &ctx.env_dir());
    let bug_check = match &proc_mount {
        Ok(_) => tools.bugs.issues(&GATING_SEVERITIES, &packages),
        Err(e) => Err(anyhow::anyhow!("mounting /proc for the bug check failed: {e:#}")),
    };

    let blocked = match bug_check {
        Ok(report) if report.is_empty() => None,
        Ok(report) => Some(BlockReason::SeriousBugs(report)),
        Err(e) => Some(BlockReason::OracleUnavailable(format!("{e:#}"))),
    };

    if let Some(reason) = blocked {
        if !ctx.allow_serious_bugs {
            match &reason {
                BlockReason::SeriousBugs(report) => tracing::warn!(
                    "skipping upgrade: serious bugs reported for pending packages \
                     (override with --allow-serious-bugs)\n{report}"
                ),
                BlockReason::OracleUnavailable(e) => tracing::warn!(
                    "skipping upgrade: bug check unavailable ({e}); \
                     override with --allow-serious-bugs"
                ),
            }
            return UpgradeOutcome::Blocked { packages, reason };
        }
        tracing::warn!("upgrading despite bug check result because the override is set");
    }

    if let Err(e) = tools.packages.full_upgrade() {
        tracing::warn!(error = %e, "full upgrade failed; continuing with current packages");
        return UpgradeOutcome::Failed(format!("{e:#}"));
    }
    if let Err(e) = tools.packages.autoremove() {
        tracing::warn!(error = %e, "autoremove failed; continuing");
    }
    drop(proc_mount);
    UpgradeOutcome::Upgraded { packages }
}
