//! In-memory collaborators for unit tests.

use anyhow::{bail, Result};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::apt::PackageManager;
use crate::boot::BootImages;
use crate::bugs::{BugOracle, BugReport, Severity};
use crate::config::{parse_config, BuildContext};
use crate::mounts::Mounter;
use crate::pipeline::{Pipeline, Stage};
use crate::track::Track;
use crate::Tools;

const TEST_CONFIG: &str = r#"
[paths]
work_dir = "work"
output_dir = "out"
package_lists = ["config/package-lists"]
variants_dir = "config/variants"

[hooks]
bootstrap = "hooks/bootstrap.sh"
populate = "hooks/populate.sh"
package = "hooks/package.sh"

[kernel]
image_meta = "linux-image-amd64"
headers_meta = "linux-headers-amd64"
foreign_hooks = ["etc/kernel/postinst.d/z50-raspi-firmware"]

[kernel.repos.latest]
source = "deb [signed-by=/etc/apt/keyrings/imagesmith-kernel-latest.gpg] https://kernel.example.invalid latest main"

[kernel.repos.rc]
source = "deb [signed-by=/etc/apt/keyrings/imagesmith-kernel-rc.gpg] https://kernel.example.invalid rc main"
keyring = "keys/rc.gpg"
"#;

/// Context rooted at `root` with the default track.
pub(crate) fn test_context(root: &Path, variant: &str) -> BuildContext {
    let config = parse_config(TEST_CONFIG, root).unwrap();
    BuildContext::new(config, variant, Track::Stable).unwrap()
}

#[derive(Default)]
pub(crate) struct FakePackages {
    installed: RefCell<BTreeMap<String, String>>,
    candidates: RefCell<BTreeMap<String, String>>,
    upgradable: RefCell<Vec<String>>,
    failing: RefCell<BTreeSet<String>>,
    calls: RefCell<Vec<String>>,
}

impl FakePackages {
    pub(crate) fn set_installed(&self, package: &str, version: &str) {
        self.installed
            .borrow_mut()
            .insert(package.to_string(), version.to_string());
    }

    pub(crate) fn set_candidate(&self, package: &str, version: &str) {
        self.candidates
            .borrow_mut()
            .insert(package.to_string(), version.to_string());
    }

    pub(crate) fn set_upgradable(&self, packages: &[&str]) {
        *self.upgradable.borrow_mut() = packages.iter().map(|p| p.to_string()).collect();
    }

    pub(crate) fn fail_on(&self, operation: &str) {
        self.failing.borrow_mut().insert(operation.to_string());
    }

    pub(crate) fn installed(&self, package: &str) -> Option<String> {
        self.installed.borrow().get(package).cloned()
    }

    /// Every state-changing or refresh call, in order. Queries are not recorded.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Calls that install, remove or upgrade packages.
    pub(crate) fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c != "refresh")
            .collect()
    }

    fn record(&self, operation: &str, packages: &[String]) -> Result<()> {
        let mut call = operation.to_string();
        for package in packages {
            call.push(' ');
            call.push_str(package);
        }
        self.calls.borrow_mut().push(call);
        if self.failing.borrow().contains(operation) {
            bail!("fake {operation} failure");
        }
        Ok(())
    }
}

impl PackageManager for FakePackages {
    fn refresh(&self) -> Result<()> {
        self.record("refresh", &[])
    }

    fn installed_version(&self, package: &str) -> Result<Option<String>> {
        Ok(self.installed(package))
    }

    fn candidate_version(&self, package: &str) -> Result<Option<String>> {
        Ok(self
            .candidates
            .borrow()
            .get(package)
            .cloned()
            .or_else(|| self.installed(package)))
    }

    fn install(&self, packages: &[String]) -> Result<()> {
        self.record("install", packages)?;
        for package in packages {
            let version = self
                .candidates
                .borrow()
                .get(package)
                .cloned()
                .unwrap_or_else(|| "1.0".to_string());
            self.set_installed(package, &version);
        }
        Ok(())
    }

    fn remove(&self, packages: &[String]) -> Result<()> {
        self.record("remove", packages)?;
        let mut installed = self.installed.borrow_mut();
        for package in packages {
            installed.remove(package);
        }
        Ok(())
    }

    fn list_upgradable(&self) -> Result<Vec<String>> {
        if self.failing.borrow().contains("list_upgradable") {
            bail!("fake list_upgradable failure");
        }
        Ok(self.upgradable.borrow().clone())
    }

    fn full_upgrade(&self) -> Result<()> {
        self.record("full_upgrade", &[])?;
        let upgradable = std::mem::take(&mut *self.upgradable.borrow_mut());
        for package in upgradable {
            if let Some(version) = self.candidates.borrow().get(&package).cloned() {
                self.set_installed(&package, &version);
            }
        }
        Ok(())
    }

    fn autoremove(&self) -> Result<()> {
        self.record("autoremove", &[])
    }
}

#[derive(Default)]
pub(crate) struct FakeBugs {
    report: RefCell<BugReport>,
    fail: Cell<bool>,
    queries: RefCell<Vec<Vec<String>>>,
}

impl FakeBugs {
    pub(crate) fn set_report(&self, report: BugReport) {
        *self.report.borrow_mut() = report;
    }

    pub(crate) fn set_failing(&self) {
        self.fail.set(true);
    }

    pub(crate) fn queries(&self) -> Vec<Vec<String>> {
        self.queries.borrow().clone()
    }
}

impl BugOracle for FakeBugs {
    fn issues(&self, _severities: &[Severity], packages: &[String]) -> Result<BugReport> {
        self.queries.borrow_mut().push(packages.to_vec());
        if self.fail.get() {
            bail!("fake bug oracle failure");
        }
        Ok(self.report.borrow().clone())
    }
}

#[derive(Default)]
pub(crate) struct FakeBoot {
    calls: Cell<usize>,
    fail: Cell<bool>,
}

impl FakeBoot {
    pub(crate) fn calls(&self) -> usize {
        self.calls.get()
    }

    pub(crate) fn set_failing(&self) {
        self.fail.set(true);
    }
}

impl BootImages for FakeBoot {
    fn regenerate_all(&self) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        if self.fail.get() {
            bail!("fake update-initramfs failure");
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeMounts {
    mounted: RefCell<BTreeSet<PathBuf>>,
    calls: RefCell<Vec<String>>,
}

impl FakeMounts {
    pub(crate) fn with_mounted(paths: &[&str]) -> Self {
        let mounts = Self::default();
        mounts
            .mounted
            .borrow_mut()
            .extend(paths.iter().map(PathBuf::from));
        mounts
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Mounter for FakeMounts {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.mounted.borrow().contains(target))
    }

    fn mount_proc(&self, target: &Path) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("mount {}", target.display()));
        self.mounted.borrow_mut().insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("umount {}", target.display()));
        self.mounted.borrow_mut().remove(target);
        Ok(())
    }

    fn mounts_below(&self, root: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .mounted
            .borrow()
            .iter()
            .filter(|m| m.starts_with(root))
            .cloned()
            .collect())
    }
}

/// Pipeline whose bootstrap stage creates a minimal environment.
#[derive(Default)]
pub(crate) struct FakePipeline {
    stages: RefCell<Vec<Stage>>,
    fail_on: Cell<Option<Stage>>,
}

impl FakePipeline {
    pub(crate) fn fail_on(&self, stage: Stage) {
        self.fail_on.set(Some(stage));
    }

    pub(crate) fn stages(&self) -> Vec<Stage> {
        self.stages.borrow().clone()
    }
}

impl Pipeline for FakePipeline {
    fn run_stage(&self, ctx: &BuildContext, stage: Stage) -> Result<()> {
        self.stages.borrow_mut().push(stage);
        if self.fail_on.get() == Some(stage) {
            bail!("fake {stage} failure");
        }
        match stage {
            Stage::Bootstrap => fs::create_dir_all(ctx.env_dir().join("etc/apt"))?,
            Stage::Package => {
                let out = ctx.output_dir();
                fs::create_dir_all(&out)?;
                fs::write(out.join(format!("{}.img", ctx.variant)), b"disk image bytes")?;
                fs::write(out.join(format!("{}.iso", ctx.variant)), b"iso bytes")?;
            }
            Stage::Populate => {}
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct Fakes {
    pub(crate) packages: FakePackages,
    pub(crate) bugs: FakeBugs,
    pub(crate) boot: FakeBoot,
    pub(crate) mounts: FakeMounts,
    pub(crate) pipeline: FakePipeline,
}

impl Fakes {
    pub(crate) fn tools(&self) -> Tools<'_> {
        Tools {
            packages: &self.packages,
            bugs: &self.bugs,
            boot: &self.boot,
            mounts: &self.mounts,
            pipeline: &self.pipeline,
        }
    }
}
