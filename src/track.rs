//! Kernel track reconciliation.
//!
//! A track selects which kernel metapackages are installed. The default
//! track uses the configured base names; every other track appends its name
//! (`linux-image-amd64` → `linux-image-amd64-latest`) and pulls from its own
//! apt repository.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{BuildContext, KernelConfig, TrackRepo};
use crate::Tools;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Track {
    #[default]
    Stable,
    Latest,
    Rc,
    Next,
}

impl Track {
    pub const ALL: [Track; 4] = [Track::Stable, Track::Latest, Track::Rc, Track::Next];

    pub fn as_str(self) -> &'static str {
        match self {
            Track::Stable => "stable",
            Track::Latest => "latest",
            Track::Rc => "rc",
            Track::Next => "next",
        }
    }

    pub fn is_default(self) -> bool {
        self == Track::default()
    }

    /// Metapackage name for this track derived from the default-track name.
    pub fn meta_package(self, base: &str) -> String {
        if self.is_default() {
            base.to_string()
        } else {
            format!("{base}-{}", self.as_str())
        }
    }
}

impl FromStr for Track {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Ok(Track::Stable),
            "latest" => Ok(Track::Latest),
            "rc" => Ok(Track::Rc),
            "next" => Ok(Track::Next),
            other => bail!(
                "unsupported track '{}'; expected one of: stable, latest, rc, next",
                other
            ),
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image metapackage first, then headers when configured.
pub fn meta_packages(kernel: &KernelConfig, track: Track) -> Vec<String> {
    let mut packages = vec![track.meta_package(&kernel.image_meta)];
    if let Some(headers) = &kernel.headers_meta {
        packages.push(track.meta_package(headers));
    }
    packages
}

pub fn source_list_path(env_dir: &Path, track: Track) -> PathBuf {
    env_dir
        .join("etc/apt/sources.list.d")
        .join(format!("imagesmith-kernel-{track}.list"))
}

pub fn keyring_path(env_dir: &Path, track: Track) -> PathBuf {
    env_dir
        .join("etc/apt/keyrings")
        .join(format!("imagesmith-kernel-{track}.gpg"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSwitch {
    /// The requested metapackage was already installed; nothing changed.
    AlreadyActive { meta_package: String },
    Switched {
        removed: Vec<String>,
        installed: Vec<String>,
    },
}

/// A mandatory switch step that failed after the environment was modified.
///
/// Attached as context to the underlying error; callers find it with
/// `downcast_ref`. Configuration problems never carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStepFailed {
    Install(Track),
    RegenerateBootImages(Track),
}

impl fmt::Display for SwitchStepFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchStepFailed::Install(track) => write!(f, "installing kernel track '{track}'"),
            SwitchStepFailed::RegenerateBootImages(track) => {
                write!(f, "regenerating boot images after switching to track '{track}'")
            }
        }
    }
}

/// The repository for `track`, checked without touching the environment.
/// The default track needs none.
pub fn resolve_repo(kernel: &KernelConfig, track: Track) -> Result<Option<&TrackRepo>> {
    if track.is_default() {
        return Ok(None);
    }
    let Some(repo) = kernel.repos.get(&track) else {
        bail!(
            "no repository configured for kernel track '{}'; add [kernel.repos.{}]",
            track,
            track
        );
    };
    if let Some(keyring) = &repo.keyring {
        if !keyring.is_file() {
            bail!(
                "keyring for kernel track '{}' not found: {}",
                track,
                keyring.display()
            );
        }
    }
    Ok(Some(repo))
}

/// Make the environment's kernel match `ctx.track`.
pub fn ensure_track(ctx: &BuildContext, tools: &Tools<'_>) -> Result<TrackSwitch> {
    let env_dir = ctx.env_dir();
    let kernel = &ctx.config.kernel;
    let requested = ctx.track;
    let wanted = meta_packages(kernel, requested);
    let image_meta = wanted[0].clone();

    let installed = tools
        .packages
        .installed_version(&image_meta)
        .with_context(|| format!("querying installed version of {image_meta}"))?;
    if installed.is_some() {
        tracing::info!(track = %requested, meta = %image_meta, "kernel track already active");
        return Ok(TrackSwitch::AlreadyActive {
            meta_package: image_meta,
        });
    }

    let repo = resolve_repo(kernel, requested)?;

    tracing::info!(track = %requested, meta = %image_meta, "switching kernel track");
    install_track_sources(repo, &env_dir, requested)?;
    remove_foreign_hooks(kernel, &env_dir)?;

    if let Err(e) = tools.packages.refresh() {
        tracing::warn!(error = %e, "metadata refresh failed during track switch; continuing");
    }

    let stale = installed_other_track_packages(ctx, tools);
    if !stale.is_empty() {
        tracing::info!(packages = %stale.join(" "), "removing other kernel tracks");
        if let Err(e) = tools.packages.remove(&stale) {
            tracing::warn!(error = %e, "removing other kernel tracks failed; continuing");
        }
    }

    tools
        .packages
        .install(&wanted)
        .context(SwitchStepFailed::Install(requested))?;

    if let Err(e) = tools.packages.autoremove() {
        tracing::warn!(error = %e, "autoremove after track switch failed; continuing");
    }

    tools
        .boot
        .regenerate_all()
        .context(SwitchStepFailed::RegenerateBootImages(requested))?;

    Ok(TrackSwitch::Switched {
        removed: stale,
        installed: wanted,
    })
}

fn installed_other_track_packages(ctx: &BuildContext, tools: &Tools<'_>) -> Vec<String> {
    let mut stale = Vec::new();
    for track in Track::ALL.into_iter().filter(|t| *t != ctx.track) {
        for package in meta_packages(&ctx.config.kernel, track) {
            match tools.packages.installed_version(&package) {
                Ok(Some(_)) => stale.push(package),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(package = %package, error = %e, "could not query package; skipping")
                }
            }
        }
    }
    stale
}

/// Write the apt source and keyring for `track`, then drop those of every
/// other track. `repo` has already been resolved.
fn install_track_sources(repo: Option<&TrackRepo>, env_dir: &Path, track: Track) -> Result<()> {
    if let Some(repo) = repo {
        if let Some(keyring) = &repo.keyring {
            let dest = keyring_path(env_dir, track);
            create_parent(&dest)?;
            fs::copy(keyring, &dest).with_context(|| {
                format!(
                    "installing keyring '{}' to '{}'",
                    keyring.display(),
                    dest.display()
                )
            })?;
        }

        let list = source_list_path(env_dir, track);
        create_parent(&list)?;
        fs::write(&list, format!("{}\n", repo.source))
            .with_context(|| format!("writing '{}'", list.display()))?;
    }

    for other in Track::ALL.into_iter().filter(|t| *t != track) {
        for path in [source_list_path(env_dir, other), keyring_path(env_dir, other)] {
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("removing '{}'", path.display()))?;
            }
        }
    }
    Ok(())
}

fn remove_foreign_hooks(kernel: &KernelConfig, env_dir: &Path) -> Result<()> {
    for hook in &kernel.foreign_hooks {
        let path = env_dir.join(hook);
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        tracing::info!(hook = %path.display(), "removing foreign kernel hook");
        if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("removing '{}'", path.display()))?;
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    Ok(())
}
