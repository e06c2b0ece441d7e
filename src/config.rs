//! Builder configuration (`imagesmith.toml`) and the per-invocation context.
//!
//! Every component receives a `&BuildContext` instead of reading ambient
//! environment variables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::compress;
use crate::track::Track;

/// Default config file name looked up in the working directory.
pub const CONFIG_FILENAME: &str = "imagesmith.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(default)]
    paths: PathsToml,
    hooks: HooksToml,
    kernel: KernelToml,
    #[serde(default)]
    compress: CompressToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsToml {
    #[serde(default = "default_work_dir")]
    work_dir: String,
    #[serde(default = "default_output_dir")]
    output_dir: String,
    #[serde(default = "default_package_lists")]
    package_lists: Vec<String>,
    #[serde(default = "default_variants_dir")]
    variants_dir: Option<String>,
}

impl Default for PathsToml {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
            package_lists: default_package_lists(),
            variants_dir: default_variants_dir(),
        }
    }
}

fn default_work_dir() -> String {
    ".artifacts/work".to_string()
}

fn default_output_dir() -> String {
    ".artifacts/out".to_string()
}

fn default_package_lists() -> Vec<String> {
    vec!["config/package-lists".to_string()]
}

fn default_variants_dir() -> Option<String> {
    Some("config/variants".to_string())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HooksToml {
    bootstrap: String,
    populate: String,
    package: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KernelToml {
    image_meta: String,
    headers_meta: Option<String>,
    #[serde(default)]
    foreign_hooks: Vec<String>,
    #[serde(default)]
    repos: BTreeMap<String, TrackRepoToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrackRepoToml {
    source: String,
    keyring: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompressToml {
    #[serde(default = "default_compress_level")]
    level: i32,
}

impl Default for CompressToml {
    fn default() -> Self {
        Self {
            level: default_compress_level(),
        }
    }
}

fn default_compress_level() -> i32 {
    compress::DEFAULT_LEVEL
}

/// Stage hook scripts, resolved to absolute paths.
#[derive(Debug, Clone)]
pub struct HookScripts {
    pub bootstrap: PathBuf,
    pub populate: PathBuf,
    pub package: PathBuf,
}

/// Apt repository and keyring that provide a non-default kernel track.
#[derive(Debug, Clone)]
pub struct TrackRepo {
    pub source: String,
    pub keyring: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Image metapackage name for the default track.
    pub image_meta: String,
    /// Headers metapackage name for the default track.
    pub headers_meta: Option<String>,
    /// Hook files of other platforms, relative to the environment root.
    pub foreign_hooks: Vec<PathBuf>,
    pub repos: BTreeMap<Track, TrackRepo>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub repo_root: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub package_lists: Vec<PathBuf>,
    pub variants_dir: Option<PathBuf>,
    pub hooks: HookScripts,
    pub kernel: KernelConfig,
    pub compress_level: i32,
}

/// Find the config file: explicit path, then `./imagesmith.toml`, then the
/// per-user config directory.
pub fn locate_config(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("config file not found: {}", path.display());
        }
        return Ok(path.to_path_buf());
    }

    let cwd = std::env::current_dir().context("resolving current directory")?;
    let local = cwd.join(CONFIG_FILENAME);
    if local.is_file() {
        return Ok(local);
    }

    let user = dirs::config_dir().map(|dir| dir.join("imagesmith").join("config.toml"));
    if let Some(user) = &user {
        if user.is_file() {
            return Ok(user.clone());
        }
    }

    bail!(
        "no configuration found.\n\
         Tried:\n\
         1. {}\n\
         2. {}\n\
         Pass --config <path> or create {} in the build tree.",
        local.display(),
        user.map(|p| p.display().to_string())
            .unwrap_or_else(|| "<no user config directory>".to_string()),
        CONFIG_FILENAME
    )
}

/// Load and resolve a config file. Relative paths resolve against the
/// directory containing it.
pub fn load_config(path: &Path) -> Result<BuilderConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    let repo_root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let repo_root = if repo_root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        repo_root
    };
    parse_config(&text, &repo_root).with_context(|| format!("parsing config '{}'", path.display()))
}

pub(crate) fn parse_config(text: &str, repo_root: &Path) -> Result<BuilderConfig> {
    let parsed: ConfigToml = toml::from_str(text)?;

    let mut repos = BTreeMap::new();
    for (name, repo) in parsed.kernel.repos {
        let track: Track = name
            .parse()
            .with_context(|| format!("invalid [kernel.repos.{name}] section"))?;
        if track == Track::default() {
            bail!("[kernel.repos.{name}]: the default track uses the base repositories");
        }
        repos.insert(
            track,
            TrackRepo {
                source: repo.source.trim().to_string(),
                keyring: repo.keyring.map(|k| resolve_repo_path(repo_root, &k)),
            },
        );
    }

    let mut foreign_hooks = Vec::new();
    for hook in parsed.kernel.foreign_hooks {
        foreign_hooks.push(parse_relative_path(&hook, "kernel.foreign_hooks")?);
    }

    if parsed.kernel.image_meta.trim().is_empty() {
        bail!("kernel.image_meta must not be empty");
    }
    if !compress::LEVELS.contains(&parsed.compress.level) {
        bail!(
            "compress.level must be between 1 and 22, got {}",
            parsed.compress.level
        );
    }

    Ok(BuilderConfig {
        repo_root: repo_root.to_path_buf(),
        work_dir: resolve_repo_path(repo_root, &parsed.paths.work_dir),
        output_dir: resolve_repo_path(repo_root, &parsed.paths.output_dir),
        package_lists: parsed
            .paths
            .package_lists
            .iter()
            .map(|p| resolve_repo_path(repo_root, p))
            .collect(),
        variants_dir: parsed
            .paths
            .variants_dir
            .map(|p| resolve_repo_path(repo_root, &p)),
        hooks: HookScripts {
            bootstrap: resolve_repo_path(repo_root, &parsed.hooks.bootstrap),
            populate: resolve_repo_path(repo_root, &parsed.hooks.populate),
            package: resolve_repo_path(repo_root, &parsed.hooks.package),
        },
        kernel: KernelConfig {
            image_meta: parsed.kernel.image_meta.trim().to_string(),
            headers_meta: parsed
                .kernel
                .headers_meta
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
            foreign_hooks,
            repos,
        },
        compress_level: parsed.compress.level,
    })
}

fn resolve_repo_path(repo_root: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        repo_root.join(candidate)
    }
}

fn parse_relative_path(raw: &str, field: &str) -> Result<PathBuf> {
    use std::path::Component;

    let candidate = Path::new(raw.trim_start_matches('/'));
    if raw.trim().is_empty() {
        bail!("{field} contains an empty path");
    }
    for component in candidate.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            bail!("{field} contains invalid traversal component in '{}'", raw);
        }
    }
    Ok(candidate.to_path_buf())
}

/// Everything one invocation needs, passed by reference to each component.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub config: BuilderConfig,
    pub variant: String,
    pub track: Track,
    /// Upgrade even when the bug oracle reports serious issues.
    pub allow_serious_bugs: bool,
    /// Leave disk images uncompressed after packaging.
    pub skip_compress: bool,
}

impl BuildContext {
    pub fn new(config: BuilderConfig, variant: &str, track: Track) -> Result<Self> {
        validate_variant(variant)?;
        Ok(Self {
            config,
            variant: variant.to_string(),
            track,
            allow_serious_bugs: false,
            skip_compress: false,
        })
    }

    /// The environment reserved for this variant.
    pub fn env_dir(&self) -> PathBuf {
        self.config
            .work_dir
            .join(format!("chroot-{}", self.variant))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.config.output_dir.join(&self.variant)
    }

    /// Package-list inputs active for this variant: shared lists first,
    /// then the variant's own `package-lists` directory.
    pub fn package_list_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.config.package_lists.clone();
        if let Some(variants) = &self.config.variants_dir {
            dirs.push(variants.join(&self.variant).join("package-lists"));
        }
        dirs
    }
}

fn validate_variant(variant: &str) -> Result<()> {
    if variant.is_empty() {
        bail!("variant name must not be empty");
    }
    if variant.starts_with('.')
        || !variant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        bail!(
            "invalid variant '{}': use letters, digits, '-', '_' or '.'",
            variant
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[paths]
work_dir = "/var/tmp/imagesmith"
package_lists = ["config/package-lists", "config/extra"]

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
keyring = "keys/kernel.gpg"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = parse_config(SAMPLE, Path::new("/repo")).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/var/tmp/imagesmith"));
        assert_eq!(config.output_dir, PathBuf::from("/repo/.artifacts/out"));
        assert_eq!(
            config.package_lists,
            vec![
                PathBuf::from("/repo/config/package-lists"),
                PathBuf::from("/repo/config/extra")
            ]
        );
        assert_eq!(config.hooks.populate, PathBuf::from("/repo/hooks/populate.sh"));
        assert_eq!(config.kernel.image_meta, "linux-image-amd64");
        assert_eq!(config.compress_level, compress::DEFAULT_LEVEL);

        let latest = &config.kernel.repos[&Track::Latest];
        assert_eq!(latest.keyring, Some(PathBuf::from("/repo/keys/kernel.gpg")));
        assert_eq!(
            config.kernel.foreign_hooks,
            vec![PathBuf::from("etc/kernel/postinst.d/z50-raspi-firmware")]
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let text = format!("{SAMPLE}\n[extra]\nfoo = 1\n");
        assert!(parse_config(&text, Path::new("/repo")).is_err());
    }

    #[test]
    fn test_unknown_track_repo_rejected() {
        let text = SAMPLE.replace("[kernel.repos.latest]", "[kernel.repos.lts]");
        assert!(parse_config(&text, Path::new("/repo")).is_err());
    }

    #[test]
    fn test_default_track_repo_rejected() {
        let text = SAMPLE.replace("[kernel.repos.latest]", "[kernel.repos.stable]");
        assert!(parse_config(&text, Path::new("/repo")).is_err());
    }

    #[test]
    fn test_foreign_hook_traversal_rejected() {
        let text = SAMPLE.replace(
            "etc/kernel/postinst.d/z50-raspi-firmware",
            "../etc/passwd",
        );
        assert!(parse_config(&text, Path::new("/repo")).is_err());
    }

    #[test]
    fn test_context_paths() {
        let config = parse_config(SAMPLE, Path::new("/repo")).unwrap();
        let ctx = BuildContext::new(config, "gnome", Track::Stable).unwrap();
        assert_eq!(
            ctx.env_dir(),
            PathBuf::from("/var/tmp/imagesmith/chroot-gnome")
        );
        assert_eq!(ctx.output_dir(), PathBuf::from("/repo/.artifacts/out/gnome"));
        assert_eq!(
            ctx.package_list_dirs().last().unwrap(),
            &PathBuf::from("/repo/config/variants/gnome/package-lists")
        );
    }

    #[test]
    fn test_variant_names_validated() {
        let config = parse_config(SAMPLE, Path::new("/repo")).unwrap();
        assert!(BuildContext::new(config.clone(), "../etc", Track::Stable).is_err());
        assert!(BuildContext::new(config.clone(), "", Track::Stable).is_err());
        assert!(BuildContext::new(config, "kde-plasma_6", Track::Stable).is_ok());
    }

    #[test]
    fn test_locate_explicit_missing() {
        assert!(locate_config(Some(Path::new("/definitely/not/here.toml"))).is_err());
    }
}
