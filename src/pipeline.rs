//! External build stages.
//!
//! Populating an environment and turning it into bootable media are done by
//! shell hooks configured in `imagesmith.toml`. The controller only decides
//! *when* each stage runs and records that it completed.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::config::BuildContext;
use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Create the base filesystem.
    Bootstrap,
    /// Install the variant's packages into the environment.
    Populate,
    /// Build the ISO and disk image from the environment.
    Package,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Bootstrap => "bootstrap",
            Stage::Populate => "populate",
            Stage::Package => "package",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Pipeline {
    fn run_stage(&self, ctx: &BuildContext, stage: Stage) -> Result<()>;
}

/// Runs the configured hook script for each stage with `sh`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookPipeline;

impl Pipeline for HookPipeline {
    fn run_stage(&self, ctx: &BuildContext, stage: Stage) -> Result<()> {
        let hooks = &ctx.config.hooks;
        let script = match stage {
            Stage::Bootstrap => &hooks.bootstrap,
            Stage::Populate => &hooks.populate,
            Stage::Package => &hooks.package,
        };
        if !script.is_file() {
            bail!(
                "missing {} hook for variant '{}': {}\n\
                 add the script or point hooks.{} at it in the configuration.",
                stage,
                ctx.variant,
                script.display(),
                stage
            );
        }

        let env_dir = ctx.env_dir();
        let output_dir = ctx.output_dir();
        if stage == Stage::Bootstrap {
            ensure_parent(&env_dir)?;
        }
        if stage == Stage::Package {
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("creating output directory '{}'", output_dir.display()))?;
        }

        tracing::info!(stage = %stage, script = %script.display(), "running stage hook");
        hook_command(ctx, script, &env_dir, &output_dir)
            .error_msg(&format!(
                "{} hook failed for variant '{}'",
                stage, ctx.variant
            ))
            .run_interactive()
    }
}

fn hook_command(ctx: &BuildContext, script: &Path, env_dir: &Path, output_dir: &Path) -> Cmd {
    let package_lists = ctx
        .package_list_dirs()
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");

    Cmd::new("sh")
        .arg_path(script)
        .current_dir(&ctx.config.repo_root)
        .env("IMAGESMITH_ENV_DIR", env_dir)
        .env("IMAGESMITH_VARIANT", &ctx.variant)
        .env("IMAGESMITH_TRACK", ctx.track.as_str())
        .env("IMAGESMITH_OUTPUT_DIR", output_dir)
        .env("IMAGESMITH_PACKAGE_LISTS", package_lists)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating work directory '{}'", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;
    use tempfile::TempDir;

    #[test]
    fn test_hook_receives_environment() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(tmp.path(), "gnome");
        fs::create_dir_all(ctx.config.hooks.bootstrap.parent().unwrap()).unwrap();
        fs::write(
            &ctx.config.hooks.bootstrap,
            "mkdir -p \"$IMAGESMITH_ENV_DIR\"\n\
             printf '%s %s' \"$IMAGESMITH_VARIANT\" \"$IMAGESMITH_TRACK\" > \"$IMAGESMITH_ENV_DIR/marker\"\n",
        )
        .unwrap();

        HookPipeline.run_stage(&ctx, Stage::Bootstrap).unwrap();
        let marker = fs::read_to_string(ctx.env_dir().join("marker")).unwrap();
        assert_eq!(marker, "gnome stable");
    }

    #[test]
    fn test_missing_hook_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(tmp.path(), "gnome");
        let err = HookPipeline
            .run_stage(&ctx, Stage::Populate)
            .unwrap_err()
            .to_string();
        assert!(err.contains("missing populate hook"));
    }

    #[test]
    fn test_failing_hook_propagates() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(tmp.path(), "gnome");
        fs::create_dir_all(ctx.config.hooks.package.parent().unwrap()).unwrap();
        fs::write(&ctx.config.hooks.package, "exit 7\n").unwrap();
        assert!(HookPipeline.run_stage(&ctx, Stage::Package).is_err());
        assert!(ctx.output_dir().is_dir());
    }
}
