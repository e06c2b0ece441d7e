//! Build-environment lifecycle.
//!
//! One invocation: decide what to do with the variant's environment, carry
//! out the remediation (rebuild from scratch or refresh in place), reconcile
//! the kernel track, then hand the environment to the packaging stage.
//! Stage completion is recorded in the environment's state file after each
//! step so an interrupted run is detected by the next one.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::compress;
use crate::config::BuildContext;
use crate::freshness::{self, FreshnessReport};
use crate::hash;
use crate::mounts::{self, Mounter};
use crate::pipeline::Stage;
use crate::state::{Field, StageMark, StateStore, SCHEMA_VERSION};
use crate::track::{self, SwitchStepFailed, TrackSwitch};
use crate::validate::{self, Action, Decision};
use crate::Tools;

/// What one `run` did.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub decision: Decision,
    /// Present only when an existing environment was reused.
    pub freshness: Option<FreshnessReport>,
    pub track: TrackSwitch,
    pub kernel_version: String,
    pub compressed: Vec<PathBuf>,
}

pub fn run(ctx: &BuildContext, tools: &Tools<'_>) -> Result<BuildSummary> {
    let env_dir = ctx.env_dir();
    let selection_hash = hash::package_selection_hash(&ctx.package_list_dirs())
        .context("computing package selection fingerprint")?;
    track::resolve_repo(&ctx.config.kernel, ctx.track)?;

    let decision = validate::decide(&env_dir, &ctx.variant, &selection_hash)?;

    let freshness = match decision.action {
        Action::BuildFresh => {
            build_fresh(ctx, tools, &selection_hash)?;
            None
        }
        Action::ForceClean => {
            discard_environment(tools.mounts, &env_dir)?;
            build_fresh(ctx, tools, &selection_hash)?;
            None
        }
        Action::UseExisting => {
            let report = freshness::check(ctx, tools);
            tracing::info!("freshness check finished\n{report}");
            Some(report)
        }
    };

    let store = StateStore::for_env(&env_dir);
    let switched = match track::ensure_track(ctx, tools) {
        Ok(switched) => switched,
        Err(e) => {
            if decision.action == Action::UseExisting
                && e.downcast_ref::<SwitchStepFailed>().is_some()
            {
                invalidate(&store);
            }
            return Err(e);
        }
    };
    let kernel_version = record_track(ctx, tools, &store)?;

    tools.pipeline.run_stage(ctx, Stage::Package)?;

    let compressed = if ctx.skip_compress {
        Vec::new()
    } else {
        compress::compress_images(&ctx.output_dir(), ctx.config.compress_level)?
    };

    Ok(BuildSummary {
        decision,
        freshness,
        track: switched,
        kernel_version,
        compressed,
    })
}

fn build_fresh(ctx: &BuildContext, tools: &Tools<'_>, selection_hash: &str) -> Result<()> {
    let env_dir = ctx.env_dir();

    tools.pipeline.run_stage(ctx, Stage::Bootstrap)?;
    if !env_dir.is_dir() {
        bail!(
            "bootstrap stage finished but '{}' does not exist",
            env_dir.display()
        );
    }
    let store = StateStore::for_env(&env_dir);
    store.write_fields(&[
        (Field::SchemaVersion, SCHEMA_VERSION.to_string()),
        (Field::OwnerVariant, ctx.variant.clone()),
        (Field::StageBootstrapAt, StageMark::now().to_string()),
    ])?;

    tools.pipeline.run_stage(ctx, Stage::Populate)?;
    store.write_fields(&[
        (Field::StageChrootAt, StageMark::now().to_string()),
        (Field::PackageSelectionHash, selection_hash.to_string()),
    ])?;
    Ok(())
}

/// Record the reconciled track. The metapackage and its version are written
/// together or not at all.
fn record_track(ctx: &BuildContext, tools: &Tools<'_>, store: &StateStore) -> Result<String> {
    let meta = ctx.track.meta_package(&ctx.config.kernel.image_meta);
    let Some(version) = tools
        .packages
        .installed_version(&meta)
        .with_context(|| format!("querying installed version of {meta}"))?
    else {
        bail!(
            "kernel metapackage {meta} is not installed after reconciling track '{}'",
            ctx.track
        );
    };

    store.write_fields(&[
        (Field::Track, ctx.track.to_string()),
        (Field::KernelMetaPackage, meta),
        (Field::KernelVersion, version.clone()),
        (Field::StageTrackSwitchAt, StageMark::now().to_string()),
    ])?;
    Ok(version)
}

fn invalidate(store: &StateStore) {
    tracing::error!(
        state = %store.path().display(),
        "kernel track reconciliation failed; environment will be rebuilt on the next run"
    );
    if let Err(e) = store.write(Field::InvalidatedAt, &StageMark::now().to_string()) {
        tracing::warn!(error = %e, "failed to mark environment as invalid");
    }
}

/// Unmount everything below `env_dir` and delete it.
pub fn discard_environment(mounter: &dyn Mounter, env_dir: &Path) -> Result<()> {
    if !env_dir.exists() {
        return Ok(());
    }
    mounts::unmount_all_below(mounter, env_dir)?;
    tracing::info!(env = %env_dir.display(), "discarding environment");
    fs::remove_dir_all(env_dir)
        .with_context(|| format!("removing environment '{}'", env_dir.display()))
}
