//! Reuse decision for an existing build environment.
//!
//! [`evaluate`] is a pure function over what was observed on disk;
//! [`decide`] gathers those observations, performs adoption of record-less
//! environments, and logs the outcome.
//!
//! Every incompleteness signal (missing record, missing stage, schema drift,
//! variant mismatch) resolves to [`Action::ForceClean`]: a partially
//! populated root cannot be resumed mid-stage. Only a record that attests
//! both ordered stages for the requested variant under a supported schema is
//! trusted for reuse.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::state::{EnvironmentState, Field, StageMark, StateStore, SCHEMA_VERSION};

pub const REASON_NO_ENVIRONMENT: &str = "no environment";
pub const REASON_ADOPTED: &str = "adopted pre-existing environment";
pub const REASON_INCOMPLETE: &str = "no state record and environment looks incomplete";
pub const REASON_SCHEMA_TOO_NEW: &str = "state version newer than supported";
pub const REASON_OTHER_VARIANT: &str = "built for a different variant";
pub const REASON_NO_BOOTSTRAP: &str = "bootstrap never completed";
pub const REASON_CHROOT_INTERRUPTED: &str = "chroot stage interrupted after bootstrap";
pub const REASON_INVALIDATED: &str = "previous run left the environment inconsistent";
pub const REASON_COMPLETE: &str = "complete";

/// Package-manager files whose presence means the base install finished.
const APT_BINARY: &str = "usr/bin/apt-get";
const APT_CONFIG_DIR: &str = "etc/apt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    BuildFresh,
    ForceClean,
    UseExisting,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::BuildFresh => "build_fresh",
            Action::ForceClean => "force_clean",
            Action::UseExisting => "use_existing",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub reason: &'static str,
    /// Advisory conditions that do not change the action.
    pub warnings: Vec<String>,
    /// The environment has no record and is trusted from its contents.
    pub adopt: bool,
}

impl Decision {
    fn new(action: Action, reason: &'static str) -> Self {
        Self {
            action,
            reason,
            warnings: Vec::new(),
            adopt: false,
        }
    }
}

/// What is on disk for one environment.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub env_exists: bool,
    pub state: Option<&'a EnvironmentState>,
    pub has_base_install: bool,
}

/// Decide what to do with an environment. First matching rule wins.
pub fn evaluate(obs: &Observation<'_>, requested_variant: &str, current_hash: &str) -> Decision {
    if !obs.env_exists {
        return Decision::new(Action::BuildFresh, REASON_NO_ENVIRONMENT);
    }

    let Some(state) = obs.state else {
        if obs.has_base_install {
            let mut decision = Decision::new(Action::UseExisting, REASON_ADOPTED);
            decision.adopt = true;
            return decision;
        }
        return Decision::new(Action::ForceClean, REASON_INCOMPLETE);
    };

    if state.schema_version > SCHEMA_VERSION {
        return Decision::new(Action::ForceClean, REASON_SCHEMA_TOO_NEW);
    }

    if let Some(owner) = &state.owner_variant {
        if owner != requested_variant {
            return Decision::new(Action::ForceClean, REASON_OTHER_VARIANT);
        }
    }

    if state.stage_bootstrap_at.is_none() {
        return Decision::new(Action::ForceClean, REASON_NO_BOOTSTRAP);
    }

    if state.stage_chroot_at.is_none() {
        return Decision::new(Action::ForceClean, REASON_CHROOT_INTERRUPTED);
    }

    if state.invalidated_at.is_some() {
        return Decision::new(Action::ForceClean, REASON_INVALIDATED);
    }

    let mut decision = Decision::new(Action::UseExisting, REASON_COMPLETE);
    match state.package_selection_hash.as_deref() {
        Some(recorded) if recorded == current_hash => {}
        Some(recorded) => decision.warnings.push(format!(
            "package selection changed since this environment was built (recorded {}, current {}); \
             a clean rebuild is recommended",
            short(recorded),
            short(current_hash)
        )),
        None => decision.warnings.push(
            "no package selection fingerprint recorded for this environment; \
             a clean rebuild is recommended"
                .to_string(),
        ),
    }
    decision
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Whether `env_dir` contains a working package manager and its config.
pub fn has_base_install(env_dir: &Path) -> bool {
    let binary = env_dir.join(APT_BINARY);
    let executable = match fs::metadata(&binary) {
        Ok(meta) => {
            use std::os::unix::fs::PermissionsExt;
            meta.is_file() && meta.permissions().mode() & 0o111 != 0
        }
        Err(_) => false,
    };
    executable && env_dir.join(APT_CONFIG_DIR).is_dir()
}

/// Gather observations for `env_dir` without modifying anything.
pub fn inspect(
    env_dir: &Path,
    requested_variant: &str,
    current_hash: &str,
) -> Result<(Decision, Option<EnvironmentState>)> {
    let env_exists = env_dir.is_dir();
    let state = if env_exists {
        StateStore::for_env(env_dir).load()?
    } else {
        None
    };
    let obs = Observation {
        env_exists,
        state: state.as_ref(),
        has_base_install: env_exists && state.is_none() && has_base_install(env_dir),
    };
    let decision = evaluate(&obs, requested_variant, current_hash);
    Ok((decision, state))
}

/// Decide on `env_dir`, adopting a record-less but complete environment by
/// writing a record for it, and log the result.
pub fn decide(env_dir: &Path, requested_variant: &str, current_hash: &str) -> Result<Decision> {
    let (decision, _) = inspect(env_dir, requested_variant, current_hash)?;

    if decision.adopt {
        let mark = StageMark::adopted_now().to_string();
        StateStore::for_env(env_dir)
            .write_fields(&[
                (Field::SchemaVersion, SCHEMA_VERSION.to_string()),
                (Field::OwnerVariant, requested_variant.to_string()),
                (Field::StageBootstrapAt, mark.clone()),
                (Field::StageChrootAt, mark),
                (Field::PackageSelectionHash, current_hash.to_string()),
            ])
            .with_context(|| format!("adopting environment '{}'", env_dir.display()))?;
    }

    tracing::info!(
        env = %env_dir.display(),
        action = %decision.action,
        reason = decision.reason,
        "environment decision"
    );
    for warning in &decision.warnings {
        tracing::warn!("{warning}");
    }
    Ok(decision)
}
