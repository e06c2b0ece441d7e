//! Lifecycle control for persistent image-build environments.
//!
//! An environment is an isolated root filesystem kept between invocations
//! so that building a bootable image does not start from scratch each time.
//! On every run the [`controller`] decides whether the environment can be
//! reused, refreshes it in place when it can, rebuilds it when it cannot,
//! and keeps its kernel on the requested track.
//!
//! # Architecture
//!
//! ```text
//! controller
//!     │
//!     ├── validate   decide: build_fresh | force_clean | use_existing
//!     │      ├── state   typed record in <env>/.imagesmith-state
//!     │      └── hash    package-selection fingerprint
//!     ├── freshness  refresh, kernel update, bug-gated upgrade
//!     ├── track      kernel track reconciliation
//!     └── pipeline   bootstrap / populate / package hooks
//! ```
//!
//! External programs sit behind narrow traits ([`apt::PackageManager`],
//! [`bugs::BugOracle`], [`boot::BootImages`], [`mounts::Mounter`],
//! [`pipeline::Pipeline`]) bundled in [`Tools`], so the lifecycle logic runs
//! against in-memory fakes in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use imagesmith::config::{load_config, BuildContext};
//! use imagesmith::track::Track;
//!
//! let config = load_config("imagesmith.toml".as_ref())?;
//! let ctx = BuildContext::new(config, "gnome", Track::Stable)?;
//! let summary = imagesmith::controller::run(&ctx, &tools)?;
//! println!("{} ({})", summary.decision.action, summary.decision.reason);
//! ```

pub mod apt;
pub mod boot;
pub mod bugs;
pub mod compress;
pub mod config;
pub mod controller;
pub mod freshness;
pub mod hash;
pub mod mounts;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod state;
pub mod track;
pub mod validate;

#[cfg(test)]
mod testing;

pub use config::{BuildContext, BuilderConfig};
pub use controller::BuildSummary;
pub use state::{EnvironmentState, Field, StateStore};
pub use track::Track;
pub use validate::{Action, Decision};

use apt::PackageManager;
use boot::BootImages;
use bugs::BugOracle;
use mounts::Mounter;
use pipeline::Pipeline;

/// The external collaborators one run talks to.
#[derive(Clone, Copy)]
pub struct Tools<'a> {
    pub packages: &'a dyn PackageManager,
    pub bugs: &'a dyn BugOracle,
    pub boot: &'a dyn BootImages,
    pub mounts: &'a dyn Mounter,
    pub pipeline: &'a dyn Pipeline,
}
