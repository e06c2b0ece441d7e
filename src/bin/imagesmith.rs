use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use imagesmith::apt::AptChroot;
use imagesmith::boot::UpdateInitramfs;
use imagesmith::bugs::AptListBugs;
use imagesmith::config::{load_config, locate_config, BuildContext};
use imagesmith::freshness::{KernelUpdate, UpgradeOutcome};
use imagesmith::mounts::HostMounts;
use imagesmith::pipeline::HookPipeline;
use imagesmith::track::TrackSwitch;
use imagesmith::{controller, hash, preflight, validate, StateStore, Tools, Track};

/// imagesmith - reusable build environments for live ISO and disk images
#[derive(Parser)]
#[command(name = "imagesmith")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: ./imagesmith.toml, then the user config dir)
    #[arg(long, global = true, env = "IMAGESMITH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct VariantArg {
    /// Variant the environment is built for
    #[arg(long, env = "IMAGESMITH_VARIANT")]
    variant: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or reuse) the variant's environment and package it
    Build {
        #[command(flatten)]
        target: VariantArg,

        /// Kernel track (stable, latest, rc, next)
        #[arg(long, env = "IMAGESMITH_TRACK", default_value = "stable")]
        track: Track,

        /// Upgrade even when critical, grave or serious bugs are reported
        #[arg(long, env = "IMAGESMITH_ALLOW_SERIOUS_BUGS")]
        allow_serious_bugs: bool,

        /// Leave disk images uncompressed
        #[arg(long, env = "IMAGESMITH_NO_COMPRESS")]
        no_compress: bool,
    },

    /// Show the environment's record and what the next build would do
    Status {
        #[command(flatten)]
        target: VariantArg,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Unmount and delete the variant's environment
    Clean {
        #[command(flatten)]
        target: VariantArg,
    },

    /// Print the current package-selection fingerprint
    Hash {
        #[command(flatten)]
        target: VariantArg,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let config_path = locate_config(cli.config.as_deref())?;
    let config = load_config(&config_path)?;
    tracing::debug!(config = %config_path.display(), "loaded configuration");

    match cli.command {
        Commands::Build {
            target,
            track,
            allow_serious_bugs,
            no_compress,
        } => {
            let mut ctx = BuildContext::new(config, &target.variant, track)?;
            ctx.allow_serious_bugs = allow_serious_bugs;
            ctx.skip_compress = no_compress;
            cmd_build(&ctx)
        }
        Commands::Status { target, json } => {
            let ctx = BuildContext::new(config, &target.variant, Track::default())?;
            cmd_status(&ctx, json)
        }
        Commands::Clean { target } => {
            let ctx = BuildContext::new(config, &target.variant, Track::default())?;
            cmd_clean(&ctx)
        }
        Commands::Hash { target } => {
            let ctx = BuildContext::new(config, &target.variant, Track::default())?;
            println!("{}", current_hash(&ctx)?);
            Ok(())
        }
    }
}

fn current_hash(ctx: &BuildContext) -> Result<String> {
    hash::package_selection_hash(&ctx.package_list_dirs())
        .context("computing package selection fingerprint")
}

fn cmd_build(ctx: &BuildContext) -> Result<()> {
    preflight::check_host()?;

    let env_dir = ctx.env_dir();
    let packages = AptChroot::new(&env_dir);
    let bugs = AptListBugs::new(&env_dir);
    let boot = UpdateInitramfs::new(&env_dir);
    let mounts = HostMounts;
    let pipeline = HookPipeline;
    let tools = Tools {
        packages: &packages,
        bugs: &bugs,
        boot: &boot,
        mounts: &mounts,
        pipeline: &pipeline,
    };

    println!(
        "[imagesmith:{}] building on track {} in {}",
        ctx.variant,
        ctx.track,
        env_dir.display()
    );
    let summary = controller::run(ctx, &tools)
        .with_context(|| format!("building variant '{}'", ctx.variant))?;

    let tag = format!("[imagesmith:{}]", ctx.variant);
    println!(
        "{tag} environment: {} ({})",
        summary.decision.action, summary.decision.reason
    );
    if let Some(report) = &summary.freshness {
        match &report.kernel {
            KernelUpdate::Updated { package, from, to } => {
                println!("{tag} kernel: {package} {from} -> {to}")
            }
            KernelUpdate::Failed(e) => println!("{tag} kernel: update failed: {e}"),
            _ => {}
        }
        match &report.upgrade {
            UpgradeOutcome::Upgraded { packages } => {
                println!("{tag} upgraded {} package(s)", packages.len())
            }
            UpgradeOutcome::Blocked { packages, .. } => println!(
                "{tag} held back {} package(s); rerun with --allow-serious-bugs to upgrade",
                packages.len()
            ),
            UpgradeOutcome::Failed(e) => println!("{tag} upgrade failed: {e}"),
            _ => {}
        }
    }
    match &summary.track {
        TrackSwitch::AlreadyActive { meta_package } => {
            println!("{tag} kernel track {} already active ({meta_package})", ctx.track)
        }
        TrackSwitch::Switched { installed, .. } => println!(
            "{tag} switched kernel track to {} ({})",
            ctx.track,
            installed.join(", ")
        ),
    }
    println!("{tag} kernel version {}", summary.kernel_version);
    for path in &summary.compressed {
        println!("{tag} wrote {}", path.display());
    }
    println!("{tag} done: {}", ctx.output_dir().display());
    Ok(())
}

fn cmd_status(ctx: &BuildContext, json: bool) -> Result<()> {
    let env_dir = ctx.env_dir();
    let hash = current_hash(ctx)?;
    let (decision, state) = validate::inspect(&env_dir, &ctx.variant, &hash)?;

    let record = state
        .as_ref()
        .map(|state| state.present_fields())
        .unwrap_or_default();

    if json {
        let record: serde_json::Map<String, serde_json::Value> = record
            .iter()
            .map(|(field, value)| (field.key().to_string(), value.clone().into()))
            .collect();
        let out = serde_json::json!({
            "variant": ctx.variant,
            "environment": env_dir,
            "state_file": StateStore::for_env(&env_dir).path(),
            "package_selection_hash": hash,
            "record": record,
            "decision": decision,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Environment: {}", env_dir.display());
    if record.is_empty() {
        println!("Record:      (none)");
    } else {
        println!("Record:");
        for (field, value) in &record {
            println!("  {}={value}", field.key());
        }
    }
    println!("Selection:   {hash}");
    println!("Next build:  {} ({})", decision.action, decision.reason);
    for warning in &decision.warnings {
        println!("Warning:     {warning}");
    }
    Ok(())
}

fn cmd_clean(ctx: &BuildContext) -> Result<()> {
    let env_dir = ctx.env_dir();
    if !env_dir.exists() {
        println!("[imagesmith:{}] nothing to clean", ctx.variant);
        return Ok(());
    }
    controller::discard_environment(&HostMounts, &env_dir)?;
    println!("[imagesmith:{}] removed {}", ctx.variant, env_dir.display());
    Ok(())
}
