//! Headless runner: keep a token alive and hold one bastion tunnel open
//! until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bastion_core::config::{log_dir, AppSettings, SettingsOrigin, SettingsStorage};
use bastion_core::logging::init_logging;
use bastion_core::tunnel::SystemLauncher;
use bastion_core::util::cli_installed;
use bastion_core::bastion::InstanceDirectory;
use bastion_core::{BastionConnection, CoreContext, CoreEvent, TokenManager};
use clap::{ArgGroup, Parser};
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bastion-core")]
#[command(group(ArgGroup::new("target").args(["target_id", "target_name"])))]
struct Args {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cloud CLI profile name
    #[arg(short, long, env = "BASTION_PROFILE")]
    profile: Option<String>,

    #[arg(short, long, env = "BASTION_REGION")]
    region: Option<String>,

    /// Bastion to open a session on; token renewal only when omitted
    #[arg(long, env = "BASTION_ID", requires = "target")]
    bastion_id: Option<String>,

    /// Compute instance the session forwards to
    #[arg(long, env = "BASTION_TARGET_ID")]
    target_id: Option<String>,

    /// Running instance display name, looked up across the tenancy
    #[arg(long, env = "BASTION_TARGET_NAME")]
    target_name: Option<String>,

    #[arg(long)]
    local_port: Option<u16>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate settings and exit
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn apply(&self, settings: &mut AppSettings) {
        if let Some(profile) = &self.profile {
            settings.profile.name = profile.clone();
        }
        if let Some(region) = &self.region {
            settings.profile.region = region.clone();
        }
        if let Some(port) = self.local_port {
            settings.connection.local_port = port;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(log_dir().ok().as_deref(), &args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let storage = match &args.config {
        Some(path) => SettingsStorage::with_path(path.clone()),
        None => SettingsStorage::new()?,
    };
    let loaded = storage.load_or_init().await?;
    if let SettingsOrigin::Recovered { backup } = &loaded.origin {
        warn!("Settings were unreadable; previous file kept at {}", backup.display());
    }
    let mut settings = loaded.settings;
    args.apply(&mut settings);
    settings.validate()?;

    if args.dry_run {
        info!("Settings valid: {}", storage.path().display());
        return Ok(());
    }

    if !cli_installed(&settings.settings.cli_program).await {
        bail!("{} is not installed", settings.settings.cli_program);
    }

    let ctx = CoreContext::new(settings);
    ctx.events().subscribe(|event: &CoreEvent| match serde_json::to_string(event) {
        Ok(json) => info!(target: "bastion_core::events", "{}", json),
        Err(e) => error!("Unserializable event: {}", e),
    });

    let tokens = ctx
        .token_manager()
        .await
        .context("Failed to load profile")?;
    let scheduler = ctx.renewal_scheduler(tokens.clone());
    if !scheduler.start().await {
        bail!("Security token could not be renewed");
    }

    let connection = match &args.bastion_id {
        Some(bastion_id) => {
            let target_id = resolve_target(&ctx, &tokens, &args).await?;
            let provisioner = ctx.provisioner(ctx.bastion_api(&tokens));
            let connection = BastionConnection::new(
                ctx.clone(),
                provisioner,
                Arc::new(SystemLauncher),
                ctx.region(&tokens),
                bastion_id,
                &target_id,
            )?;
            let session = connection.open().await?;
            info!(
                session_id = %session.id,
                "Forwarding 127.0.0.1:{} until interrupted",
                ctx.settings().connection.local_port
            );
            Some(connection)
        }
        None => {
            info!("No bastion target given; keeping the token alive until interrupted");
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");

    if let Some(connection) = connection {
        connection.close().await;
    }
    scheduler.stop();
    Ok(())
}

/// Instance OCID from `--target-id`, or looked up by `--target-name`
async fn resolve_target(ctx: &CoreContext, tokens: &TokenManager, args: &Args) -> Result<String> {
    if let Some(id) = &args.target_id {
        return Ok(id.clone());
    }
    let Some(name) = &args.target_name else {
        bail!("--target-id or --target-name is required with --bastion-id");
    };

    let config = tokens.config();
    let tenancy = config
        .tenancy()
        .context("Profile has no tenancy to search for instances")?;
    let directory = InstanceDirectory::load(ctx.compute_api(tokens), tenancy)
        .await
        .context("Failed to list compute instances")?;
    match directory.resolve(name) {
        Some(instance) => {
            info!("Resolved instance '{}' to {}", name, instance.id);
            Ok(instance.id.clone())
        }
        None => bail!(
            "No running instance named '{}' (found: {})",
            name,
            directory.names().collect::<Vec<_>>().join(", ")
        ),
    }
}
