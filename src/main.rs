//! pve-ctl - VM template pipeline for Proxmox VE test clusters
//!
//! Builds one golden VM from a cloud image and a setup script, then clones
//! it into one template per cluster node for the test harness to use.
//!
//! ## Usage
//!
//! ```bash
//! # Full pipeline: remove old templates, rebuild, distribute
//! export PROXMOX_USER=root@pam PROXMOX_PW=...
//! pve-ctl
//!
//! # Individual phases
//! pve-ctl remove-all
//! pve-ctl build
//! pve-ctl distribute
//!
//! # Inspect
//! pve-ctl list
//!
//! # Sweep unprotected VMs (add --templates to include templates)
//! pve-ctl remove-unprotected
//! pve-ctl task-log --node elton-pve1 --upid UPID:...
//! ```

use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod cli;
mod config;
mod context;
mod error;
mod provision;
mod pve;
mod remote;
mod utils;

#[cfg(test)]
mod testing;

use cli::{Args, Command, ConfigAction};
use config::{AppConfig, EnvConfig};
use context::Context;
use provision::{OwnershipTag, TemplateBuilder, TemplateDistributor};
use pve::{Node, Pool, ProxmoxClient, Task, Vm};
use remote::{SshConfig, SshRunner};
use utils::logger::{init_logger, LogLevel};
use utils::timer::{Stopwatch, Timer};
use utils::Poller;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();

    let level = args
        .log_level
        .as_deref()
        .or(env.log_level.as_deref())
        .map(str::parse::<LogLevel>)
        .transpose()
        .map_err(anyhow::Error::msg)?
        .unwrap_or_default();
    init_logger(level);

    let command = args.command.unwrap_or(Command::Run);
    let config_path = args.config.as_deref().or(env.config_file.as_deref());

    match command {
        Command::Env => {
            config::print_env_help();
            println!();
            env.print_summary();
        }
        Command::Config(config_args) => {
            manage_config(config_args.action, config_path, &env)?;
        }
        command => {
            let config = load_config(config_path, &env)?;
            let ctx = connect(&config, &env).await?;
            dispatch(command, &ctx, &config).await?;
        }
    }

    Ok(())
}

/// Load the configuration file if one is found, then apply the environment
fn load_config(explicit: Option<&str>, env: &EnvConfig) -> Result<AppConfig> {
    let mut config = match config::find_config(explicit) {
        Some(path) => {
            info!("Using configuration {}", path.display());
            AppConfig::load(&path)?
        }
        None => AppConfig::default(),
    };
    config.apply_env(env);
    config.validate()?;
    Ok(config)
}

/// Authenticate and assemble the shared context
async fn connect(config: &AppConfig, env: &EnvConfig) -> Result<Context> {
    let credentials = env.credentials().context(
        "No Proxmox credentials: set PROXMOX_USER and PROXMOX_PW, \
         or PROXMOX_TOKEN_ID and PROXMOX_TOKEN_SECRET",
    )?;
    let api = ProxmoxClient::connect(&config.proxmox, credentials)
        .await
        .with_context(|| format!("Failed to connect to {}", config.proxmox.host))?;

    let ssh = &config.ssh;
    let mut ssh_config = SshConfig::new(&ssh.username)
        .port(ssh.port)
        .connect_timeout(ssh.connect_timeout_secs);
    if let Some(key) = &ssh.private_key_path {
        ssh_config = ssh_config.private_key(config::expand_path(key));
    }

    let poller = Poller::new(Duration::from_millis(config.poll.interval_ms))
        .jitter(Duration::from_millis(config.poll.jitter_ms))
        .timeout(config.poll.timeout_secs.map(Duration::from_secs));

    Ok(Context::new(
        Arc::new(api),
        Arc::new(SshRunner::new(ssh_config)),
        poller,
    ))
}

async fn dispatch(command: Command, ctx: &Context, config: &AppConfig) -> Result<()> {
    let builder = || TemplateBuilder::from_config(ctx.clone(), config);
    let distributor = || TemplateDistributor::from_config(ctx.clone(), config);

    match command {
        Command::Run => run_pipeline(ctx, config).await?,
        Command::RemoveAll => {
            let timer = Timer::start("remove-all");
            distributor().remove_all().await?;
            timer.stop();
        }
        Command::Remove => builder().remove().await?,
        Command::Build => {
            let timer = Timer::start("build");
            builder().build().await?;
            timer.stop();
        }
        Command::Distribute => {
            let produced = distributor().distribute().await?;
            print_vms("Templates", &produced);
        }
        Command::List { all } => list_vms(ctx, config, all).await?,
        Command::RemoveUnprotected { templates } => remove_unprotected(ctx, templates).await?,
        Command::TaskLog { node, upid } => {
            let task = Task::new(node, upid);
            let log = task.fetch_log(ctx).await?;
            println!("{log}");
            if !task.is_running(ctx).await? && !task.is_ok(ctx).await? {
                warn!("Task {} did not finish OK", task.upid);
            }
        }
        // Answered in main without a connection
        Command::Env | Command::Config(_) => {}
    }
    Ok(())
}

/// remove_all, remove, build, distribute
async fn run_pipeline(ctx: &Context, config: &AppConfig) -> Result<()> {
    let builder = TemplateBuilder::from_config(ctx.clone(), config);
    let distributor = TemplateDistributor::from_config(ctx.clone(), config);
    let mut stopwatch = Stopwatch::new();

    info!(
        "Refreshing templates tagged {} in pool {}",
        distributor.tag(),
        config.cluster.pool
    );

    distributor
        .remove_all()
        .await
        .context("Failed to remove distributed templates")?;
    stopwatch.lap("remove-all");

    builder
        .remove()
        .await
        .with_context(|| format!("Failed to remove {}", builder.output()))?;
    stopwatch.lap("remove");

    builder
        .build()
        .await
        .with_context(|| format!("Failed to build {}", builder.output()))?;
    stopwatch.lap("build");

    let produced = distributor
        .distribute()
        .await
        .context("Failed to distribute the template")?;
    stopwatch.lap("distribute");

    print_vms("Templates", &produced);
    println!();
    println!("Phases:");
    println!("{}", stopwatch.summary());
    Ok(())
}

/// Remove unprotected VMs and wait for every removal task
async fn remove_unprotected(ctx: &Context, templates: bool) -> Result<()> {
    let timer = Timer::start("remove-unprotected");
    let tasks = Vm::remove_unprotected(ctx, !templates).await?;
    let mut failed = 0;
    for task in &tasks {
        if let Err(e) = task.wait(ctx).await {
            warn!("{}", e);
            failed += 1;
        }
    }
    timer.stop();

    println!("Removed {} VM(s)", tasks.len() - failed);
    if failed > 0 {
        anyhow::bail!("{failed} removal task(s) failed");
    }
    Ok(())
}

async fn list_vms(ctx: &Context, config: &AppConfig, all: bool) -> Result<()> {
    let vms: Vec<Vm> = if all {
        Vm::list(ctx).await?
    } else {
        Pool::new(&config.cluster.pool).list(ctx).await?.collect()
    };

    println!("{:<8} {:<16} {:<10} {:<9} {}", "VMID", "NODE", "STATUS", "TEMPLATE", "TAGS");
    println!("{:-<60}", "");
    for vm in vms {
        let vm_config = vm.config(ctx).await?;
        let status = vm.status(ctx).await?;
        let template = if pve::flag(&vm_config, "template") { "yes" } else { "no" };
        let tags: Vec<String> = vm_config
            .get("description")
            .and_then(|d| d.as_str())
            .map(OwnershipTag::find_all)
            .unwrap_or_default()
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "{:<8} {:<16} {:<10} {:<9} {}",
            vm.vmid,
            vm.node,
            status,
            template,
            tags.join(", ")
        );
    }

    let nodes = Node::list(ctx).await?;
    println!();
    println!("{} node(s) in cluster", nodes.len());
    Ok(())
}

fn print_vms(title: &str, vms: &[Vm]) {
    println!("{title}:");
    for vm in vms {
        println!("  {:<6} on {}", vm.vmid, vm.node);
    }
    if vms.is_empty() {
        warn!("No VMs produced");
    }
}

fn manage_config(action: ConfigAction, explicit: Option<&str>, env: &EnvConfig) -> Result<()> {
    match action {
        ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }

            AppConfig::default().save(path)?;
            println!("✓ Configuration file created: {output}");
            println!("\nEdit the file to customize your settings.");
        }

        ConfigAction::Show { format } => {
            let config = load_config(explicit, env)?;
            let output = if format == "json" {
                serde_json::to_string_pretty(&config)?
            } else {
                serde_yaml::to_string(&config)?
            };
            println!("{output}");
        }
    }
    Ok(())
}
