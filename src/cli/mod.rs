//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};

/// Build the test VM template and distribute it to every Proxmox node
#[derive(Parser, Debug)]
#[command(name = "pve-ctl")]
#[command(version)]
#[command(about = "Build and distribute Proxmox VM templates for cluster tests")]
#[command(long_about = None)]
pub struct Args {
    /// Subcommand; the full pipeline runs when omitted
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Remove old templates, rebuild the golden image and distribute it
    Run,

    /// Remove every VM produced by a previous distribution
    RemoveAll,

    /// Remove the golden image VM
    Remove,

    /// Build the golden image VM
    Build,

    /// Clone the golden image into one template per node
    Distribute,

    /// List VMs in the pool and their ownership tags
    List {
        /// List every VM on the cluster instead
        #[arg(short, long)]
        all: bool,
    },

    /// Remove every unprotected VM on the cluster, keeping templates
    RemoveUnprotected {
        /// Remove unprotected templates as well
        #[arg(short, long)]
        templates: bool,
    },

    /// Print the log of a hypervisor task
    TaskLog {
        /// Node the task ran on
        #[arg(short, long)]
        node: String,

        /// Task UPID
        #[arg(short, long)]
        upid: String,
    },

    /// Manage configuration
    Config(ConfigArgs),

    /// Show recognised environment variables and their values
    Env,
}

/// Arguments for config command
#[derive(Parser, Debug, PartialEq, Eq)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Write the default configuration to a file
    Init {
        /// Output path
        #[arg(short, long, default_value = "./pve-ctl.yaml")]
        output: String,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
