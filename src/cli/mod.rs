//! CLI module for dockyard
//!
//! Subcommands:
//! - `dockyard node add|remove|list|get` - Manage swarm nodes
//! - `dockyard deploy image|archive` - Deploy an app
//! - `dockyard units` - List the units of an app
//! - `dockyard register-unit` - Attach custom data from a build container

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "dockyard")]
#[command(about = "Deploy applications and manage nodes on a Docker swarm")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.dockyard/config)
    #[arg(long, global = true, env = "DOCKYARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before anything else
    #[arg(long, global = true, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage swarm nodes
    #[command(subcommand)]
    Node(NodeCommands),

    /// Deploy an app
    #[command(subcommand)]
    Deploy(DeployCommands),

    /// List the units of an app
    Units(UnitsArgs),

    /// Attach custom data reported from inside a build container
    RegisterUnit(RegisterUnitArgs),
}

#[derive(Subcommand, Debug)]
pub enum NodeCommands {
    /// Add a node; the first one initialises the swarm
    Add(NodeAddArgs),

    /// Remove a node
    Remove(NodeRemoveArgs),

    /// List nodes
    List(NodeListArgs),

    /// Show one node
    Get(NodeGetArgs),
}

/// Arguments for `node add`
#[derive(Args, Debug)]
pub struct NodeAddArgs {
    /// Engine address of the node, e.g. http://10.0.0.5:2375
    pub address: String,

    /// Metadata stored as node labels (key=value, repeatable)
    #[arg(short, long = "meta", value_name = "KEY=VALUE")]
    pub metadata: Vec<String>,
}

/// Arguments for `node remove`
#[derive(Args, Debug)]
pub struct NodeRemoveArgs {
    pub address: String,

    /// Drain the node before removing it
    #[arg(long)]
    pub rebalance: bool,
}

/// Arguments for `node list`
#[derive(Args, Debug)]
pub struct NodeListArgs {
    /// Only show nodes with these addresses (repeatable)
    #[arg(short, long = "address")]
    pub addresses: Vec<String>,
}

/// Arguments for `node get`
#[derive(Args, Debug)]
pub struct NodeGetArgs {
    pub address: String,
}

/// App identity shared by app commands
#[derive(Args, Debug, Clone)]
pub struct AppArgs {
    /// App name
    pub app: String,

    /// Platform the app builds on
    #[arg(short, long, default_value = "static")]
    pub platform: String,

    /// Number of deploys the app went through so far
    #[arg(long, default_value_t = 0)]
    pub deploys: u32,

    /// Rebuild from the platform image
    #[arg(long)]
    pub update_platform: bool,
}

#[derive(Subcommand, Debug)]
pub enum DeployCommands {
    /// Deploy a pre-built image
    Image(DeployImageArgs),

    /// Build a source archive and deploy it
    Archive(DeployArchiveArgs),
}

/// Arguments for `deploy image`
#[derive(Args, Debug)]
pub struct DeployImageArgs {
    #[command(flatten)]
    pub app: AppArgs,

    /// Image to deploy; `:latest` is assumed without a tag
    #[arg(long)]
    pub image: String,
}

/// Arguments for `deploy archive`
#[derive(Args, Debug)]
pub struct DeployArchiveArgs {
    #[command(flatten)]
    pub app: AppArgs,

    /// URL the build container downloads the archive from
    #[arg(long)]
    pub url: String,
}

/// Arguments for `units`
#[derive(Args, Debug)]
pub struct UnitsArgs {
    #[command(flatten)]
    pub app: AppArgs,

    /// Only units of the web process
    #[arg(long)]
    pub routable: bool,
}

/// Arguments for `register-unit`
#[derive(Args, Debug)]
pub struct RegisterUnitArgs {
    /// Container id of the build unit
    pub unit: String,

    /// Custom data as a JSON object
    #[arg(long, conflicts_with = "data_file")]
    pub data: Option<String>,

    /// Read custom data from a JSON file
    #[arg(long, value_name = "FILE")]
    pub data_file: Option<PathBuf>,
}
