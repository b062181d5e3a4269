//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return their output as text, printing is left to
//! the caller. Deploy progress is streamed to the events sink as it happens.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use super::display::{format_node_detail, format_node_list, format_unit_list};
use super::{AppArgs, Commands, DeployCommands, NodeCommands, RegisterUnitArgs};
use crate::cluster::{ClusterError, DockerConnector, LogSink};
use crate::config::{Config, ConfigError};
use crate::image::CustomData;
use crate::provision::{
    AddNodeOptions, App, ProvisionError, Provisioner, ProvisionerContext, ProvisionerRegistry,
    RemoveNodeOptions,
};
use crate::store::{FileStore, StoreError};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    Store(#[from] StoreError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Invalid metadata '{0}': expected key=value")]
    InvalidMetadata(String),

    #[error("Invalid custom data: {0}")]
    InvalidCustomData(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Argument conversion (Pure business logic)
// ============================================================================

/// Parse repeated `key=value` arguments
pub fn parse_metadata(pairs: &[String]) -> CommandResult<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                metadata.insert(key.trim().to_string(), value.to_string());
            }
            _ => return Err(CommandError::InvalidMetadata(pair.clone())),
        }
    }
    Ok(metadata)
}

/// Parse custom data, which must be a JSON object
pub fn parse_custom_data(json: &str) -> CommandResult<CustomData> {
    match serde_json::from_str::<serde_json::Value>(json)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CommandError::InvalidCustomData(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

impl From<&AppArgs> for App {
    fn from(args: &AppArgs) -> Self {
        App::new(args.app.clone(), args.platform.clone())
            .with_deploys(args.deploys)
            .with_update_platform(args.update_platform)
    }
}

fn custom_data_from_args(args: &RegisterUnitArgs) -> CommandResult<Option<CustomData>> {
    if let Some(json) = &args.data {
        return parse_custom_data(json).map(Some);
    }
    if let Some(path) = &args.data_file {
        let content = std::fs::read_to_string(path)?;
        return parse_custom_data(&content).map(Some);
    }
    Ok(None)
}

// ============================================================================
// Wiring
// ============================================================================

/// Construct the configured provisioner over the Docker Engine API and the
/// state file
pub fn build_provisioner(config: &Config) -> CommandResult<Arc<dyn Provisioner>> {
    let store = Arc::new(FileStore::open(config.state_path())?);
    let connector = Arc::new(DockerConnector::from_config(&config.swarm)?);
    let context = ProvisionerContext {
        config: Arc::new(config.swarm.clone()),
        connector,
        images: store.clone(),
        members: store,
    };
    let registry = ProvisionerRegistry::new();
    Ok(registry.build(&config.provisioner, context)?)
}

/// Load config from `path` or the default location
pub fn load_cli_config(path: Option<&Path>) -> CommandResult<Config> {
    let config = match path {
        Some(path) => crate::config::load_config_from(path)?,
        None => crate::config::load_config()?,
    };
    Ok(config)
}

// ============================================================================
// Execution
// ============================================================================

/// Run one command against a provisioner; returns what should be printed
pub async fn execute(
    provisioner: &dyn Provisioner,
    command: &Commands,
    events: LogSink<'_>,
) -> CommandResult<String> {
    match command {
        Commands::Node(NodeCommands::Add(args)) => {
            let opts = AddNodeOptions {
                address: args.address.clone(),
                metadata: parse_metadata(&args.metadata)?,
            };
            provisioner.add_node(&opts).await?;
            Ok(format!("Node {} added\n", args.address))
        }
        Commands::Node(NodeCommands::Remove(args)) => {
            let opts = RemoveNodeOptions {
                address: args.address.clone(),
                rebalance: args.rebalance,
            };
            provisioner.remove_node(&opts).await?;
            Ok(format!("Node {} removed\n", args.address))
        }
        Commands::Node(NodeCommands::List(args)) => {
            let nodes = provisioner.list_nodes(&args.addresses).await?;
            Ok(format_node_list(&nodes))
        }
        Commands::Node(NodeCommands::Get(args)) => {
            let node = provisioner.get_node(&args.address).await?;
            Ok(format_node_detail(&node))
        }
        Commands::Deploy(DeployCommands::Image(args)) => {
            let app = App::from(&args.app);
            let image = provisioner.image_deploy(&app, &args.image, events).await?;
            Ok(format!("Deployed {} as {}\n", app.name, image))
        }
        Commands::Deploy(DeployCommands::Archive(args)) => {
            let app = App::from(&args.app);
            let image = provisioner.archive_deploy(&app, &args.url, events).await?;
            Ok(format!("Deployed {} as {}\n", app.name, image))
        }
        Commands::Units(args) => {
            let app = App::from(&args.app);
            let units = if args.routable {
                provisioner.routable_units(&app).await?
            } else {
                provisioner.units(&app).await?
            };
            Ok(format_unit_list(&units))
        }
        Commands::RegisterUnit(args) => {
            let data = custom_data_from_args(args)?;
            provisioner.register_unit(&args.unit, data).await?;
            Ok(format!("Unit {} registered\n", args.unit))
        }
    }
}
