//! Image naming and metadata
//!
//! Every deploy produces a new, versioned app image. The metadata kept for an
//! image is free-form "custom data" (a JSON object) from which the process
//! table and the exposed port are read.

pub mod procfile;

pub use procfile::{
    command_from_entrypoint, parse_procfile, processes_from_entrypoint, web_process_name,
    WEB_PROCESS,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::SwarmConfig;
use crate::provision::App;

/// Free-form metadata attached to an image
pub type CustomData = Map<String, Value>;

/// Custom data key holding the resolved process table
pub const KEY_PROCESSES: &str = "processes";

/// Custom data key holding raw Procfile text
pub const KEY_PROCFILE: &str = "procfile";

/// Custom data key holding the exposed port, e.g. `8080/tcp`
pub const KEY_EXPOSED_PORT: &str = "exposedPort";

/// Deploys between forced rebuilds from the platform image
const PLATFORM_REBUILD_EVERY: u32 = 10;

/// Metadata record of one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub name: String,

    #[serde(default)]
    pub custom_data: CustomData,
}

impl ImageMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            custom_data: CustomData::new(),
        }
    }

    /// Record a process table and optional exposed port
    pub fn with_processes(
        mut self,
        processes: &BTreeMap<String, String>,
        exposed_port: Option<&str>,
    ) -> Self {
        let table: Map<String, Value> = processes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self.custom_data
            .insert(KEY_PROCESSES.to_string(), Value::Object(table));
        if let Some(port) = exposed_port {
            self.custom_data
                .insert(KEY_EXPOSED_PORT.to_string(), Value::String(port.to_string()));
        }
        self
    }

    /// Merge custom data, later keys overwrite earlier ones
    pub fn merge(&mut self, data: CustomData) {
        for (k, v) in data {
            self.custom_data.insert(k, v);
        }
    }

    /// Process table: the `processes` object, else the parsed `procfile` text
    pub fn processes(&self) -> BTreeMap<String, String> {
        if let Some(Value::Object(table)) = self.custom_data.get(KEY_PROCESSES) {
            return table
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|cmd| (k.clone(), cmd.to_string())))
                .collect();
        }
        if let Some(Value::String(content)) = self.custom_data.get(KEY_PROCFILE) {
            return parse_procfile(content);
        }
        BTreeMap::new()
    }

    pub fn exposed_port(&self) -> Option<&str> {
        self.custom_data
            .get(KEY_EXPOSED_PORT)
            .and_then(|v| v.as_str())
    }

    /// Container port number from the exposed port (`8080/tcp` -> 8080)
    pub fn container_port(&self) -> Option<u16> {
        self.exposed_port()
            .and_then(|p| p.split('/').next())
            .and_then(|p| p.parse().ok())
    }

    /// Process that receives external traffic
    pub fn web_process_name(&self) -> String {
        web_process_name(&self.processes())
    }
}

// ============================================================================
// SBIO: Pure naming logic (no I/O)
// ============================================================================

fn repository_prefix(config: &SwarmConfig) -> String {
    match &config.registry {
        Some(registry) if !registry.is_empty() => {
            format!("{}/{}", registry.trim_end_matches('/'), config.namespace)
        }
        _ => config.namespace.clone(),
    }
}

/// Image a platform's builds start from, e.g. `registry:5000/dockyard/python`
pub fn platform_image(config: &SwarmConfig, platform: &str) -> String {
    format!("{}/{}", repository_prefix(config), platform)
}

/// Repository of an app's images, e.g. `registry:5000/dockyard/app-myapp`
pub fn app_repository(config: &SwarmConfig, app: &str) -> String {
    format!("{}/app-{}", repository_prefix(config), app)
}

/// Versioned app image name, e.g. `dockyard/app-myapp:v3`
pub fn app_image_name(config: &SwarmConfig, app: &str, version: u32) -> String {
    format!("{}:v{}", app_repository(config, app), version)
}

/// Image a build for `app` runs in
///
/// Builds reuse the app's current image to keep installed dependencies, but
/// start over from the platform image on request and every tenth deploy.
pub fn build_image(config: &SwarmConfig, app: &App, current_image: Option<&str>) -> String {
    let rebuild = app.update_platform
        || (app.deploys != 0 && app.deploys % PLATFORM_REBUILD_EVERY == 0);
    match current_image {
        Some(image) if !rebuild && !image.is_empty() => image.to_string(),
        _ => platform_image(config, &app.platform),
    }
}

/// Add the `latest` tag to an untagged image reference
pub fn with_default_tag(image: &str) -> String {
    if split_image_name(image).1.is_empty() {
        format!("{}:latest", image)
    } else {
        image.to_string()
    }
}

/// Split `repo:tag`; the tag is empty when absent
///
/// A colon inside the registry host (`host:5000/repo`) is not a tag separator.
pub fn split_image_name(image: &str) -> (String, String) {
    match image.rfind(':') {
        Some(idx) if !image[idx + 1..].contains('/') => {
            (image[..idx].to_string(), image[idx + 1..].to_string())
        }
        _ => (image.to_string(), String::new()),
    }
}

/// Command run inside the build container for an archive deploy
pub fn archive_deploy_cmds(config: &SwarmConfig, archive_url: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-lc".to_string(),
        format!(
            "{} archive {}",
            config.deploy_cmd,
            shell_quote(archive_url)
        ),
    ]
}

/// Command that prints the first Procfile found in an image, or nothing
pub fn read_procfile_cmds() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "cat /home/application/current/Procfile 2>/dev/null || cat /app/user/Procfile 2>/dev/null || cat /Procfile 2>/dev/null || true"
            .to_string(),
    ]
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
