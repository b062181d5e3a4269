//! Persistence for image metadata and cluster members
//!
//! - [`ImageStore`]: per-app image versions and history, plus custom data
//!   keyed by image name
//! - [`MemberStore`]: addresses of known swarm managers, used to reach the
//!   cluster without asking the caller for an address
//!
//! Both traits are implemented by [`MemoryStore`] and by the YAML-backed
//! [`FileStore`].

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::{CustomData, ImageMetadata};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in a store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Image '{0}' not found")]
    ImageNotFound(String),

    #[error("Failed to parse state: {0}")]
    ParseError(String),

    #[error("Failed to write state: {0}")]
    WriteError(String),

    #[error("Timed out waiting for state lock {0}")]
    LockTimeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Image metadata persistence
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Latest image deployed for an app, if any
    async fn current_image(&self, app: &str) -> StoreResult<Option<String>>;

    /// Reserve the next image version number for an app
    async fn next_image_version(&self, app: &str) -> StoreResult<u32>;

    /// Append an image to the app's deploy history
    async fn append_app_image(&self, app: &str, image: &str) -> StoreResult<()>;

    /// Deploy history of an app, oldest first
    async fn app_images(&self, app: &str) -> StoreResult<Vec<String>>;

    /// Merge custom data into an image's metadata, creating it if needed
    async fn save_custom_data(&self, image: &str, data: CustomData) -> StoreResult<()>;

    /// Metadata of an image
    async fn image_metadata(&self, image: &str) -> StoreResult<ImageMetadata>;
}

/// Durable cache of known cluster members
#[async_trait]
pub trait MemberStore: Send + Sync {
    async fn members(&self) -> StoreResult<Vec<String>>;

    async fn set_members(&self, addresses: Vec<String>) -> StoreResult<()>;
}

/// Image history of one app
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppImages {
    /// Last reserved version number
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub history: Vec<String>,
}

/// Everything a store holds; shared by the memory and file stores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub members: Vec<String>,

    #[serde(default)]
    pub apps: BTreeMap<String, AppImages>,

    #[serde(default)]
    pub images: BTreeMap<String, ImageMetadata>,
}

impl StoreState {
    pub fn current_image(&self, app: &str) -> Option<String> {
        self.apps.get(app).and_then(|a| a.history.last().cloned())
    }

    pub fn next_image_version(&mut self, app: &str) -> u32 {
        let entry = self.apps.entry(app.to_string()).or_default();
        entry.version += 1;
        entry.version
    }

    pub fn append_app_image(&mut self, app: &str, image: &str) {
        self.apps
            .entry(app.to_string())
            .or_default()
            .history
            .push(image.to_string());
    }

    pub fn app_images(&self, app: &str) -> Vec<String> {
        self.apps
            .get(app)
            .map(|a| a.history.clone())
            .unwrap_or_default()
    }

    pub fn save_custom_data(&mut self, image: &str, data: CustomData) {
        self.images
            .entry(image.to_string())
            .or_insert_with(|| ImageMetadata::new(image))
            .merge(data);
    }

    pub fn image_metadata(&self, image: &str) -> StoreResult<ImageMetadata> {
        self.images
            .get(image)
            .cloned()
            .ok_or_else(|| StoreError::ImageNotFound(image.to_string()))
    }
}
