//! In-memory store

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ImageStore, MemberStore, StoreResult, StoreState};
use crate::image::{CustomData, ImageMetadata};

/// Store that keeps everything in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current state
    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn current_image(&self, app: &str) -> StoreResult<Option<String>> {
        Ok(self.state.lock().await.current_image(app))
    }

    async fn next_image_version(&self, app: &str) -> StoreResult<u32> {
        Ok(self.state.lock().await.next_image_version(app))
    }

    async fn append_app_image(&self, app: &str, image: &str) -> StoreResult<()> {
        self.state.lock().await.append_app_image(app, image);
        Ok(())
    }

    async fn app_images(&self, app: &str) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().await.app_images(app))
    }

    async fn save_custom_data(&self, image: &str, data: CustomData) -> StoreResult<()> {
        self.state.lock().await.save_custom_data(image, data);
        Ok(())
    }

    async fn image_metadata(&self, image: &str) -> StoreResult<ImageMetadata> {
        self.state.lock().await.image_metadata(image)
    }
}

#[async_trait]
impl MemberStore for MemoryStore {
    async fn members(&self) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().await.members.clone())
    }

    async fn set_members(&self, addresses: Vec<String>) -> StoreResult<()> {
        self.state.lock().await.members = addresses;
        Ok(())
    }
}
