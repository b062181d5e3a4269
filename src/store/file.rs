//! YAML file store
//!
//! The whole state is one YAML document. Every mutation rewrites the file
//! through a temporary sibling and a rename, so a crash never leaves a
//! half-written state behind.
//!
//! Several processes may share one state file. Reads always go to the file,
//! and each mutation holds an exclusive `flock` on `<state>.lock` across its
//! load, apply and write.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ImageStore, MemberStore, StoreError, StoreResult, StoreState};
use crate::image::{CustomData, ImageMetadata};

/// How long a mutation waits for another writer to release the state lock
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Store persisted to a YAML file
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    /// Serializes mutations made through this handle
    writer: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        load_state(&path)?;
        debug!("Opened state file {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("yaml.lock")
    }

    /// Current state as found on disk
    fn read(&self) -> StoreResult<StoreState> {
        load_state(&self.path)
    }

    /// Apply a mutation to the state on disk and persist the result
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> StoreResult<T> {
        let _writer = self.writer.lock().await;
        let _lock = acquire_lock(&self.lock_path(), LOCK_TIMEOUT).await?;
        let mut state = load_state(&self.path)?;
        let out = f(&mut state);
        save_state(&self.path, &state).await?;
        Ok(out)
    }
}

// ============================================================================
// State file lock
// ============================================================================

/// Exclusive lock on the state's lock file, released on drop
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

async fn acquire_lock(lock_path: &Path, timeout: Duration) -> StoreResult<LockGuard> {
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?;

    let deadline = Instant::now() + timeout;
    loop {
        if try_lock(&file)? {
            return Ok(LockGuard { file });
        }
        if Instant::now() >= deadline {
            return Err(StoreError::LockTimeout(lock_path.display().to_string()));
        }
        tokio::time::sleep(LOCK_RETRY).await;
    }
}

/// Take the lock without blocking; `false` while another holder has it
#[cfg(unix)]
fn try_lock(file: &File) -> StoreResult<bool> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> StoreResult<bool> {
    Ok(true)
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

// ============================================================================
// I/O boundary: state file
// ============================================================================

fn load_state(path: &Path) -> StoreResult<StoreState> {
    if !path.exists() {
        return Ok(StoreState::default());
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(StoreState::default());
    }
    serde_yaml::from_str(&content).map_err(|e| StoreError::ParseError(e.to_string()))
}

async fn save_state(path: &Path, state: &StoreState) -> StoreResult<()> {
    let content =
        serde_yaml::to_string(state).map_err(|e| StoreError::WriteError(e.to_string()))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ImageStore for FileStore {
    async fn current_image(&self, app: &str) -> StoreResult<Option<String>> {
        Ok(self.read()?.current_image(app))
    }

    async fn next_image_version(&self, app: &str) -> StoreResult<u32> {
        self.mutate(|s| s.next_image_version(app)).await
    }

    async fn append_app_image(&self, app: &str, image: &str) -> StoreResult<()> {
        self.mutate(|s| s.append_app_image(app, image)).await
    }

    async fn app_images(&self, app: &str) -> StoreResult<Vec<String>> {
        Ok(self.read()?.app_images(app))
    }

    async fn save_custom_data(&self, image: &str, data: CustomData) -> StoreResult<()> {
        self.mutate(|s| s.save_custom_data(image, data)).await
    }

    async fn image_metadata(&self, image: &str) -> StoreResult<ImageMetadata> {
        self.read()?.image_metadata(image)
    }
}

#[async_trait]
impl MemberStore for FileStore {
    async fn members(&self) -> StoreResult<Vec<String>> {
        Ok(self.read()?.members)
    }

    async fn set_members(&self, addresses: Vec<String>) -> StoreResult<()> {
        self.mutate(|s| s.members = addresses).await
    }
}
