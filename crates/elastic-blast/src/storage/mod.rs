mod cli;
mod local;

use std::io::{BufRead, Read};
use std::sync::Arc;

use thiserror::Error;

use crate::common::error::ErrorKind;
use crate::config::locator::{Locator, StorageScheme};

pub use cli::CliStorage;
pub use local::LocalStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("`{program}` is required to access {locator}, but it could not be started: {source}")]
    MissingTool {
        program: &'static str,
        locator: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("Cannot access {locator}: {source}")]
    Io {
        locator: String,
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::MissingTool { .. } => ErrorKind::Dependency,
            StorageError::CommandFailed { .. } => ErrorKind::Cluster,
            StorageError::Io { .. } => ErrorKind::Input,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Blocking access to objects addressed by a [`Locator`].
///
/// Callers on the async runtime go through `spawn_blocking`.
pub trait ObjectStorage: Send + Sync {
    /// Opens a streaming reader. The object is never loaded into memory as a whole.
    fn open_read(&self, locator: &Locator) -> StorageResult<Box<dyn BufRead + Send>>;

    fn write(&self, locator: &Locator, content: &[u8]) -> StorageResult<()>;

    fn read_to_string(&self, locator: &Locator) -> StorageResult<String> {
        let mut reader = self.open_read(locator)?;
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .map_err(|source| StorageError::Io {
                locator: locator.to_string(),
                source,
            })?;
        Ok(content)
    }

    /// Removes everything under `prefix`. Succeeds when nothing is there.
    fn remove_prefix(&self, prefix: &Locator) -> StorageResult<()>;
}

/// Routes each locator to local disk or to the matching provider CLI.
pub struct StorageClient {
    local: LocalStorage,
    cloud: CliStorage,
}

impl StorageClient {
    pub fn new(dry_run: bool) -> Self {
        Self {
            local: LocalStorage,
            cloud: CliStorage::new(dry_run),
        }
    }

    fn route(&self, locator: &Locator) -> &dyn ObjectStorage {
        match locator.scheme() {
            StorageScheme::Local => &self.local,
            StorageScheme::Gcs | StorageScheme::S3 | StorageScheme::AzureBlob => &self.cloud,
        }
    }
}

impl ObjectStorage for StorageClient {
    fn open_read(&self, locator: &Locator) -> StorageResult<Box<dyn BufRead + Send>> {
        self.route(locator).open_read(locator)
    }

    fn write(&self, locator: &Locator, content: &[u8]) -> StorageResult<()> {
        self.route(locator).write(locator, content)
    }

    fn remove_prefix(&self, prefix: &Locator) -> StorageResult<()> {
        self.route(prefix).remove_prefix(prefix)
    }
}

pub fn create_storage(dry_run: bool) -> Arc<dyn ObjectStorage> {
    Arc::new(StorageClient::new(dry_run))
}

/// Runs a blocking storage operation on the blocking thread pool.
pub async fn run_blocking<T, F>(operation: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .unwrap_or_else(|error| {
            Err(StorageError::Io {
                locator: "<background task>".to_string(),
                source: std::io::Error::other(error),
            })
        })
}
