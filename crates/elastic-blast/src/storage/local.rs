use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::PathBuf;

use crate::config::locator::Locator;
use crate::storage::{ObjectStorage, StorageError, StorageResult};

/// Objects stored as files on the local filesystem.
pub struct LocalStorage;

fn local_path(locator: &Locator) -> PathBuf {
    locator
        .local_path()
        .unwrap_or_else(|| PathBuf::from(locator.as_str()))
}

fn io_error(locator: &Locator, source: std::io::Error) -> StorageError {
    StorageError::Io {
        locator: locator.to_string(),
        source,
    }
}

impl ObjectStorage for LocalStorage {
    fn open_read(&self, locator: &Locator) -> StorageResult<Box<dyn BufRead + Send>> {
        let file = File::open(local_path(locator)).map_err(|e| io_error(locator, e))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn write(&self, locator: &Locator, content: &[u8]) -> StorageResult<()> {
        let path = local_path(locator);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(locator, e))?;
        }
        std::fs::write(&path, content).map_err(|e| io_error(locator, e))
    }

    fn remove_prefix(&self, prefix: &Locator) -> StorageResult<()> {
        let path = local_path(prefix);
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Err(error) if error.kind() != ErrorKind::NotFound => Err(io_error(prefix, error)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LocalStorage;
    use crate::config::locator::Locator;
    use crate::storage::ObjectStorage;

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::TempDir::with_prefix("elb").unwrap();
        let root: Locator = dir.path().to_str().unwrap().parse().unwrap();
        let object = root.join("run/metadata/num_jobs");

        LocalStorage.write(&object, b"3").unwrap();
        assert_eq!(LocalStorage.read_to_string(&object).unwrap(), "3");

        LocalStorage.remove_prefix(&root.join("run")).unwrap();
        assert!(LocalStorage.open_read(&object).is_err());
        // Removing a missing prefix is not an error
        LocalStorage.remove_prefix(&root.join("run")).unwrap();
    }
}
