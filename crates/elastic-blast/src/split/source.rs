use std::collections::VecDeque;
use std::io::{BufRead, Read};
use std::sync::Arc;

use crate::config::locator::Locator;
use crate::storage::{ObjectStorage, StorageResult};

/// Reads several query objects one after another as a single stream.
///
/// A newline is inserted between two objects when the first one does not end
/// with one, so that a header of the next object always starts a new line.
pub struct QueryReader {
    storage: Arc<dyn ObjectStorage>,
    pending: VecDeque<Locator>,
    current: Option<Box<dyn BufRead + Send>>,
    last_byte: Option<u8>,
}

impl QueryReader {
    /// Opens the first query object right away, so that its errors surface early.
    pub fn open(storage: Arc<dyn ObjectStorage>, queries: &[Locator]) -> StorageResult<Self> {
        let mut pending: VecDeque<Locator> = queries.iter().cloned().collect();
        let current = match pending.pop_front() {
            Some(first) => Some(storage.open_read(&first)?),
            None => None,
        };
        Ok(Self {
            storage,
            pending,
            current,
            last_byte: None,
        })
    }
}

impl Read for QueryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.current.as_mut() {
                Some(reader) => {
                    let count = reader.read(buf)?;
                    if count > 0 {
                        self.last_byte = Some(buf[count - 1]);
                        return Ok(count);
                    }
                    self.current = None;
                }
                None => {
                    let Some(next) = self.pending.pop_front() else {
                        return Ok(0);
                    };
                    self.current = Some(
                        self.storage
                            .open_read(&next)
                            .map_err(std::io::Error::other)?,
                    );
                    if self.last_byte.is_some_and(|b| b != b'\n') {
                        buf[0] = b'\n';
                        self.last_byte = Some(b'\n');
                        return Ok(1);
                    }
                }
            }
        }
    }
}
