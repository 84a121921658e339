mod fasta;
mod source;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::BatchId;
use crate::common::error::ErrorKind;
use crate::config::locator::Locator;
use crate::storage::{ObjectStorage, StorageError};

pub use fasta::{FastaReader, FastaRecord};
pub use source::QueryReader;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("The query input contains no sequences")]
    EmptyInput,
    #[error("Malformed query input at line {line}: {reason}")]
    Malformed { line: u64, reason: String },
    #[error("Cannot read query input: {0}")]
    Io(std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Query splitting was interrupted")]
    Interrupted,
}

impl SplitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SplitError::EmptyInput | SplitError::Malformed { .. } | SplitError::Io(_) => {
                ErrorKind::Input
            }
            SplitError::Storage(error) => error.kind(),
            SplitError::Interrupted => ErrorKind::Interrupted,
        }
    }
}

impl From<std::io::Error> for SplitError {
    fn from(error: std::io::Error) -> Self {
        // Storage failures of lazily opened sources travel through `Read` as io errors
        if error
            .get_ref()
            .is_some_and(|inner| inner.is::<StorageError>())
        {
            if let Some(Ok(storage)) = error
                .into_inner()
                .map(|inner| inner.downcast::<StorageError>())
            {
                return SplitError::Storage(*storage);
            }
            return SplitError::Io(std::io::Error::other("query storage failure"));
        }
        SplitError::Io(error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub id: BatchId,
    #[serde(serialize_with = "serialize_locator")]
    pub locator: Locator,
    /// Number of residues
    pub size: u64,
    pub records: usize,
}

fn serialize_locator<S: serde::Serializer>(
    locator: &Locator,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(locator.as_str())
}

/// Ordered description of the staged query batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchManifest {
    batches: Vec<Batch>,
}

impl BatchManifest {
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total number of query residues.
    pub fn total_size(&self) -> u64 {
        self.batches.iter().map(|b| b.size).sum()
    }
}

pub fn batch_file_name(id: BatchId) -> String {
    format!("batch_{id:03}.fa")
}

/// Receives the content of each closed batch.
pub trait BatchSink {
    fn write_batch(&mut self, id: BatchId, content: &[u8]) -> Result<Locator, StorageError>;
}

/// Writes batches as `batch_NNN.fa` objects under a staging prefix.
pub struct StorageSink {
    storage: Arc<dyn ObjectStorage>,
    prefix: Locator,
    written: usize,
}

impl StorageSink {
    pub fn new(storage: Arc<dyn ObjectStorage>, prefix: Locator) -> Self {
        Self {
            storage,
            prefix,
            written: 0,
        }
    }

    /// Number of batches that reached storage, including those of a failed split.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl BatchSink for StorageSink {
    fn write_batch(&mut self, id: BatchId, content: &[u8]) -> Result<Locator, StorageError> {
        let locator = self.prefix.join(&batch_file_name(id));
        self.storage.write(&locator, content)?;
        self.written += 1;
        Ok(locator)
    }
}

struct PendingBatch {
    content: Vec<u8>,
    size: u64,
    records: usize,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            content: vec![],
            size: 0,
            records: 0,
        }
    }
}

fn flush(
    pending: &mut PendingBatch,
    batches: &mut Vec<Batch>,
    sink: &mut dyn BatchSink,
    cancel: &CancellationToken,
) -> Result<(), SplitError> {
    if cancel.is_cancelled() {
        return Err(SplitError::Interrupted);
    }
    let id = batches.len();
    let locator = sink.write_batch(id, &pending.content)?;
    log::debug!(
        "Wrote query batch {id} ({} residues, {} records) to {locator}",
        pending.size,
        pending.records
    );
    batches.push(Batch {
        id,
        locator,
        size: pending.size,
        records: pending.records,
    });
    *pending = PendingBatch::new();
    Ok(())
}

/// Splits FASTA input into batches of at most `target_size` residues.
///
/// Records are never split. A record larger than `target_size` forms a batch
/// of its own. Batch boundaries only depend on the record sizes.
pub fn split<R: std::io::BufRead>(
    reader: R,
    target_size: u64,
    sink: &mut dyn BatchSink,
    cancel: &CancellationToken,
) -> Result<BatchManifest, SplitError> {
    let mut records = FastaReader::new(reader);
    let mut batches = vec![];
    let mut pending = PendingBatch::new();

    while let Some(record) = records.next_record()? {
        if pending.records > 0 && pending.size + record.residues > target_size {
            flush(&mut pending, &mut batches, sink, cancel)?;
        }
        pending.content.extend_from_slice(&record.bytes);
        pending.size += record.residues;
        pending.records += 1;
    }
    if pending.records > 0 {
        flush(&mut pending, &mut batches, sink, cancel)?;
    }

    if batches.is_empty() {
        return Err(SplitError::EmptyInput);
    }
    Ok(BatchManifest { batches })
}
