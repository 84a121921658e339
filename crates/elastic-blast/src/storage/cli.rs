use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

use bstr::ByteSlice;

use crate::config::locator::{Locator, StorageScheme};
use crate::storage::{ObjectStorage, StorageError, StorageResult};

/// Messages printed by the storage CLIs when a prefix does not exist.
const NOT_FOUND_MARKERS: [&str; 3] = ["No URLs matched", "BlobNotFound", "does not exist"];

#[derive(Clone, Copy)]
enum Operation {
    Read,
    Write,
    Remove,
}

/// Objects in cloud buckets, accessed through `gsutil`, `aws s3` and `azcopy`.
pub struct CliStorage {
    dry_run: bool,
}

fn build_command(operation: Operation, locator: &Locator) -> StorageResult<(&'static str, Vec<String>)> {
    let uri = locator.as_str();
    let (program, args): (&'static str, Vec<&str>) = match (locator.scheme(), operation) {
        (StorageScheme::Gcs, Operation::Read) => ("gsutil", vec!["cat", uri]),
        (StorageScheme::Gcs, Operation::Write) => ("gsutil", vec!["-q", "cp", "-", uri]),
        (StorageScheme::Gcs, Operation::Remove) => ("gsutil", vec!["-m", "-q", "rm", "-r", uri]),
        (StorageScheme::S3, Operation::Read) => {
            ("aws", vec!["s3", "cp", uri, "-", "--only-show-errors"])
        }
        (StorageScheme::S3, Operation::Write) => {
            ("aws", vec!["s3", "cp", "-", uri, "--only-show-errors"])
        }
        (StorageScheme::S3, Operation::Remove) => (
            "aws",
            vec!["s3", "rm", uri, "--recursive", "--only-show-errors"],
        ),
        (StorageScheme::AzureBlob, Operation::Read) => {
            ("azcopy", vec!["cp", uri, "--from-to", "BlobPipe"])
        }
        (StorageScheme::AzureBlob, Operation::Write) => {
            ("azcopy", vec!["cp", uri, "--from-to", "PipeBlob"])
        }
        (StorageScheme::AzureBlob, Operation::Remove) => {
            ("azcopy", vec!["rm", uri, "--recursive=true"])
        }
        (StorageScheme::Local, _) => {
            return Err(StorageError::Io {
                locator: uri.to_string(),
                source: std::io::Error::new(
                    ErrorKind::Unsupported,
                    "local paths are not handled by cloud storage",
                ),
            });
        }
    };
    Ok((program, args.into_iter().map(|a| a.to_string()).collect()))
}

fn format_command(program: &str, args: &[String]) -> String {
    format!("{program} {}", args.join(" "))
}

fn spawn(
    program: &'static str,
    args: &[String],
    locator: &Locator,
    stdin: Stdio,
    stdout: Stdio,
) -> StorageResult<Child> {
    log::debug!("Running command `{}`", format_command(program, args));
    Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| match source.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => StorageError::MissingTool {
                program,
                locator: locator.to_string(),
                source,
            },
            _ => StorageError::Io {
                locator: locator.to_string(),
                source,
            },
        })
}

/// Stdout of a running download. The exit status is checked at the end of the stream.
struct ChildReader {
    child: Child,
    stdout: ChildStdout,
    command: String,
    finished: bool,
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let count = self.stdout.read(buf)?;
        if count == 0 && !buf.is_empty() {
            self.finished = true;
            let (status, stderr) = wait_with_stderr(&mut self.child)?;
            if !status.success() {
                return Err(std::io::Error::other(format!(
                    "`{}` failed: {}",
                    self.command,
                    stderr.to_str_lossy().trim()
                )));
            }
        }
        Ok(count)
    }
}

fn wait_with_stderr(child: &mut Child) -> std::io::Result<(ExitStatus, Vec<u8>)> {
    let mut stderr = vec![];
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_end(&mut stderr)?;
    }
    Ok((child.wait()?, stderr))
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl CliStorage {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl ObjectStorage for CliStorage {
    fn open_read(&self, locator: &Locator) -> StorageResult<Box<dyn BufRead + Send>> {
        let (program, args) = build_command(Operation::Read, locator)?;
        let mut child = spawn(program, &args, locator, Stdio::null(), Stdio::piped())?;
        let stdout = child.stdout.take().ok_or_else(|| StorageError::Io {
            locator: locator.to_string(),
            source: std::io::Error::other("stdout was not captured"),
        })?;
        Ok(Box::new(BufReader::new(ChildReader {
            child,
            stdout,
            command: format_command(program, &args),
            finished: false,
        })))
    }

    fn write(&self, locator: &Locator, content: &[u8]) -> StorageResult<()> {
        let (program, args) = build_command(Operation::Write, locator)?;
        if self.dry_run {
            log::info!(
                "[dry-run] {} ({} bytes)",
                format_command(program, &args),
                content.len()
            );
            return Ok(());
        }
        let mut child = spawn(program, &args, locator, Stdio::piped(), Stdio::null())?;
        let io_error = |source| StorageError::Io {
            locator: locator.to_string(),
            source,
        };
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content).map_err(io_error)?;
        }
        let (status, stderr) = wait_with_stderr(&mut child).map_err(io_error)?;
        if !status.success() {
            return Err(StorageError::CommandFailed {
                command: format_command(program, &args),
                stderr: stderr.to_str_lossy().trim().to_string(),
            });
        }
        Ok(())
    }

    fn remove_prefix(&self, prefix: &Locator) -> StorageResult<()> {
        let (program, args) = build_command(Operation::Remove, prefix)?;
        if self.dry_run {
            log::info!("[dry-run] {}", format_command(program, &args));
            return Ok(());
        }
        let child = spawn(program, &args, prefix, Stdio::null(), Stdio::null())?;
        let output = child.wait_with_output().map_err(|source| StorageError::Io {
            locator: prefix.to_string(),
            source,
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = output.stderr.to_str_lossy();
        if NOT_FOUND_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            log::debug!("{prefix} was already removed");
            return Ok(());
        }
        Err(StorageError::CommandFailed {
            command: format_command(program, &args),
            stderr: stderr.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Operation, build_command};
    use crate::config::locator::Locator;

    #[test]
    fn test_commands_per_scheme() {
        let gs: Locator = "gs://bucket/run/query_batches".parse().unwrap();
        let (program, args) = build_command(Operation::Remove, &gs).unwrap();
        assert_eq!(program, "gsutil");
        assert_eq!(args, vec!["-m", "-q", "rm", "-r", "gs://bucket/run/query_batches"]);

        let s3: Locator = "s3://bucket/batch_000.fa".parse().unwrap();
        let (program, args) = build_command(Operation::Write, &s3).unwrap();
        assert_eq!(program, "aws");
        assert_eq!(&args[..4], &["s3", "cp", "-", "s3://bucket/batch_000.fa"]);

        let azure: Locator = "https://acct.blob.core.windows.net/c/q.fa".parse().unwrap();
        let (program, args) = build_command(Operation::Read, &azure).unwrap();
        assert_eq!(program, "azcopy");
        assert_eq!(args[3], "BlobPipe");
    }

    #[test]
    fn test_local_locator_rejected() {
        let local: Locator = "/tmp/x".parse().unwrap();
        assert!(build_command(Operation::Read, &local).is_err());
    }
}
