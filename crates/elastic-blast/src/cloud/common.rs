use std::process::{Output, Stdio};

use bstr::ByteSlice;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::cloud::{CloudError, CloudResult};

/// Runs provider CLI commands. In dry-run mode the commands are only logged.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    dry_run: bool,
}

pub fn create_command(arguments: &[String]) -> Command {
    let mut command = Command::new(&arguments[0]);
    command.args(&arguments[1..]);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    // An abandoned (cancelled) operation must not leave the CLI running
    command.kill_on_drop(true);
    command
}

pub fn check_command_output(command: &str, output: Output) -> CloudResult<Output> {
    let status = output.status;
    if !status.success() {
        let mut stderr = output.stderr.to_str_lossy().trim().to_string();
        if stderr.is_empty() {
            stderr = output.stdout.to_str_lossy().trim().to_string();
        }
        return Err(CloudError::CommandFailed {
            command: command.to_string(),
            code: status.code().unwrap_or(-1),
            stderr,
        });
    }
    Ok(output)
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Runs the command and returns its trimmed stdout.
    pub async fn run(&self, arguments: Vec<String>) -> CloudResult<String> {
        self.execute(arguments, None).await
    }

    /// Runs the command with `input` written to its stdin.
    pub async fn run_with_input(&self, arguments: Vec<String>, input: String) -> CloudResult<String> {
        self.execute(arguments, Some(input)).await
    }

    async fn execute(&self, arguments: Vec<String>, input: Option<String>) -> CloudResult<String> {
        let command_line = arguments.join(" ");
        if self.dry_run {
            log::info!("[dry-run] {command_line}");
            if let Some(input) = input {
                log::debug!("[dry-run] input:\n{input}");
            }
            return Ok(String::new());
        }
        let Some(program) = arguments.first().cloned() else {
            return Err(CloudError::InvalidOutput {
                command: command_line,
                message: "empty command".to_string(),
            });
        };

        log::debug!("Running command `{command_line}`");
        let mut command = create_command(&arguments);
        if input.is_some() {
            command.stdin(Stdio::piped());
        }
        let mut child = command
            .spawn()
            .map_err(|source| CloudError::MissingTool { program, source })?;
        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| CloudError::InvalidOutput {
                    command: command_line.clone(),
                    message: format!("cannot write to stdin: {e}"),
                })?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CloudError::InvalidOutput {
                command: command_line.clone(),
                message: e.to_string(),
            })?;
        let output = check_command_output(&command_line, output)?;
        Ok(output.stdout.to_str_lossy().trim().to_string())
    }
}

pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(|item| item.into()).collect()
}
