//! The built-in `command` kind: a service driven by shell commands.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use super::ServiceModule;
use crate::plugin::manifest::{FactoryDefinition, Removable, ServiceDefinition};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long output is still collected after the command itself exited.
/// Processes it started in the background may hold its pipes open.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Whether a command's stdout is read. Action commands discard it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Stdout,
    Discard,
}

/// Runs `command` to completion on the calling thread, killing it once
/// `timeout` elapses. Called from blocking workers, never from async code.
pub fn run_command(
    command: &str,
    shell: bool,
    timeout: Duration,
    capture: Capture,
) -> Result<CommandOutput> {
    block_on(execute(command, shell, timeout, capture))?
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to start command runtime")?;
            Ok(runtime.block_on(future))
        }
    }
}

async fn execute(
    command: &str,
    shell: bool,
    timeout: Duration,
    capture: Capture,
) -> Result<CommandOutput> {
    let mut cmd = if shell {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    } else {
        let words = shell_words::split(command)
            .with_context(|| format!("Failed to parse command: {command}"))?;
        let Some((program, args)) = words.split_first() else {
            bail!("Empty command");
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    };

    debug!(command = %command, timeout = ?timeout, "Running module command");

    let stdout_mode = match capture {
        Capture::Stdout => Stdio::piped(),
        Capture::Discard => Stdio::null(),
    };

    // kill_on_drop ensures the child is killed when the timeout drops it
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(stdout_mode)
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn `{command}`"))?;

    let run = async {
        let stdout = child.stdout.take().map(PipeReader::spawn);
        let stderr = child.stderr.take().map(PipeReader::spawn);

        let status = child
            .wait()
            .await
            .context("Failed to wait for command")?;

        Ok::<_, anyhow::Error>(CommandOutput {
            code: status.code(),
            stdout: PipeReader::collect(stdout).await,
            stderr: PipeReader::collect(stderr).await,
        })
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(output) => output,
        Err(_) => bail!("`{command}` timed out after {timeout:?}"),
    }
}

/// Drains one pipe on its own task. The task is aborted when dropped.
struct PipeReader(JoinHandle<String>);

impl PipeReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(mut pipe: R) -> Self {
        Self(tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        }))
    }

    async fn collect(reader: Option<Self>) -> String {
        let Some(mut reader) = reader else {
            return String::new();
        };
        match tokio::time::timeout(OUTPUT_GRACE, &mut reader.0).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Service controlled through status/start/stop commands.
#[derive(Debug, Clone)]
pub struct CommandModule {
    id: String,
    name: String,
    icon: Option<String>,
    status: String,
    start: String,
    stop: String,
    restart: Option<String>,
    details: Option<String>,
    remove: Option<String>,
    running_pattern: Option<String>,
    removable: Removable,
    timeout: Duration,
    shell: bool,
}

impl CommandModule {
    pub fn from_definition(definition: &ServiceDefinition) -> Result<Self> {
        if let Some(field) = definition.missing_command_field() {
            bail!("service definition is missing '{field}'");
        }
        // missing_command_field guarantees the required fields are present
        let required = |field: &Option<String>| field.clone().unwrap_or_default();
        let id = required(&definition.id);

        Ok(Self {
            name: definition.name.clone().unwrap_or_else(|| id.clone()),
            id,
            icon: definition.icon.clone(),
            status: required(&definition.status),
            start: required(&definition.start),
            stop: required(&definition.stop),
            restart: definition.restart.clone(),
            details: definition.details.clone(),
            remove: definition.remove.clone(),
            running_pattern: definition.running_pattern.clone(),
            removable: definition.removable,
            timeout: definition
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            shell: definition.shell,
        })
    }

    fn run_checked(&self, command: &str) -> Result<CommandOutput> {
        let output = run_command(command, self.shell, self.timeout, Capture::Discard)?;
        if !output.success() {
            let code = output
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            bail!(
                "`{}` exited with status {}: {}",
                command,
                code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

impl ServiceModule for CommandModule {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_running(&self) -> Result<bool> {
        let output = run_command(&self.status, self.shell, self.timeout, Capture::Stdout)?;
        Ok(match &self.running_pattern {
            Some(pattern) => output.stdout.contains(pattern.as_str()),
            None => output.success(),
        })
    }

    fn start(&self) -> Result<()> {
        self.run_checked(&self.start).map(|_| ())
    }

    fn stop(&self) -> Result<()> {
        self.run_checked(&self.stop).map(|_| ())
    }

    fn details(&self) -> String {
        let Some(command) = &self.details else {
            return String::new();
        };
        match run_command(command, self.shell, self.timeout, Capture::Stdout) {
            Ok(output) if output.success() => output.stdout.trim().to_string(),
            _ => String::new(),
        }
    }

    fn icon(&self) -> Option<String> {
        self.icon.clone()
    }

    fn has_custom_restart(&self) -> bool {
        self.restart.is_some()
    }

    fn restart(&self) -> Result<()> {
        match &self.restart {
            Some(command) => self.run_checked(command).map(|_| ()),
            None => {
                self.stop()?;
                self.start()
            }
        }
    }

    fn can_remove(&self) -> bool {
        match self.removable {
            Removable::Never => false,
            Removable::Always => true,
            Removable::WhenStopped => matches!(self.is_running(), Ok(false)),
        }
    }

    fn remove(&self) -> Result<()> {
        match &self.remove {
            Some(command) => self.run_checked(command).map(|_| ()),
            None => bail!("'{}' has no remove command", self.id),
        }
    }
}

/// Runs a factory's list command and renders its template once per record.
pub fn expand_factory(factory: &FactoryDefinition) -> Result<Vec<ServiceDefinition>> {
    let (Some(list), Some(template)) = (&factory.list, &factory.template) else {
        bail!("factory definition needs both 'list' and 'template'");
    };
    let timeout = factory
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT);

    let output = run_command(list, factory.shell, timeout, Capture::Stdout)?;
    if !output.success() {
        bail!(
            "factory command `{}` failed: {}",
            list,
            output.stderr.trim()
        );
    }

    let records = parse_records(&output.stdout)?;
    Ok(records.iter().map(|record| template.render(record)).collect())
}

/// Accepts a JSON array of objects or one JSON object per line.
fn parse_records(stdout: &str) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let values: Vec<serde_json::Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("Failed to parse factory output as a JSON array")?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse factory output line: {line}"))
            })
            .collect::<Result<_>>()?
    };

    values
        .into_iter()
        .map(|value| match value {
            serde_json::Value::Object(map) => Ok(map),
            other => bail!("factory output entries must be JSON objects, got {other}"),
        })
        .collect()
}
