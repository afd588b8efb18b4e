// Host-side plumbing
//
// This module contains the external process runner shared by every operation, plus the
// OS-level helpers (service/firewall control, filesystem, config-file patching).
//
// IMPORTANT:
// - Never log secrets (passwords, PGPASSWORD, postgres URLs with credentials).
// - Each invocation is awaited to completion before the caller continues; stdout and stderr are
//   drained concurrently so a chatty tool can never stall on a full pipe.

pub mod files;
pub mod pg_conf;
pub mod service;

use async_trait::async_trait;
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fmt;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::error::{ProvisionError, Result};
use crate::utils::logging::{mask_connection_url, redact};

/// One external command line: program, arguments, environment overrides.
#[derive(Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    operation: String,
    secrets: Vec<String>,
}

impl CommandSpec {
    /// `operation` is a short label used in logs and errors (e.g. `create_role`).
    pub fn new(program: impl AsRef<OsStr>, operation: &str) -> Self {
        CommandSpec {
            program: program.as_ref().to_string_lossy().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            operation: operation.to_string(),
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((name.into(), value.into()));
        self
    }

    /// Add an override given as `NAME=VALUE`. Entries without `=` are ignored with a warning.
    pub fn env_assignment(self, assignment: &str) -> Self {
        match assignment.split_once('=') {
            Some((name, value)) if !name.is_empty() => self.env(name, value),
            _ => {
                warn!(
                    "[PHASE: cmd] [STEP: env] Ignoring malformed environment override (operation={})",
                    self.operation
                );
                self
            }
        }
    }

    /// Mark a value as secret: it is redacted whenever the command is rendered.
    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let v = value.into();
        if !v.is_empty() {
            self.secrets.push(v);
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Program file name without directory or extension, lower-cased (`psql`, `pg_dump`...).
    pub fn program_name(&self) -> String {
        std::path::Path::new(&self.program)
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Value following `flag` in the argument list (`-d`, `--file`...).
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Shell-like rendering with secrets redacted; env overrides are shown by name only.
    pub fn display_line(&self) -> String {
        let mut parts: Vec<String> = self
            .envs
            .iter()
            .map(|(k, _)| format!("{}=***", k))
            .collect();
        parts.push(quote_for_display(&self.program));
        for a in &self.args {
            parts.push(quote_for_display(&mask_connection_url(a)));
        }
        redact(&parts.join(" "), &self.secrets)
    }

    /// Build the failure for this command from its captured output.
    pub fn failure(&self, out: &CommandOutput) -> ProvisionError {
        ProvisionError::ToolFailure {
            operation: self.operation.clone(),
            command: self.display_line(),
            exit_code: out.exit_code,
            stdout: redact(&out.stdout, &self.secrets),
            stderr: redact(&out.stderr, &self.secrets),
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("operation", &self.operation)
            .field("command", &self.display_line())
            .finish()
    }
}

fn quote_for_display(s: &str) -> String {
    if s.is_empty() || s.contains(char::is_whitespace) {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

/// Captured result of one external invocation. stdout/stderr are trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// True when the tool printed nothing at all (the success signal of pg_dump/pg_restore).
    pub fn is_silent(&self) -> bool {
        self.stdout.trim().is_empty() && self.stderr.trim().is_empty()
    }
}

/// Launches external processes. A non-zero exit is NOT an error at this layer; only a failure to
/// launch/await the process is.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<T> {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        (**self).run(cmd).await
    }
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        (**self).run(cmd).await
    }
}

/// Runs commands on the local host via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    timeout: Option<Duration>,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that outlive `timeout`. Without one, a hung tool hangs the caller.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        SystemCommandRunner { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let started = Instant::now();
        let operation = cmd.operation();

        debug!(
            "[PHASE: cmd] [STEP: {}] run entered (command={}, timeout_ms={:?})",
            operation,
            cmd.display_line(),
            self.timeout.map(|t| t.as_millis())
        );

        let mut command = Command::new(cmd.program());
        command
            .args(cmd.get_args())
            .envs(cmd.get_envs().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ProvisionError::io(
                format!(
                    "Failed to spawn command '{}' (operation={})",
                    cmd.program(),
                    operation
                ),
                e,
            )
        })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            ProvisionError::config(format!("Failed to capture stdout (operation={})", operation))
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            ProvisionError::config(format!("Failed to capture stderr (operation={})", operation))
        })?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await?;
            Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
        });

        let status = match self.timeout {
            None => child.wait().await,
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        "[PHASE: cmd] [STEP: {}] Timeout reached (program={}, timeout_ms={}); killing process",
                        operation,
                        cmd.program(),
                        limit.as_millis()
                    );
                    if let Err(e) = child.kill().await {
                        warn!(
                            "[PHASE: cmd] [STEP: {}] Failed to kill timed-out process: {}",
                            operation, e
                        );
                    }
                    return Err(ProvisionError::Timeout {
                        command: cmd.display_line(),
                        timeout_ms: limit.as_millis(),
                    });
                }
            },
        }
        .map_err(|e| {
            ProvisionError::io(
                format!("Command wait failed (operation={}, program={})", operation, cmd.program()),
                e,
            )
        })?;

        let stdout_str = join_reader(stdout_task, "stdout", operation).await?;
        let stderr_str = join_reader(stderr_task, "stderr", operation).await?;

        let out = CommandOutput {
            exit_code: status.code(),
            stdout: stdout_str.trim().to_string(),
            stderr: stderr_str.trim().to_string(),
            duration_ms: started.elapsed().as_millis(),
        };

        info!(
            "[PHASE: cmd] [STEP: {}] run exit (program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
            operation,
            cmd.program(),
            out.exit_code,
            out.duration_ms,
            out.stdout.len(),
            out.stderr.len()
        );

        Ok(out)
    }
}

async fn join_reader(
    task: tokio::task::JoinHandle<std::io::Result<String>>,
    stream: &str,
    operation: &str,
) -> Result<String> {
    match task.await {
        Ok(Ok(s)) => Ok(s),
        Ok(Err(e)) => Err(ProvisionError::io(
            format!("{} read failed (operation={})", stream, operation),
            e,
        )),
        Err(e) => Err(ProvisionError::io(
            format!("{} join failed (operation={})", stream, operation),
            std::io::Error::other(e.to_string()),
        )),
    }
}
