//! Subprocess runner
//!
//! Every child is spawned with `kill_on_drop`, so a dropped future, an early
//! return or a panic in the caller never leaves an orphaned process behind.
//! Output is drained in background tasks and logged at debug level; the
//! caller only waits for the process to exit.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::DeployError;

/// Lines of stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// How long a failed command waits for its stderr before reporting
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A command to execute
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    /// Written to the child's stdin, then stdin is closed
    pub stdin: Option<SecretString>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            stdin: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: SecretString) -> Self {
        self.stdin = Some(input);
        self
    }

    /// Command line for logs and errors
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Runs external commands
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a command to completion, streaming its output at debug level.
    ///
    /// Returns as soon as the process exits; the output drain finishes in the
    /// background.
    pub async fn run(&self, cmd: &ProcessCommand) -> Result<(), DeployError> {
        self.execute(cmd, false).await.map(|_| ())
    }

    /// Run a command to completion and collect its stdout lines
    pub async fn output(&self, cmd: &ProcessCommand) -> Result<Vec<String>, DeployError> {
        self.execute(cmd, true).await
    }

    /// Spawn a long-running command and read its stdout line by line.
    ///
    /// Dropping the returned stream kills the process. Once stdout closes the
    /// stream reports how the process exited.
    pub fn spawn_lines(&self, cmd: &ProcessCommand) -> Result<LineStream, DeployError> {
        let mut child = self.spawn(cmd)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeployError::subprocess(cmd.display(), "stdout not captured"))?;
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_drain = child.stderr.take().map(|err| {
            drain(err, cmd.display(), stderr_tail.clone(), Retain::Tail(STDERR_TAIL_LINES))
        });
        Ok(LineStream {
            command: cmd.display(),
            child,
            lines: BufReader::new(stdout).lines(),
            stderr_tail,
            stderr_drain,
            finished: false,
        })
    }

    fn spawn(&self, cmd: &ProcessCommand) -> Result<Child, DeployError> {
        debug!("Running: {}", cmd.display());
        cmd.to_command()
            .spawn()
            .map_err(|e| DeployError::subprocess(cmd.display(), format!("failed to spawn: {}", e)))
    }

    async fn execute(
        &self,
        cmd: &ProcessCommand,
        capture: bool,
    ) -> Result<Vec<String>, DeployError> {
        let mut child = self.spawn(cmd)?;
        let display = cmd.display();

        let stdout_lines = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));

        let stdout_drain = child
            .stdout
            .take()
            .map(|out| {
                let retain = if capture { Retain::All } else { Retain::Nothing };
                drain(out, display.clone(), stdout_lines.clone(), retain)
            });
        let stderr_drain = child
            .stderr
            .take()
            .map(|err| {
                drain(err, display.clone(), stderr_tail.clone(), Retain::Tail(STDERR_TAIL_LINES))
            });

        if let (Some(input), Some(mut stdin)) = (&cmd.stdin, child.stdin.take()) {
            stdin
                .write_all(input.expose_secret().as_bytes())
                .await
                .map_err(|e| DeployError::subprocess(&display, format!("failed to write stdin: {}", e)))?;
            drop(stdin);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DeployError::subprocess(&display, format!("failed to wait: {}", e)))?;

        if !status.success() {
            if let Some(handle) = stderr_drain {
                let _ = tokio::time::timeout(DRAIN_GRACE, handle).await;
            }
            let tail = stderr_tail.lock().await;
            return Err(DeployError::subprocess(
                display,
                exit_info(status, tail.iter().map(String::as_str)),
            ));
        }

        if capture {
            if let Some(handle) = stdout_drain {
                let _ = handle.await;
            }
            let lines = stdout_lines.lock().await;
            return Ok(lines.iter().cloned().collect());
        }

        Ok(Vec::new())
    }
}

/// How much of a drained stream to keep
#[derive(Debug, Clone, Copy)]
enum Retain {
    Nothing,
    All,
    Tail(usize),
}

/// Read a child stream line by line in a background task
fn drain<R>(
    reader: R,
    command: String,
    sink: Arc<Mutex<VecDeque<String>>>,
    retain: Retain,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(command = %command, "{}", line);
                    match retain {
                        Retain::Nothing => {}
                        Retain::All => sink.lock().await.push_back(line),
                        Retain::Tail(limit) => {
                            let mut sink = sink.lock().await;
                            sink.push_back(line);
                            if sink.len() > limit {
                                sink.pop_front();
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(command = %command, "stopped reading output: {}", e);
                    break;
                }
            }
        }
    })
}

fn exit_info<'a>(status: ExitStatus, stderr: impl Iterator<Item = &'a str>) -> String {
    let code = match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    };
    let tail = stderr.collect::<Vec<_>>().join("\n");
    if tail.is_empty() {
        code
    } else {
        format!("{}: {}", code, tail)
    }
}

/// Lines of a running process's stdout
pub struct LineStream {
    command: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_drain: Option<JoinHandle<()>>,
    finished: bool,
}

impl LineStream {
    /// Next line, or `None` once the process closed its output and exited
    /// successfully. A non-zero exit is returned as `SubprocessFailure`.
    pub async fn next_line(&mut self) -> Result<Option<String>, DeployError> {
        if self.finished {
            return Ok(None);
        }
        let line = self.lines.next_line().await.map_err(|e| {
            DeployError::subprocess(&self.command, format!("failed to read output: {}", e))
        });
        match line {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => {
                self.finished = true;
                self.exit_status().await.map(|_| None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    async fn exit_status(&mut self) -> Result<(), DeployError> {
        let status = self.child.wait().await.map_err(|e| {
            DeployError::subprocess(&self.command, format!("failed to wait: {}", e))
        })?;
        if status.success() {
            return Ok(());
        }
        if let Some(handle) = self.stderr_drain.take() {
            let _ = tokio::time::timeout(DRAIN_GRACE, handle).await;
        }
        let tail = self.stderr_tail.lock().await;
        Err(DeployError::subprocess(
            &self.command,
            exit_info(status, tail.iter().map(String::as_str)),
        ))
    }
}
