//! Interactive shell inside a service container
//!
//! `compose exec` runs in a pseudo-terminal. Keystrokes go in and terminal
//! output comes out as byte chunks over channels; moving those bytes to and
//! from a user is left to the caller.

use std::fmt;
use std::io::{Read, Write};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deploy::process::ProcessCommand;
use crate::errors::DeployError;

/// Shell started in the container
pub const SHELL: &str = "/bin/sh";

/// Chunks buffered per direction
const CHANNEL_CAPACITY: usize = 64;

/// Sent to the terminal when the input side closes, ending the shell
const END_OF_TRANSMISSION: u8 = 0x04;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// A running shell session
#[derive(Debug)]
pub struct ShellSession {
    input: mpsc::Sender<Vec<u8>>,
    output: mpsc::Receiver<Vec<u8>>,
    exit: JoinHandle<Result<(), DeployError>>,
}

impl ShellSession {
    /// `exit` resolves once the shell process is gone
    pub fn new(
        input: mpsc::Sender<Vec<u8>>,
        output: mpsc::Receiver<Vec<u8>>,
        exit: JoinHandle<Result<(), DeployError>>,
    ) -> Self {
        Self {
            input,
            output,
            exit,
        }
    }

    /// Send input to the shell
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), DeployError> {
        self.input
            .send(data.into())
            .await
            .map_err(|_| DeployError::Internal("shell session is closed".to_string()))
    }

    /// Next chunk of output, `None` once the shell exited
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    /// Split into input sender, output receiver and exit handle so both
    /// directions can be pumped independently
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<Vec<u8>>,
        mpsc::Receiver<Vec<u8>>,
        JoinHandle<Result<(), DeployError>>,
    ) {
        (self.input, self.output, self.exit)
    }

    /// Close the input and wait for the shell to exit, discarding any
    /// remaining output
    pub async fn close(self) -> Result<(), DeployError> {
        let (input, mut output, exit) = self.into_parts();
        drop(input);
        while output.recv().await.is_some() {}
        exit.await
            .map_err(|e| DeployError::Internal(format!("shell task failed: {}", e)))?
    }
}

/// Run `cmd` inside a new pseudo-terminal
pub fn spawn_pty(cmd: &ProcessCommand, size: TerminalSize) -> Result<ShellSession, DeployError> {
    let command_line = cmd.display();

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| pty_error(&command_line, "openpty", e))?;

    let mut builder = CommandBuilder::new(&cmd.program);
    builder.args(&cmd.args);
    if let Some(dir) = &cmd.dir {
        builder.cwd(dir);
    }
    builder.env("TERM", "xterm-256color");

    debug!("Running in a terminal: {}", command_line);
    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| pty_error(&command_line, "spawn", e))?;
    // Only the child may hold the slave, so the reader sees the end of output
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| pty_error(&command_line, "clone reader", e))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| pty_error(&command_line, "take writer", e))?;
    let master = pair.master;

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                warn!("Unable to write to terminal: {}", e);
                return;
            }
        }
        if let Err(e) = writer.write_all(&[END_OF_TRANSMISSION]) {
            debug!("Terminal already closed: {}", e);
        }
    });

    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO once the child closed its side of the terminal
                    debug!("Terminal output ended: {}", e);
                    break;
                }
            }
        }
    });

    let exit = tokio::task::spawn_blocking(move || {
        let status = child.wait();
        drop(master);
        match status {
            Ok(status) if status.success() => {
                info!("Shell `{}` exited", command_line);
                Ok(())
            }
            Ok(status) => Err(DeployError::subprocess(
                command_line,
                format!("exit code {}", status.exit_code()),
            )),
            Err(e) => Err(DeployError::subprocess(command_line, format!("failed to wait: {}", e))),
        }
    });

    Ok(ShellSession::new(input_tx, output_rx, exit))
}

fn pty_error(command: &str, what: &str, err: impl fmt::Display) -> DeployError {
    DeployError::subprocess(command, format!("{} failed: {}", what, err))
}
