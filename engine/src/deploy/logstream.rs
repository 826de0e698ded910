//! Numbered log lines of one service
//!
//! Lines are numbered from 1 in the order the runtime emits them. Dropping the
//! stream, or the receiver of [`LogStream::into_channel`], ends the underlying
//! `logs -f` process.

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::deploy::runtime::LogSource;
use crate::errors::DeployError;

/// A numbered log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub number: u64,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.text)
    }
}

/// Adapter from a log source to numbered lines
pub struct LogStream {
    source: Box<dyn LogSource>,
    count: u64,
}

impl LogStream {
    pub fn new(source: Box<dyn LogSource>) -> Self {
        Self { source, count: 0 }
    }

    /// Next line, `None` once the source closed
    pub async fn next(&mut self) -> Result<Option<LogLine>, DeployError> {
        match self.source.next_line().await? {
            Some(text) => {
                self.count += 1;
                Ok(Some(LogLine {
                    number: self.count,
                    text,
                }))
            }
            None => Ok(None),
        }
    }

    /// Forward lines into a channel from a background task.
    ///
    /// The task ends when the source closes or as soon as the receiver is
    /// dropped. A read error or a failed `logs` process is delivered as the
    /// last item.
    pub fn into_channel(
        mut self,
        capacity: usize,
    ) -> (mpsc::Receiver<Result<LogLine, DeployError>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Log receiver closed");
                        break;
                    }
                    line = self.next() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Log stream failed after {} lines: {}", self.count, e);
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        (rx, handle)
    }
}
