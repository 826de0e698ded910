//! Finite state machine of a deployment transaction

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Nothing has happened yet
    Idle,

    /// Containers are down
    Stopped,

    /// Current configuration files are moved to their backup names
    BackedUp,

    /// New compose document written
    Applied,

    /// Images pulled and registries logged out
    Pulled,

    /// Containers started from the new document
    Started,

    /// New state persisted and backups discarded
    Committed,

    /// Backups restored and previous configuration started again
    RolledBack,

    /// Aborted, or rollback could not bring the previous state back
    Failed,
}

impl TransactionState {
    /// Whether the transaction is over
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }

    /// Whether a failure in this state must be rolled back
    pub fn needs_rollback(&self) -> bool {
        matches!(
            self,
            TransactionState::BackedUp
                | TransactionState::Applied
                | TransactionState::Pulled
                | TransactionState::Started
        )
    }
}

/// Transaction event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Containers stopped
    Stop,

    /// Configuration files backed up
    Backup,

    /// Compose document written
    Apply,

    /// Images pulled
    Pull,

    /// Containers started
    Start,

    /// Desired state persisted
    Commit,

    /// A step failed
    Fail(String),

    /// Previous configuration restored and started
    RollbackComplete,

    /// Rollback could not restore a startable state
    RollbackFailed(String),
}

/// Transaction FSM
#[derive(Debug, Clone)]
pub struct TransactionFsm {
    state: TransactionState,
    error: Option<String>,
    history: Vec<TransactionState>,
}

impl TransactionFsm {
    /// Create a new FSM in the idle state
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
            error: None,
            history: vec![TransactionState::Idle],
        }
    }

    /// Get current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Get the first recorded failure, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[TransactionState] {
        &self.history
    }

    /// Process an event and transition state.
    ///
    /// A failure while a backup exists parks the machine in the state it
    /// failed in; the rollback outcome then decides the terminal state.
    pub fn process(&mut self, event: TransactionEvent) -> Result<TransactionState, DeployError> {
        use TransactionEvent as E;
        use TransactionState as S;

        let next = match (self.state, &event) {
            (S::Idle, E::Stop) => S::Stopped,
            (S::Stopped, E::Backup) => S::BackedUp,
            (S::BackedUp, E::Apply) => S::Applied,
            (S::Applied, E::Pull) => S::Pulled,
            (S::Pulled, E::Start) => S::Started,
            (S::Started, E::Commit) => S::Committed,

            // Nothing to restore yet
            (S::Idle | S::Stopped, E::Fail(err)) => {
                self.error.get_or_insert_with(|| err.clone());
                S::Failed
            }

            (state, E::Fail(err)) if state.needs_rollback() => {
                self.error.get_or_insert_with(|| err.clone());
                return Ok(self.state);
            }
            (state, E::RollbackComplete) if state.needs_rollback() && self.error.is_some() => {
                S::RolledBack
            }
            (state, E::RollbackFailed(err)) if state.needs_rollback() && self.error.is_some() => {
                self.error.get_or_insert_with(|| err.clone());
                S::Failed
            }

            (state, event) => {
                return Err(DeployError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = next;
        self.history.push(next);
        Ok(next)
    }
}

impl Default for TransactionFsm {
    fn default() -> Self {
        Self::new()
    }
}
