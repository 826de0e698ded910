//! Deployment module

pub mod fsm;
pub mod lifecycle;
pub mod logstream;
pub mod process;
pub mod reconcile;
pub mod runtime;
pub mod shell;
pub mod transaction;
