//! Dockyard Library
//!
//! Compose-based deployment engine: renders a project's services into a
//! compose document with reverse proxy labels, redeploys it transactionally
//! with rollback, and reconciles services dropped from the desired state.

pub mod app;
pub mod compose;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod store;
pub mod utils;
