//! Application wiring

pub mod options;
pub mod projects;
pub mod state;
