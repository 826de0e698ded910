//! Data models

pub mod project;
pub mod service;
