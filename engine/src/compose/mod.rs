//! Compose document generation

pub mod builder;
pub mod fragment;
pub mod labels;
pub mod types;
