//! Core types, config, and errors for Storyforge.

pub mod config;
pub mod error;
pub mod protocol;
pub mod scenario;
pub mod types;
