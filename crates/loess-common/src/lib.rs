//! Loess common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all loess components.

pub mod block;
pub mod config;
pub mod error;

pub use block::{INVALID_BLOCK, MAX_KEY_SIZE, MAX_VALUE_SIZE, NO_BLOCK, ROOT_BLOCK};
pub use config::StorageConfig;
pub use error::{LoessError, Result};
