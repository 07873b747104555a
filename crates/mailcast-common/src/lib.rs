//! Mailcast Common - Shared types and utilities
//!
//! This crate provides common identifiers, configuration, and the error type
//! shared across all Mailcast components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
