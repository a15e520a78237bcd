//! Mailflow Common - shared types, configuration and errors
//!
//! This crate provides the types shared by every Mailflow component:
//! the error taxonomy, the TOML configuration schema (including the
//! pipeline stage declarations), and basic mail addressing types.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
