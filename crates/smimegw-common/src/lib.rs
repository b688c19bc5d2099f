//! smimegw Common - Shared types and configuration
//!
//! This crate provides the configuration model, error type and address
//! type shared by the pipeline engine and the command-line front end.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::EmailAddress;
