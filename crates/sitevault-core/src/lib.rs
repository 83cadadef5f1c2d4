//! Shared configuration, identifiers and error types for the SiteVault workspace.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Result, VaultError};
