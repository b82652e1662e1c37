//! Medref Common Library
//!
//! Shared error handling, logging, and fingerprint utilities for the medref
//! workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`MedrefError`] type and [`Result`] alias
//! - **Logging**: centralized `tracing` subscriber setup via [`logging`]
//! - **Fingerprints**: content hashing for record identity via [`fingerprint`]
//!
//! # Example
//!
//! ```no_run
//! use medref_common::logging::{init_logging, LogConfig};
//! use medref_common::Result;
//!
//! fn main() -> Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;

// Re-export commonly used types
pub use error::{MedrefError, Result};
