//! `kernelhub` Core Library
//!
//! Shared functionality for `kernelhub` components:
//! - NDJSON protocol spoken with kernel processes
//! - Kernel options and their validation
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod options;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result, ValidationError};
pub use options::KernelOptions;
