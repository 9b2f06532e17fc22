//! kernelhub Daemon Library
//!
//! Core functionality for the kernelhub host:
//! - Kernel client adapter and process launcher
//! - Kernel session registry and single-instance session
//! - Event routing to named consumer targets
//! - Display-data materialization and the ephemeral file server
//! - The line console driven by the `kernelhub` binary

pub mod display;
pub mod facts;
pub mod files;
pub mod guard;
pub mod host;
pub mod kernel;
pub mod registry;
pub mod router;
