//! Ephemeral file server.
//!
//! Serves materialized display data over HTTP on a loopback port. Routes map
//! a URL path to a file on disk and expire after a configurable age.

mod routes;
mod server;

pub use routes::{Route, RouteTable, build_router};
pub use server::{FileServer, FileServerError};
