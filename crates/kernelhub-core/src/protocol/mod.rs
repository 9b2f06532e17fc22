//! NDJSON protocol spoken with kernel processes.
//!
//! Each line on a kernel's stdout is one `KernelFrame`; each line the host
//! writes to its stdin is one `HostFrame`.

mod parser;
mod types;

pub use parser::{encode, parse_line, parse_value};
pub use types::*;
