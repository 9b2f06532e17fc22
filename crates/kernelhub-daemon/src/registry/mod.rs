//! Kernel session registry.
//!
//! Maps opaque instance ids to kernel clients and owns their lifecycle:
//! create (with asynchronous bootstrap), lookup that waits for readiness,
//! and kill.

mod manager;
mod types;

pub use manager::KernelRegistry;
pub use types::{InstanceInfo, InstanceState, KernelHandle, RegistryError};
