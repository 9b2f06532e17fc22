//! Event routing.
//!
//! Each kernel channel queue gets one forwarding task that passes events
//! through the display materializer and hands them to a named consumer
//! target. Events for targets that do not exist are dropped.

mod forward;
mod targets;
mod types;

pub use forward::EventRouter;
pub use targets::TargetRegistry;
pub use types::{Delivery, RoutedEvent, RouterStats};
