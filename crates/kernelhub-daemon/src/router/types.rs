//! Event router types.

use serde::Serialize;
use serde_json::Value;

use kernelhub_core::protocol::Channel;

/// An event on its way to a consumer target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedEvent {
    /// Kernel instance the event came from.
    pub instance_id: String,
    pub channel: Channel,
    pub payload: Value,
}

/// Outcome of handing an event to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No such target, or its receiver was dropped.
    NoTarget,
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub delivered: u64,
    pub dropped_no_target: u64,
    pub dropped_transform_error: u64,
}
