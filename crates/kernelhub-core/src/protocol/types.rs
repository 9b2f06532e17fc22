//! Frame types for the kernel NDJSON protocol.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named stream a kernel publishes unsolicited events on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Event,
    InputRequest,
    Error,
}

impl Channel {
    /// Every channel a kernel may emit on.
    pub const ALL: [Self; 6] = [
        Self::Shell,
        Self::Iopub,
        Self::Stdin,
        Self::Event,
        Self::InputRequest,
        Self::Error,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Iopub => "iopub",
            Self::Stdin => "stdin",
            Self::Event => "event",
            Self::InputRequest => "input_request",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel: {s}"))
    }
}

/// Request methods understood by a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Execute,
    ExecuteHidden,
    Eval,
    GetAutoComplete,
    GetInspection,
    GetStatus,
    IsComplete,
    Interrupt,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::ExecuteHidden => "execute_hidden",
            Self::Eval => "eval",
            Self::GetAutoComplete => "get_auto_complete",
            Self::GetInspection => "get_inspection",
            Self::GetStatus => "get_status",
            Self::IsComplete => "is_complete",
            Self::Interrupt => "interrupt",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unsolicited event published by a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvent {
    pub channel: Channel,
    pub payload: Value,
}

impl KernelEvent {
    pub const fn new(channel: Channel, payload: Value) -> Self {
        Self { channel, payload }
    }

    /// The `msg_type` of the payload, if it has one.
    pub fn msg_type(&self) -> Option<&str> {
        self.payload.get("msg_type").and_then(Value::as_str)
    }
}

/// Reply to a host request, correlated by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub outcome: Result<Value, String>,
}

/// Frames a kernel writes to its stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelFrame {
    Ready,
    Response(Response),
    Event(KernelEvent),
    Unknown { frame_type: String, payload: Value },
}

/// Frames the host writes to a kernel's stdin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Request {
        id: String,
        method: Method,
        args: Value,
    },
    Cancel {
        id: String,
    },
}
