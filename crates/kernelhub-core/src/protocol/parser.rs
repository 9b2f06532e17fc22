//! NDJSON reader and writer for the kernel protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! surfaced as `KernelFrame::Unknown` for the caller to log.

use serde_json::Value;

use super::types::{Channel, HostFrame, KernelEvent, KernelFrame, Response};
use crate::error::{Error, Result};

/// Parse a single NDJSON line from a kernel's stdout.
pub fn parse_line(line: &str) -> Result<KernelFrame> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a kernel frame.
pub fn parse_value(raw: &Value) -> Result<KernelFrame> {
    let frame_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Protocol("Missing 'type' field".into()))?;

    match frame_type {
        "ready" => Ok(KernelFrame::Ready),
        "response" => parse_response(raw),
        "event" => parse_event(raw),
        _ => Ok(KernelFrame::Unknown {
            frame_type: frame_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn parse_response(raw: &Value) -> Result<KernelFrame> {
    let id = raw
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Protocol("Response without 'id'".into()))?
        .to_string();

    let outcome = match raw.get("error") {
        Some(Value::Null) | None => Ok(raw.get("result").cloned().unwrap_or(Value::Null)),
        Some(Value::String(message)) => Err(message.clone()),
        Some(other) => Err(other.to_string()),
    };

    Ok(KernelFrame::Response(Response { id, outcome }))
}

fn parse_event(raw: &Value) -> Result<KernelFrame> {
    let channel = raw
        .get("channel")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Protocol("Event without 'channel'".into()))?
        .parse::<Channel>()
        .map_err(Error::Protocol)?;

    let payload = raw.get("payload").cloned().unwrap_or(Value::Null);

    Ok(KernelFrame::Event(KernelEvent { channel, payload }))
}

/// Serialize a host frame as a single line (no trailing newline).
pub fn encode(frame: &HostFrame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::Method;
    use serde_json::json;

    #[test]
    fn parse_ready() {
        assert_eq!(parse_line(r#"{"type":"ready"}"#).unwrap(), KernelFrame::Ready);
    }

    #[test]
    fn parse_successful_response() {
        let frame =
            parse_line(r#"{"type":"response","id":"r1","result":{"status":"ok"}}"#).unwrap();
        let KernelFrame::Response(response) = frame else {
            panic!("expected response");
        };
        assert_eq!(response.id, "r1");
        assert_eq!(response.outcome, Ok(json!({"status": "ok"})));
    }

    #[test]
    fn parse_error_response() {
        let frame =
            parse_line(r#"{"type":"response","id":"r2","result":null,"error":"NameError"}"#)
                .unwrap();
        let KernelFrame::Response(response) = frame else {
            panic!("expected response");
        };
        assert_eq!(response.outcome, Err("NameError".to_string()));
    }

    #[test]
    fn parse_event_on_known_channel() {
        let frame = parse_line(
            r#"{"type":"event","channel":"input_request","payload":{"prompt":"? "}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            KernelFrame::Event(KernelEvent::new(
                Channel::InputRequest,
                json!({"prompt": "? "})
            ))
        );
    }

    #[test]
    fn event_on_unknown_channel_is_an_error() {
        let err = parse_line(r#"{"type":"event","channel":"control","payload":{}}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn tolerant_reader_ignores_unknown_fields() {
        assert!(parse_line(r#"{"type":"ready","pid":1234,"version":"3.12"}"#).is_ok());
    }

    #[test]
    fn unknown_type_returns_unknown_frame() {
        let msg = parse_line(r#"{"type":"heartbeat","n":1}"#).unwrap();
        assert!(matches!(
            msg,
            KernelFrame::Unknown { ref frame_type, .. } if frame_type == "heartbeat"
        ));
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(parse_line(r#"{"id":"x"}"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn encode_request_is_single_line() {
        let line = encode(&HostFrame::Request {
            id: "abc".into(),
            method: Method::GetAutoComplete,
            args: json!({"text": "pri", "cursor_pos": 3}),
        })
        .unwrap();
        assert!(!line.contains('\n'));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["method"], "get_auto_complete");
        assert_eq!(value["args"]["cursor_pos"], 3);
    }

    #[test]
    fn encode_cancel() {
        let line = encode(&HostFrame::Cancel { id: "abc".into() }).unwrap();
        assert_eq!(line, r#"{"type":"cancel","id":"abc"}"#);
    }
}
