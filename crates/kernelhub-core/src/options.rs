//! Kernel launch options and their boundary validation.
//!
//! Options arrive either typed (from the host) or as an untyped JSON object
//! (from a consumer). Untyped input is checked against a tiny schema: no
//! unknown properties, required properties present, every present property
//! of the declared type.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// JSON type a schema field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
}

impl FieldType {
    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
        }
    }
}

/// One property of an object schema.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

/// Schema for session creation options.
pub const KERNEL_OPTIONS_SCHEMA: &[Field] = &[
    Field {
        name: "cmd",
        ty: FieldType::String,
        required: true,
    },
    Field {
        name: "cwd",
        ty: FieldType::String,
        required: false,
    },
];

/// Check `value` against `schema`, returning the object on success.
pub fn validate_object<'a>(
    value: &'a Value,
    schema: &[Field],
) -> Result<&'a Map<String, Value>, ValidationError> {
    let Some(obj) = value.as_object() else {
        return Err(ValidationError::NotAnObject {
            found: describe(value),
        });
    };

    let mut unknown: Vec<String> = obj
        .keys()
        .filter(|key| !schema.iter().any(|f| f.name == key.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(ValidationError::UnknownProperties { names: unknown });
    }

    for field in schema {
        match obj.get(field.name) {
            None if field.required => {
                return Err(ValidationError::MissingProperty {
                    name: field.name.to_string(),
                });
            }
            Some(v) if !field.ty.accepts(v) => {
                return Err(ValidationError::InvalidType {
                    name: field.name.to_string(),
                    expected: field.ty.name().to_string(),
                    found: describe(v),
                });
            }
            _ => {}
        }
    }

    Ok(obj)
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

/// Options for starting a kernel process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelOptions {
    /// Command that starts the kernel, e.g. `python3`.
    pub cmd: String,
    /// Working directory for the kernel process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl KernelOptions {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Build options from untyped input, rejecting anything off-schema.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let obj = validate_object(value, KERNEL_OPTIONS_SCHEMA)?;
        let cmd = obj
            .get("cmd")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let cwd = obj.get("cwd").and_then(Value::as_str).map(PathBuf::from);
        let options = Self { cmd, cwd };
        options.validate()?;
        Ok(options)
    }

    /// Checks that hold for typed options too.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cmd.trim().is_empty() {
            return Err(ValidationError::Empty {
                name: "cmd".to_string(),
            });
        }
        if self
            .cwd
            .as_ref()
            .is_some_and(|cwd| cwd.as_os_str().is_empty())
        {
            return Err(ValidationError::Empty {
                name: "cwd".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_cmd_only() {
        let options = KernelOptions::from_value(&json!({"cmd": "python3"})).unwrap();
        assert_eq!(options, KernelOptions::new("python3"));
    }

    #[test]
    fn accepts_cmd_and_cwd() {
        let options =
            KernelOptions::from_value(&json!({"cmd": "python3", "cwd": "/tmp"})).unwrap();
        assert_eq!(options.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn rejects_unknown_property() {
        let err = KernelOptions::from_value(&json!({"cmd": "python3", "env": {}, "args": []}))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownProperties {
                names: vec!["args".to_string(), "env".to_string()]
            }
        );
        assert_eq!(err.to_string(), "Properties args,env are not allowed");
    }

    #[test]
    fn rejects_missing_cmd() {
        let err = KernelOptions::from_value(&json!({"cwd": "/tmp"})).unwrap_err();
        assert!(matches!(err, ValidationError::MissingProperty { ref name } if name == "cmd"));
    }

    #[test]
    fn rejects_wrong_types() {
        let err = KernelOptions::from_value(&json!({"cmd": 42})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidType { ref name, .. } if name == "cmd"));

        let err = KernelOptions::from_value(&json!({"cmd": "python", "cwd": false})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid property cwd: expected string but got false"
        );
    }

    #[test]
    fn rejects_non_object() {
        let err = KernelOptions::from_value(&json!("python3")).unwrap_err();
        assert!(matches!(err, ValidationError::NotAnObject { .. }));
    }

    #[test]
    fn rejects_empty_cmd() {
        let err = KernelOptions::from_value(&json!({"cmd": "  "})).unwrap_err();
        assert!(matches!(err, ValidationError::Empty { .. }));
        assert!(KernelOptions::new("").validate().is_err());
    }
}
