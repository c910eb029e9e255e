use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::{OwnerInfo, Owners, Task};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("expected {expected}, found {found}")]
    Shape {
        expected: &'static str,
        found: &'static str,
    },
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Parse {
            line: err.line(),
            column: err.column(),
            message: err.to_string(),
        }
    }
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[tracing::instrument(skip(text), fields(len = text.len()))]
pub fn decode(text: &str) -> Result<Value, CodecError> {
    Ok(serde_json::from_str(text)?)
}

pub fn decode_tasks(text: &str) -> Result<Vec<Task>, CodecError> {
    match decode(text)? {
        Value::Array(items) => Ok(items.into_iter().map(Task::new).collect()),
        other => Err(CodecError::Shape {
            expected: "an array of tasks",
            found: kind_of(&other),
        }),
    }
}

pub fn decode_owners(text: &str) -> Result<Owners, CodecError> {
    match decode(text)? {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, info)| (key, OwnerInfo::new(info)))
            .collect()),
        other => Err(CodecError::Shape {
            expected: "an object keyed by owner",
            found: kind_of(&other),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
