//! Typed access to opaque check parameters.
//!
//! Parameters arrive either as JSON (target configuration) or as strings
//! (runner environment), so every accessor accepts both encodings.

use serde_json::{Map, Value};
use std::time::Duration;

use super::ProbeError;

/// Borrowed view over a JSON object of check parameters.
#[derive(Debug, Clone, Copy)]
pub struct ParamMap<'a> {
    inner: &'a Map<String, Value>,
}

impl<'a> ParamMap<'a> {
    pub fn from_value(value: &'a Value) -> Result<Self, ProbeError> {
        match value {
            Value::Object(inner) => Ok(Self { inner }),
            _ => Err(ProbeError::InvalidParam {
                name: "params",
                reason: "expected an object".to_string(),
            }),
        }
    }

    /// Look up a parameter; empty strings and nulls count as absent.
    fn get(&self, name: &str) -> Option<&'a Value> {
        match self.inner.get(name) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(v) => Some(v),
        }
    }

    pub fn required_str(&self, name: &'static str) -> Result<String, ProbeError> {
        self.optional_str(name)?.ok_or(ProbeError::MissingParam(name))
    }

    pub fn optional_str(&self, name: &'static str) -> Result<Option<String>, ProbeError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(other) => Err(invalid(name, format!("expected a string, got {}", other))),
        }
    }

    pub fn optional_u64(&self, name: &'static str) -> Result<Option<u64>, ProbeError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid(name, format!("expected a non-negative integer, got {}", n))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| invalid(name, format!("{:?}: {}", s, e))),
            Some(other) => Err(invalid(name, format!("expected an integer, got {}", other))),
        }
    }

    pub fn required_port(&self, name: &'static str) -> Result<u16, ProbeError> {
        self.optional_port(name)?.ok_or(ProbeError::MissingParam(name))
    }

    pub fn optional_port(&self, name: &'static str) -> Result<Option<u16>, ProbeError> {
        match self.optional_u64(name)? {
            None => Ok(None),
            Some(0) => Err(invalid(name, "port must be between 1 and 65535")),
            Some(p) => u16::try_from(p)
                .map(Some)
                .map_err(|_| invalid(name, "port must be between 1 and 65535")),
        }
    }

    /// A timeout given in whole seconds.
    pub fn timeout_secs(&self, name: &'static str, default: Duration) -> Result<Duration, ProbeError> {
        match self.optional_u64(name)? {
            None => Ok(default),
            Some(0) => Err(invalid(name, "timeout must be at least one second")),
            Some(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    /// A list given as a JSON array of strings or a comma separated string.
    pub fn string_list(&self, name: &'static str) -> Result<Vec<String>, ProbeError> {
        match self.get(name) {
            None => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(split_list(s)),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.trim().to_string()),
                    other => Err(invalid(name, format!("expected strings, got {}", other))),
                })
                .filter(|item| !matches!(item, Ok(s) if s.is_empty()))
                .collect(),
            Some(other) => Err(invalid(name, format!("expected a list, got {}", other))),
        }
    }

    /// Header pairs given as a JSON object or as `Key:Value,Key:Value`.
    pub fn header_pairs(&self, name: &'static str) -> Result<Vec<(String, String)>, ProbeError> {
        match self.get(name) {
            None => Ok(Vec::new()),
            Some(Value::String(s)) => split_list(s)
                .into_iter()
                .map(|pair| match pair.split_once(':') {
                    Some((k, v)) if !k.trim().is_empty() => {
                        Ok((k.trim().to_string(), v.trim().to_string()))
                    }
                    _ => Err(invalid(name, format!("expected Key:Value, got {:?}", pair))),
                })
                .collect(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k.clone(), s.clone())),
                    other => Err(invalid(name, format!("header {} must be a string, got {}", k, other))),
                })
                .collect(),
            Some(other) => Err(invalid(name, format!("expected an object, got {}", other))),
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ProbeError {
    ProbeError::InvalidParam {
        name,
        reason: reason.into(),
    }
}
