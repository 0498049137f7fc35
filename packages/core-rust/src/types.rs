use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier correlating a request with its eventual response.
///
/// Generated once per outstanding call as 32 lowercase hex characters
/// (a v4 UUID without hyphens).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrows the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the identifier, returning the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CallerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The outcome of one correlated call as seen by the caller.
///
/// `data` is `Value::Null` when nothing was returned (sender timeout,
/// missing subscriber).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub data: Value,
    pub code: u16,
}

impl Reply {
    #[must_use]
    pub fn new(data: Value, code: u16) -> Self {
        Self { data, code }
    }

    /// A reply with no body, used for synthetic outcomes (404, 499).
    #[must_use]
    pub fn empty(code: u16) -> Self {
        Self {
            data: Value::Null,
            code,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == crate::codes::OK
    }
}

/// Combines an upstream payload with a step's message template.
///
/// - no template: the upstream value passes through unchanged
/// - both objects: keys are merged, template keys win
/// - otherwise the template replaces the upstream value
#[must_use]
pub fn merge_template(upstream: Value, template: Option<&Value>) -> Value {
    match (upstream, template) {
        (upstream, None) => upstream,
        (Value::Object(mut base), Some(Value::Object(overlay))) => {
            for (key, value) in overlay {
                base.insert(key.clone(), value.clone());
            }
            Value::Object(base)
        }
        (_, Some(template)) => template.clone(),
    }
}

/// Truthiness used by transform steps: `null` and `false` fail, all else passes.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}
