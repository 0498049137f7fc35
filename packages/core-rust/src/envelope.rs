//! JSON wire envelope shared by requests, signals, and responses.
//!
//! Every payload on the transport is `{ "data": any, "code": int|null,
//! "sender": string }`. Payloads that are not JSON objects are tolerated:
//! they surface as raw `data` with no sender.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::CallerId;

/// Wire unit for every call and response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Arbitrary body.
    #[serde(default)]
    pub data: Value,
    /// Status code; `None` on requests and signals.
    #[serde(default)]
    pub code: Option<u16>,
    /// Caller identifier the response must be addressed to.
    #[serde(default)]
    pub sender: Option<String>,
}

impl Envelope {
    #[must_use]
    pub fn new(data: Value, code: Option<u16>, sender: &CallerId) -> Self {
        Self {
            data,
            code,
            sender: Some(sender.as_str().to_string()),
        }
    }

    /// Serializes the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the body contains a value `serde_json` refuses
    /// to encode (non-string map keys are impossible for `Value`, so in
    /// practice this only fails on I/O-level writer errors).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Fields extracted from an inbound request or signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub data: Value,
    pub sender: Option<String>,
}

/// Fields extracted from an inbound response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub data: Value,
    pub code: Option<u16>,
    pub sender: Option<String>,
}

/// Parses a raw payload, falling back to a JSON string for non-JSON input.
fn sanitised_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::trace!(error = %err, len = raw.len(), "non-JSON payload passed through raw");
        Value::String(raw.to_string())
    })
}

fn field_code(value: Option<&Value>) -> Option<u16> {
    value
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
}

fn field_sender(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

/// Extracts `(data, sender)` from a request payload.
#[must_use]
pub fn parse_request(raw: &str) -> ParsedRequest {
    match sanitised_payload(raw) {
        Value::Object(mut map) => ParsedRequest {
            sender: field_sender(map.get("sender")),
            data: map.remove("data").unwrap_or(Value::Null),
        },
        other => ParsedRequest {
            data: other,
            sender: None,
        },
    }
}

/// Extracts `(data, code, sender)` from a response payload.
#[must_use]
pub fn parse_response(raw: &str) -> ParsedResponse {
    match sanitised_payload(raw) {
        Value::Object(mut map) => ParsedResponse {
            code: field_code(map.get("code")),
            sender: field_sender(map.get("sender")),
            data: map.remove("data").unwrap_or(Value::Null),
        },
        other => ParsedResponse {
            data: other,
            code: None,
            sender: None,
        },
    }
}

/// Builds an encoded request payload, generating a sender when none is given.
///
/// # Errors
///
/// Propagates JSON encoding failures from [`Envelope::encode`].
pub fn create_request(
    data: Value,
    code: Option<u16>,
    sender: Option<CallerId>,
) -> Result<(String, CallerId), serde_json::Error> {
    let sender = sender.unwrap_or_else(CallerId::generate);
    let payload = Envelope::new(data, code, &sender).encode()?;
    Ok((payload, sender))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_fields_are_extracted() {
        let (payload, sender) =
            create_request(json!({"ping": true}), None, Some(CallerId::from("s1"))).unwrap();
        assert_eq!(sender.as_str(), "s1");

        let parsed = parse_request(&payload);
        assert_eq!(parsed.data, json!({"ping": true}));
        assert_eq!(parsed.sender.as_deref(), Some("s1"));
    }

    #[test]
    fn response_fields_are_extracted() {
        let payload = r#"{"data":"Pong!","code":200,"sender":"abc"}"#;
        let parsed = parse_response(payload);
        assert_eq!(parsed.data, json!("Pong!"));
        assert_eq!(parsed.code, Some(200));
        assert_eq!(parsed.sender.as_deref(), Some("abc"));
    }

    #[test]
    fn generated_sender_when_absent() {
        let (payload, sender) = create_request(json!(1), Some(500), None).unwrap();
        let parsed = parse_response(&payload);
        assert_eq!(parsed.sender.as_deref(), Some(sender.as_str()));
        assert_eq!(parsed.code, Some(500));
    }

    #[test]
    fn non_json_payload_passes_through_raw() {
        let parsed = parse_request("hello there");
        assert_eq!(parsed.data, json!("hello there"));
        assert!(parsed.sender.is_none());

        let parsed = parse_response("not { json");
        assert_eq!(parsed.data, json!("not { json"));
        assert!(parsed.code.is_none());
        assert!(parsed.sender.is_none());
    }

    #[test]
    fn json_scalar_payload_is_raw_data() {
        let parsed = parse_request("42");
        assert_eq!(parsed.data, json!(42));
        assert!(parsed.sender.is_none());
    }

    #[test]
    fn out_of_range_code_is_dropped() {
        let parsed = parse_response(r#"{"data":null,"code":70000,"sender":"x"}"#);
        assert!(parsed.code.is_none());
    }

    #[test]
    fn null_code_serializes_as_null() {
        let env = Envelope::new(json!("x"), None, &CallerId::from("id"));
        let encoded: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(encoded, json!({"data": "x", "code": null, "sender": "id"}));
    }
}
