//! Structured payload published on the error broadcast channel.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One error-class outcome, as broadcast to `<ns>.error` (or a configured topic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Final status code of the failed call.
    pub code: u16,
    /// Caller id of the failed call, if the request carried one.
    pub sender: Option<String>,
    /// Topic the handler was subscribed on.
    pub topic: String,
    /// Request body as received by the handler.
    pub request_data: Value,
    /// Response body (error description for 500/504).
    pub userdata: Value,
    /// Failure detail: error chain, panic message, or worker diagnostics.
    pub backtrace: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Whether the handler ran in an isolated worker.
    pub multi_process: bool,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
